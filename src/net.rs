//! Conveyor-based networking primitives.
//!
//! All sockets are created non-blocking and close-on-exec and register
//! themselves with the event port at construction; readiness arrives
//! through the owning object's feeders.

use std::cell::RefCell;
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::{Rc, Weak};

use log::{trace, warn};

use crate::conveyor::{
    new_conveyor_and_feeder, one_time_conveyor_and_feeder, Conveyor, ConveyorFeeder,
};
use crate::error::{Code, Error, Result};
use crate::io::{InputStream, IoStream, OutputStream};
use crate::reactor::{FdObserver, FdRegistration, Interest, Readiness, UnixEventPort};
use crate::sys::unix::net as sys;
use crate::sys::unix::syscall;

/// A resolved address: the original host/port pair plus the socket
/// addresses it mapped to.
#[derive(Debug, Clone)]
pub struct NetworkAddress {
    host: String,
    port: u16,
    addresses: Vec<SocketAddr>,
}

impl NetworkAddress {
    fn resolve(host: &str, port_hint: u16) -> Result<NetworkAddress> {
        let lookup_host = match host {
            // Wildcard binds accept both protocol families.
            "*" => "0.0.0.0",
            other => other,
        };
        let addresses: Vec<SocketAddr> = (lookup_host, port_hint)
            .to_socket_addrs()
            .map_err(Error::from)?
            .collect();
        if addresses.is_empty() {
            return Err(Error::new(Code::Os, "address resolved to nothing"));
        }
        Ok(NetworkAddress {
            host: host.to_string(),
            port: port_hint,
            addresses,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addrs(&self) -> &[SocketAddr] {
        &self.addresses
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(addr: SocketAddr) -> NetworkAddress {
        NetworkAddress {
            host: addr.ip().to_string(),
            port: addr.port(),
            addresses: vec![addr],
        }
    }
}

/// Entry point for sockets bound to one event port.
#[derive(Clone)]
pub struct Network {
    port: Rc<UnixEventPort>,
}

impl Network {
    pub fn new(port: Rc<UnixEventPort>) -> Network {
        Network { port }
    }

    /// Resolves `host` and `port_hint` to a [`NetworkAddress`]. `*` and
    /// `::` are wildcards.
    pub fn resolve_address(&self, host: &str, port_hint: u16) -> Conveyor<NetworkAddress> {
        match NetworkAddress::resolve(host, port_hint) {
            Ok(address) => Conveyor::immediate(address),
            Err(error) => Conveyor::failed(error),
        }
    }

    /// Sets up a listener on `address`.
    pub fn listen(&self, address: &NetworkAddress) -> Result<Server> {
        let addr = first_address(address)?;
        let fd = sys::new_socket(address_family(&addr), libc::SOCK_STREAM)?;

        let reuse: libc::c_int = 1;
        syscall!(setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuse as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))?;

        let (raw, len) = sys::from_socket_addr(&addr);
        syscall!(bind(fd.as_raw_fd(), raw.as_ptr(), len))?;
        syscall!(listen(fd.as_raw_fd(), 1024))?;

        Server::from_owned(&self.port, fd)
    }

    /// Connects to `address`. The conveyor delivers the connected stream
    /// once the socket reports writability.
    pub fn connect(&self, address: &NetworkAddress) -> Conveyor<Box<dyn IoStream>> {
        match self.connect_impl(address) {
            Ok(conveyor) => conveyor,
            Err(error) => Conveyor::failed(error),
        }
    }

    fn connect_impl(&self, address: &NetworkAddress) -> Result<Conveyor<Box<dyn IoStream>>> {
        let addr = first_address(address)?;
        let fd = sys::new_socket(address_family(&addr), libc::SOCK_STREAM)?;

        let (raw, len) = sys::from_socket_addr(&addr);
        match syscall!(connect(fd.as_raw_fd(), raw.as_ptr(), len)) {
            Ok(_) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) => return Err(err.into()),
        }

        let pair = one_time_conveyor_and_feeder::<Box<dyn IoStream>>();
        let raw_fd = fd.as_raw_fd();
        let pending = Rc::new(PendingConnect {
            port: self.port.clone(),
            fd: RefCell::new(Some(fd)),
            feeder: RefCell::new(Some(pair.feeder)),
            registration: RefCell::new(None),
        });
        let pending_dyn: Rc<dyn FdObserver> = pending.clone();
        let observer: Weak<dyn FdObserver> = Rc::downgrade(&pending_dyn);
        let registration = FdRegistration::new(&self.port, raw_fd, Interest::WRITABLE, observer)?;
        *pending.registration.borrow_mut() = Some(registration);

        Ok(pair.conveyor.attach(pending))
    }

    /// Binds a datagram socket at `address`.
    pub fn datagram(&self, address: &NetworkAddress) -> Result<Datagram> {
        let addr = first_address(address)?;
        let fd = sys::new_socket(address_family(&addr), libc::SOCK_DGRAM)?;
        let (raw, len) = sys::from_socket_addr(&addr);
        syscall!(bind(fd.as_raw_fd(), raw.as_ptr(), len))?;
        Datagram::from_owned(&self.port, fd)
    }

    /// An AF_UNIX stream pair with both ends registered with the port.
    pub fn socket_pair(&self) -> Result<(UnixIoStream, UnixIoStream)> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        syscall!(socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        ))?;
        // SAFETY: `socketpair(2)` returned two valid, owned fds.
        let a = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let b = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        Ok((
            UnixIoStream::from_owned(&self.port, a)?,
            UnixIoStream::from_owned(&self.port, b)?,
        ))
    }

    /// Wraps an externally created descriptor as a stream. The fd must
    /// already be non-blocking.
    pub fn wrap_fd(&self, fd: OwnedFd) -> Result<UnixIoStream> {
        UnixIoStream::from_owned(&self.port, fd)
    }
}

fn first_address(address: &NetworkAddress) -> Result<SocketAddr> {
    address
        .addresses
        .first()
        .copied()
        .ok_or_else(|| Error::new(Code::InvalidState, "network address has no socket address"))
}

fn address_family(addr: &SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

struct StreamInner {
    // Declared before `fd` so the port forgets the fd before it closes.
    registration: RefCell<Option<FdRegistration>>,
    fd: OwnedFd,
    read_ready: RefCell<Option<Box<dyn ConveyorFeeder<()>>>>,
    write_ready: RefCell<Option<Box<dyn ConveyorFeeder<()>>>>,
    read_disconnected: RefCell<Option<Box<dyn ConveyorFeeder<()>>>>,
}

impl FdObserver for StreamInner {
    fn notify(&self, readiness: Readiness) {
        if readiness.is_readable() {
            if let Some(feeder) = &mut *self.read_ready.borrow_mut() {
                feeder.feed(());
            }
        }
        if readiness.is_writable() {
            if let Some(feeder) = &mut *self.write_ready.borrow_mut() {
                feeder.feed(());
            }
        }
        if readiness.is_read_closed() {
            if let Some(feeder) = &mut *self.read_disconnected.borrow_mut() {
                feeder.feed(());
            }
        }
    }
}

/// A non-blocking stream socket owned by the event port's loop.
pub struct UnixIoStream {
    inner: Rc<StreamInner>,
}

impl UnixIoStream {
    pub(crate) fn from_owned(port: &Rc<UnixEventPort>, fd: OwnedFd) -> Result<UnixIoStream> {
        let inner = Rc::new(StreamInner {
            registration: RefCell::new(None),
            fd,
            read_ready: RefCell::new(None),
            write_ready: RefCell::new(None),
            read_disconnected: RefCell::new(None),
        });
        let inner_dyn: Rc<dyn FdObserver> = inner.clone();
        let observer: Weak<dyn FdObserver> = Rc::downgrade(&inner_dyn);
        let registration = FdRegistration::new(
            port,
            inner.fd.as_raw_fd(),
            Interest::READABLE | Interest::WRITABLE,
            observer,
        )?;
        *inner.registration.borrow_mut() = Some(registration);
        Ok(UnixIoStream { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        socket_name(self.inner.fd.as_raw_fd(), libc::getsockname)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        socket_name(self.inner.fd.as_raw_fd(), libc::getpeername)
    }
}

impl InputStream for UnixIoStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let n = unsafe {
                libc::read(
                    self.inner.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }

    fn read_ready(&mut self) -> Conveyor<()> {
        let pair = new_conveyor_and_feeder();
        *self.inner.read_ready.borrow_mut() = Some(pair.feeder);
        pair.conveyor
    }

    fn on_read_disconnected(&mut self) -> Conveyor<()> {
        let pair = new_conveyor_and_feeder();
        *self.inner.read_disconnected.borrow_mut() = Some(pair.feeder);
        pair.conveyor
    }
}

impl OutputStream for UnixIoStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        loop {
            let n = unsafe {
                libc::write(
                    self.inner.fd.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }

    fn write_ready(&mut self) -> Conveyor<()> {
        let pair = new_conveyor_and_feeder();
        *self.inner.write_ready.borrow_mut() = Some(pair.feeder);
        pair.conveyor
    }
}

impl IoStream for UnixIoStream {}

fn socket_name(
    fd: libc::c_int,
    f: unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
) -> Result<SocketAddr> {
    // SAFETY: the kernel fills at most sizeof(sockaddr_storage) bytes.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let res = unsafe { f(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if res == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: filled by the kernel above.
    unsafe { sys::to_socket_addr(&storage) }.map_err(Error::from)
}

struct ServerInner {
    registration: RefCell<Option<FdRegistration>>,
    fd: OwnedFd,
    port: Rc<UnixEventPort>,
    accept_feeder: RefCell<Option<Box<dyn ConveyorFeeder<Box<dyn IoStream>>>>>,
}

impl ServerInner {
    fn accept_pending(&self) {
        if self.accept_feeder.borrow().is_none() {
            return;
        }
        loop {
            let accepted = syscall!(accept4(
                self.fd.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            ));
            let fd = match accepted {
                Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    break;
                }
            };
            match UnixIoStream::from_owned(&self.port, fd) {
                Ok(stream) => {
                    if let Some(feeder) = &mut *self.accept_feeder.borrow_mut() {
                        feeder.feed(Box::new(stream));
                    }
                }
                Err(err) => warn!("registering accepted stream failed: {}", err),
            }
        }
    }
}

impl FdObserver for ServerInner {
    fn notify(&self, readiness: Readiness) {
        if readiness.is_readable() {
            self.accept_pending();
        }
    }
}

/// A listening socket yielding accepted streams through a conveyor.
pub struct Server {
    inner: Rc<ServerInner>,
}

impl Server {
    fn from_owned(port: &Rc<UnixEventPort>, fd: OwnedFd) -> Result<Server> {
        let inner = Rc::new(ServerInner {
            registration: RefCell::new(None),
            fd,
            port: port.clone(),
            accept_feeder: RefCell::new(None),
        });
        let inner_dyn: Rc<dyn FdObserver> = inner.clone();
        let observer: Weak<dyn FdObserver> = Rc::downgrade(&inner_dyn);
        let registration =
            FdRegistration::new(port, inner.fd.as_raw_fd(), Interest::READABLE, observer)?;
        *inner.registration.borrow_mut() = Some(registration);
        trace!("listening on fd {}", inner.fd.as_raw_fd());
        Ok(Server { inner })
    }

    /// Streams accepted by this listener. Connections already in the
    /// backlog are drained immediately.
    pub fn accept(&mut self) -> Conveyor<Box<dyn IoStream>> {
        let pair = new_conveyor_and_feeder();
        *self.inner.accept_feeder.borrow_mut() = Some(pair.feeder);
        self.inner.accept_pending();
        pair.conveyor
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        socket_name(self.inner.fd.as_raw_fd(), libc::getsockname)
    }
}

struct DatagramInner {
    registration: RefCell<Option<FdRegistration>>,
    fd: OwnedFd,
    read_ready: RefCell<Option<Box<dyn ConveyorFeeder<()>>>>,
    write_ready: RefCell<Option<Box<dyn ConveyorFeeder<()>>>>,
}

impl FdObserver for DatagramInner {
    fn notify(&self, readiness: Readiness) {
        if readiness.is_readable() {
            if let Some(feeder) = &mut *self.read_ready.borrow_mut() {
                feeder.feed(());
            }
        }
        if readiness.is_writable() {
            if let Some(feeder) = &mut *self.write_ready.borrow_mut() {
                feeder.feed(());
            }
        }
    }
}

/// A bound datagram socket.
pub struct Datagram {
    inner: Rc<DatagramInner>,
}

impl Datagram {
    fn from_owned(port: &Rc<UnixEventPort>, fd: OwnedFd) -> Result<Datagram> {
        let inner = Rc::new(DatagramInner {
            registration: RefCell::new(None),
            fd,
            read_ready: RefCell::new(None),
            write_ready: RefCell::new(None),
        });
        let inner_dyn: Rc<dyn FdObserver> = inner.clone();
        let observer: Weak<dyn FdObserver> = Rc::downgrade(&inner_dyn);
        let registration = FdRegistration::new(
            port,
            inner.fd.as_raw_fd(),
            Interest::READABLE | Interest::WRITABLE,
            observer,
        )?;
        *inner.registration.borrow_mut() = Some(registration);
        Ok(Datagram { inner })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = unsafe {
            libc::recv(
                self.inner.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n >= 0 {
            Ok(n as usize)
        } else {
            Err(std::io::Error::last_os_error().into())
        }
    }

    pub fn write(&mut self, buf: &[u8], dest: &NetworkAddress) -> Result<usize> {
        let addr = first_address(dest)?;
        let (raw, len) = sys::from_socket_addr(&addr);
        let n = unsafe {
            libc::sendto(
                self.inner.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                raw.as_ptr(),
                len,
            )
        };
        if n >= 0 {
            Ok(n as usize)
        } else {
            Err(std::io::Error::last_os_error().into())
        }
    }

    pub fn read_ready(&mut self) -> Conveyor<()> {
        let pair = new_conveyor_and_feeder();
        *self.inner.read_ready.borrow_mut() = Some(pair.feeder);
        pair.conveyor
    }

    pub fn write_ready(&mut self) -> Conveyor<()> {
        let pair = new_conveyor_and_feeder();
        *self.inner.write_ready.borrow_mut() = Some(pair.feeder);
        pair.conveyor
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        socket_name(self.inner.fd.as_raw_fd(), libc::getsockname)
    }
}

struct PendingConnect {
    port: Rc<UnixEventPort>,
    fd: RefCell<Option<OwnedFd>>,
    feeder: RefCell<Option<Box<dyn ConveyorFeeder<Box<dyn IoStream>>>>>,
    registration: RefCell<Option<FdRegistration>>,
}

impl FdObserver for PendingConnect {
    fn notify(&self, readiness: Readiness) {
        if !readiness.is_writable() && !readiness.is_error() && !readiness.is_write_closed() {
            return;
        }
        let Some(fd) = self.fd.borrow_mut().take() else {
            return;
        };
        // The completion re-registers the fd with full interests.
        self.registration.borrow_mut().take();
        let Some(mut feeder) = self.feeder.borrow_mut().take() else {
            return;
        };
        match sys::take_socket_error(fd.as_raw_fd()) {
            Ok(()) => match UnixIoStream::from_owned(&self.port, fd) {
                Ok(stream) => feeder.feed(Box::new(stream)),
                Err(error) => feeder.fail(error),
            },
            Err(err) => feeder.fail(err.into()),
        }
    }
}
