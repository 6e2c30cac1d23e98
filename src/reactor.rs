//! The readiness reactor.
//!
//! [`UnixEventPort`] multiplexes file-descriptor readiness, signal delivery,
//! and cross-thread wakeups into the scheduler. FD owners subscribe with an
//! [`Interest`] mask and receive portable [`Readiness`] notifications;
//! signals are delivered through a dedicated descriptor to conveyor feeders;
//! [`Waker::wake`] is the only API safe to call from a thread that has not
//! entered the loop.

use std::cell::RefCell;
use std::num::NonZeroU8;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, ops};

use log::{trace, warn};

use crate::conveyor::{new_conveyor_and_feeder, Conveyor, ConveyorFeeder, EventPort};
use crate::error::{Error, Result};
use crate::sys::unix::{readiness_from_epoll, Selector, SignalFd, WakePipe};

/// Associates a subscribed FD owner with the readiness events it caused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<Token> for usize {
    fn from(token: Token) -> usize {
        token.0
    }
}

const TOKEN_SIGNAL: Token = Token(0);
const TOKEN_WAKER: Token = Token(1);
const TOKEN_OBSERVER_BASE: usize = 2;

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

/// Interest used when subscribing an FD with the reactor.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Interest(NonZeroU8);

impl Interest {
    /// Readable interest.
    pub const READABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READABLE) });

    /// Writable interest.
    pub const WRITABLE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(WRITABLE) });

    /// Add together two `Interest`s; the const form of `BitOr`.
    #[allow(clippy::should_implement_trait)]
    pub const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    pub const fn is_readable(self) -> bool {
        (self.0.get() & READABLE) != 0
    }

    pub const fn is_writable(self) -> bool {
        (self.0.get() & WRITABLE) != 0
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_readable() {
            write!(fmt, "READABLE")?;
            one = true;
        }
        if self.is_writable() {
            if one {
                write!(fmt, " | ")?;
            }
            write!(fmt, "WRITABLE")?;
            one = true;
        }
        debug_assert!(one, "printing empty interests");
        Ok(())
    }
}

/// Portable readiness delivered to FD owners.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Readiness(u8);

impl Readiness {
    pub const EMPTY: Readiness = Readiness(0);
    pub const READABLE: Readiness = Readiness(0b0_0001);
    pub const WRITABLE: Readiness = Readiness(0b0_0010);
    pub const READ_CLOSED: Readiness = Readiness(0b0_0100);
    pub const WRITE_CLOSED: Readiness = Readiness(0b0_1000);
    pub const ERROR: Readiness = Readiness(0b1_0000);

    pub const fn with(self, other: Readiness) -> Readiness {
        Readiness(self.0 | other.0)
    }

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub const fn is_read_closed(self) -> bool {
        self.0 & Self::READ_CLOSED.0 != 0
    }

    pub const fn is_write_closed(self) -> bool {
        self.0 & Self::WRITE_CLOSED.0 != 0
    }

    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        for (set, name) in [
            (self.is_readable(), "READABLE"),
            (self.is_writable(), "WRITABLE"),
            (self.is_read_closed(), "READ_CLOSED"),
            (self.is_write_closed(), "WRITE_CLOSED"),
            (self.is_error(), "ERROR"),
        ] {
            if set {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        if !one {
            write!(fmt, "EMPTY")?;
        }
        Ok(())
    }
}

/// Portable signal kinds deliverable through the reactor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM, SIGINT, and SIGQUIT.
    Terminate,
    /// SIGUSR1.
    User1,
}

impl Signal {
    fn to_unix(self) -> &'static [libc::c_int] {
        match self {
            Signal::User1 => &[libc::SIGUSR1],
            Signal::Terminate => &[libc::SIGTERM, libc::SIGQUIT, libc::SIGINT],
        }
    }

    fn from_unix(signo: libc::c_int) -> Signal {
        match signo {
            libc::SIGUSR1 => Signal::User1,
            _ => Signal::Terminate,
        }
    }
}

/// Receiver of readiness notifications for one subscribed FD.
pub(crate) trait FdObserver {
    fn notify(&self, readiness: Readiness);
}

/// Cross-thread wake handle for a [`UnixEventPort`].
///
/// Writes one byte into the port's self-pipe; the port drains the pipe and
/// returns from its blocking call without delivering readiness events.
#[derive(Clone, Debug)]
pub struct Waker {
    pipe: Arc<WakePipe>,
}

impl Waker {
    /// Wakes the port's next (or current) blocking call.
    pub fn wake(&self) -> Result<()> {
        self.pipe.wake().map_err(|err| {
            warn!("wake failed: {}", err);
            Error::from(err)
        })
    }
}

struct ObserverSlab {
    slots: Vec<Option<Weak<dyn FdObserver>>>,
    free: Vec<usize>,
}

impl ObserverSlab {
    fn new() -> ObserverSlab {
        ObserverSlab {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, observer: Weak<dyn FdObserver>) -> Token {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(observer);
                index
            }
            None => {
                self.slots.push(Some(observer));
                self.slots.len() - 1
            }
        };
        Token(index + TOKEN_OBSERVER_BASE)
    }

    fn remove(&mut self, token: Token) {
        let index = token.0 - TOKEN_OBSERVER_BASE;
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = None;
            self.free.push(index);
        }
    }

    fn get(&self, token: Token) -> Option<Weak<dyn FdObserver>> {
        self.slots
            .get(token.0.checked_sub(TOKEN_OBSERVER_BASE)?)?
            .clone()
    }
}

const EVENT_CAPACITY: usize = 256;

/// The platform event port: an epoll instance multiplexing FD readiness, a
/// signalfd, and a wake pipe.
pub struct UnixEventPort {
    selector: Selector,
    signal_fd: RefCell<SignalFd>,
    signal_feeders: RefCell<Vec<(Signal, Box<dyn ConveyorFeeder<()>>)>>,
    wake_pipe: Arc<WakePipe>,
    observers: RefCell<ObserverSlab>,
    events: RefCell<Vec<libc::epoll_event>>,
}

impl UnixEventPort {
    pub fn new() -> Result<Rc<UnixEventPort>> {
        // Broken pipes surface as write errors, not process death.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let selector = Selector::new()?;

        let signal_fd = SignalFd::new()?;
        selector.register(signal_fd.as_raw_fd(), TOKEN_SIGNAL, Interest::READABLE)?;

        let wake_pipe = Arc::new(WakePipe::new()?);
        selector.register(wake_pipe.as_raw_fd(), TOKEN_WAKER, Interest::READABLE)?;

        Ok(Rc::new(UnixEventPort {
            selector,
            signal_fd: RefCell::new(signal_fd),
            signal_feeders: RefCell::new(Vec::new()),
            wake_pipe,
            observers: RefCell::new(ObserverSlab::new()),
            events: RefCell::new(Vec::with_capacity(EVENT_CAPACITY)),
        }))
    }

    /// A `Send + Sync` handle for waking this port from other threads.
    pub fn waker(&self) -> Waker {
        Waker {
            pipe: self.wake_pipe.clone(),
        }
    }

    /// A conveyor fed once per delivery of `signal`.
    pub fn on_signal(&self, signal: Signal) -> Result<Conveyor<()>> {
        let pair = new_conveyor_and_feeder::<()>();
        for &signo in signal.to_unix() {
            self.signal_fd.borrow_mut().subscribe(signo)?;
        }
        self.signal_feeders.borrow_mut().push((signal, pair.feeder));
        trace!("subscribed to signal {:?}", signal);
        Ok(pair.conveyor)
    }

    pub(crate) fn subscribe(
        &self,
        fd: RawFd,
        interest: Interest,
        observer: Weak<dyn FdObserver>,
    ) -> Result<Token> {
        let token = self.observers.borrow_mut().insert(observer);
        if let Err(err) = self.selector.register(fd, token, interest) {
            self.observers.borrow_mut().remove(token);
            return Err(err.into());
        }
        trace!("registered fd {} as {:?} with {:?}", fd, token, interest);
        Ok(token)
    }

    pub(crate) fn unsubscribe(&self, fd: RawFd, token: Token) {
        if let Err(err) = self.selector.deregister(fd) {
            trace!("deregistering fd {} failed: {}", fd, err);
        }
        self.observers.borrow_mut().remove(token);
    }

    fn dispatch(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut woken = false;
        let mut timeout = timeout;
        loop {
            let n = {
                let mut events = self.events.borrow_mut();
                let n = self.selector.select(&mut events, timeout)?;
                n
            };
            for i in 0..n {
                let event = self.events.borrow()[i];
                let token = Token(event.u64 as usize);
                match token {
                    TOKEN_SIGNAL => self.dispatch_signals(),
                    TOKEN_WAKER => {
                        self.wake_pipe.drain();
                        woken = true;
                    }
                    token => {
                        let observer = self
                            .observers
                            .borrow()
                            .get(token)
                            .and_then(|observer| observer.upgrade());
                        if let Some(observer) = observer {
                            observer.notify(readiness_from_epoll(event.events));
                        }
                    }
                }
            }
            // A full event buffer may mean more events are pending; re-poll
            // without blocking until the kernel runs dry.
            if n < EVENT_CAPACITY {
                break;
            }
            timeout = Some(Duration::ZERO);
        }
        Ok(woken)
    }

    fn dispatch_signals(&self) {
        loop {
            let info = self.signal_fd.borrow().read();
            let Some(info) = info else {
                break;
            };
            let signal = Signal::from_unix(info.ssi_signo as libc::c_int);
            trace!("delivering signal {:?}", signal);
            for (registered, feeder) in self.signal_feeders.borrow_mut().iter_mut() {
                if *registered == signal && feeder.space() > 0 {
                    feeder.feed(());
                }
            }
        }
    }
}

impl EventPort for UnixEventPort {
    fn poll(&self) -> Result<bool> {
        self.dispatch(Some(Duration::ZERO))
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        self.dispatch(timeout)
    }
}

/// A subscription tying one FD to the port for the owner's lifetime.
pub(crate) struct FdRegistration {
    port: Rc<UnixEventPort>,
    fd: RawFd,
    token: Token,
}

impl FdRegistration {
    pub(crate) fn new(
        port: &Rc<UnixEventPort>,
        fd: RawFd,
        interest: Interest,
        observer: Weak<dyn FdObserver>,
    ) -> Result<FdRegistration> {
        let token = port.subscribe(fd, interest, observer)?;
        Ok(FdRegistration {
            port: port.clone(),
            fd,
            token,
        })
    }
}

impl Drop for FdRegistration {
    fn drop(&mut self) {
        self.port.unsubscribe(self.fd, self.token);
    }
}
