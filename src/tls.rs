//! TLS transport adapter.
//!
//! The TLS engine (rustls) is opaque: it moves wire bytes only through the
//! push/pull callbacks handed to `read_tls`/`write_tls`. The shims below
//! forward those calls to the wrapped stream's synchronous `read`/`write`,
//! translating the crate's recoverable would-block error into the engine's
//! non-blocking convention.
//!
//! The handshake is a readiness-driven state machine: every read or write
//! edge of the underlying stream advances it until the session is `Ready`
//! (the wrapped stream is handed to the one-shot feeder) or `Failed`.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::rc::Rc;
use std::sync::Arc;

use log::trace;
use rustls_pki_types::ServerName;

use crate::conveyor::{
    new_conveyor_and_feeder, one_time_conveyor_and_feeder, Conveyor, ConveyorFeeder, SinkConveyor,
};
use crate::error::{Code, Error, Result};
use crate::io::{InputStream, IoStream, OutputStream};
use crate::net::{Network, NetworkAddress};

fn map_tls_error(error: rustls::Error) -> Error {
    Error::new(Code::GenericCritical, error.to_string())
}

fn map_shim_error(error: std::io::Error) -> Error {
    match error.kind() {
        std::io::ErrorKind::WouldBlock => Error::would_block(),
        _ => error.into(),
    }
}

/// Pull callback: the engine reads wire bytes from the wrapped stream.
struct PullShim<'a>(&'a mut dyn IoStream);

impl Read for PullShim<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.0.read(buf) {
            Ok(n) => Ok(n),
            Err(error) if error.code() == Code::WouldBlock => {
                Err(std::io::ErrorKind::WouldBlock.into())
            }
            Err(error) => Err(std::io::Error::other(error.to_string())),
        }
    }
}

/// Push callback: the engine writes wire bytes to the wrapped stream.
struct PushShim<'a>(&'a mut dyn IoStream);

impl Write for PushShim<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.write(buf) {
            Ok(n) => Ok(n),
            Err(error) if error.code() == Code::WouldBlock => {
                Err(std::io::ErrorKind::WouldBlock.into())
            }
            Err(error) => Err(std::io::Error::other(error.to_string())),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A TLS session over an arbitrary [`IoStream`].
///
/// Readiness conveyors delegate to the wrapped stream; `read`/`write`
/// translate engine return codes into the crate's recoverable/critical
/// errors. A zero-length plaintext read means the peer closed the session.
pub struct TlsStream {
    stream: Box<dyn IoStream>,
    session: rustls::Connection,
}

impl TlsStream {
    /// Pulls wire bytes into the session. Returns true if the transport
    /// reported end-of-file.
    fn pump_read(&mut self) -> Result<bool> {
        while self.session.wants_read() {
            match self.session.read_tls(&mut PullShim(self.stream.as_mut())) {
                Ok(0) => return Ok(true),
                Ok(_) => {
                    self.session
                        .process_new_packets()
                        .map_err(map_tls_error)?;
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(error) => return Err(map_shim_error(error)),
            }
        }
        Ok(false)
    }

    /// Pushes buffered wire bytes out as far as the transport allows.
    fn pump_write(&mut self) -> Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut PushShim(self.stream.as_mut())) {
                Ok(_) => {}
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(error) => return Err(map_shim_error(error)),
            }
        }
        Ok(())
    }
}

impl InputStream for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let transport_eof = self.pump_read()?;
        match self.session.reader().read(buf) {
            Ok(0) => Err(Error::disconnected()),
            Ok(n) => Ok(n),
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                if transport_eof {
                    Err(Error::disconnected())
                } else {
                    Err(Error::would_block())
                }
            }
            Err(error) => Err(Error::new(Code::GenericCritical, error.to_string())),
        }
    }

    fn read_ready(&mut self) -> Conveyor<()> {
        self.stream.read_ready()
    }

    fn on_read_disconnected(&mut self) -> Conveyor<()> {
        self.stream.on_read_disconnected()
    }
}

impl OutputStream for TlsStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self
            .session
            .writer()
            .write(buf)
            .map_err(|error| Error::new(Code::GenericCritical, error.to_string()))?;
        self.pump_write()?;
        Ok(n)
    }

    fn write_ready(&mut self) -> Conveyor<()> {
        self.stream.write_ready()
    }
}

impl IoStream for TlsStream {}

impl Drop for TlsStream {
    fn drop(&mut self) {
        self.session.send_close_notify();
        let _ = self.pump_write();
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum HandshakeState {
    Connecting,
    Handshaking,
    Ready,
    Failed,
    Closed,
}

/// Drives one session's handshake from readiness edges.
struct HandshakeDriver {
    state: Cell<HandshakeState>,
    stream: RefCell<Option<TlsStream>>,
    feeder: RefCell<Option<Box<dyn ConveyorFeeder<Box<dyn IoStream>>>>>,
    connection_sink: RefCell<Option<SinkConveyor>>,
    reader_sink: RefCell<Option<SinkConveyor>>,
    writer_sink: RefCell<Option<SinkConveyor>>,
}

impl HandshakeDriver {
    fn new(feeder: Box<dyn ConveyorFeeder<Box<dyn IoStream>>>) -> Rc<HandshakeDriver> {
        Rc::new(HandshakeDriver {
            state: Cell::new(HandshakeState::Connecting),
            stream: RefCell::new(None),
            feeder: RefCell::new(Some(feeder)),
            connection_sink: RefCell::new(None),
            reader_sink: RefCell::new(None),
            writer_sink: RefCell::new(None),
        })
    }

    fn start(self: Rc<Self>, mut stream: Box<dyn IoStream>, session: rustls::Connection) {
        let read_ready = stream.read_ready();
        let write_ready = stream.write_ready();
        *self.stream.borrow_mut() = Some(TlsStream { stream, session });

        let driver = Rc::downgrade(&self);
        *self.reader_sink.borrow_mut() = Some(
            read_ready
                .then(move |()| {
                    if let Some(driver) = driver.upgrade() {
                        driver.turn();
                    }
                })
                .sink(),
        );
        let driver = Rc::downgrade(&self);
        *self.writer_sink.borrow_mut() = Some(
            write_ready
                .then(move |()| {
                    if let Some(driver) = driver.upgrade() {
                        driver.turn();
                    }
                })
                .sink(),
        );

        self.state.set(HandshakeState::Handshaking);
        self.turn();
    }

    fn turn(&self) {
        if self.state.get() != HandshakeState::Handshaking {
            return;
        }
        let mut guard = self.stream.borrow_mut();
        let Some(tls) = guard.as_mut() else {
            return;
        };
        loop {
            if !tls.session.is_handshaking() {
                let _ = tls.pump_write();
                drop(guard);
                self.finish();
                return;
            }
            if tls.session.wants_write() {
                match tls.session.write_tls(&mut PushShim(tls.stream.as_mut())) {
                    Ok(_) => continue,
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return,
                    Err(error) => {
                        drop(guard);
                        self.fail(HandshakeState::Failed, map_shim_error(error));
                        return;
                    }
                }
            }
            if tls.session.wants_read() {
                match tls.session.read_tls(&mut PullShim(tls.stream.as_mut())) {
                    Ok(0) => {
                        drop(guard);
                        self.fail(HandshakeState::Closed, Error::disconnected());
                        return;
                    }
                    Ok(_) => match tls.session.process_new_packets() {
                        Ok(_) => continue,
                        Err(error) => {
                            drop(guard);
                            self.fail(HandshakeState::Failed, map_tls_error(error));
                            return;
                        }
                    },
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return,
                    Err(error) => {
                        drop(guard);
                        self.fail(HandshakeState::Failed, map_shim_error(error));
                        return;
                    }
                }
            }
        }
    }

    fn finish(&self) {
        self.state.set(HandshakeState::Ready);
        trace!("tls handshake complete");
        let stream = self.stream.borrow_mut().take();
        let feeder = self.feeder.borrow_mut().take();
        if let (Some(stream), Some(mut feeder)) = (stream, feeder) {
            feeder.feed(Box::new(stream));
        }
    }

    fn fail(&self, state: HandshakeState, error: Error) {
        self.state.set(state);
        trace!("tls handshake failed: {}", error);
        // No further bytes are forwarded to the wrapped stream.
        *self.stream.borrow_mut() = None;
        if let Some(mut feeder) = self.feeder.borrow_mut().take() {
            feeder.fail(Error::new(
                Code::GenericCritical,
                format!("could not establish tls connection: {}", error),
            ));
        }
    }

    fn connection_failed(&self, error: Error) {
        self.fail(HandshakeState::Failed, error);
    }

    fn set_connection_sink(&self, sink: SinkConveyor) {
        *self.connection_sink.borrow_mut() = Some(sink);
    }
}

/// [`Network`] wrapper establishing TLS sessions over its streams.
pub struct TlsNetwork {
    network: Network,
    client_config: Option<Arc<rustls::ClientConfig>>,
    server_config: Option<Arc<rustls::ServerConfig>>,
}

impl TlsNetwork {
    /// A client-side TLS network.
    pub fn client(network: Network, config: Arc<rustls::ClientConfig>) -> TlsNetwork {
        TlsNetwork {
            network,
            client_config: Some(config),
            server_config: None,
        }
    }

    /// A server-side TLS network.
    pub fn server(network: Network, config: Arc<rustls::ServerConfig>) -> TlsNetwork {
        TlsNetwork {
            network,
            client_config: None,
            server_config: Some(config),
        }
    }

    pub fn resolve_address(&self, host: &str, port_hint: u16) -> Conveyor<NetworkAddress> {
        self.network.resolve_address(host, port_hint)
    }

    /// Connects to `address` and completes a client handshake before
    /// yielding the stream.
    pub fn connect(&self, address: &NetworkAddress) -> Conveyor<Box<dyn IoStream>> {
        let Some(config) = self.client_config.clone() else {
            return Conveyor::failed(Error::new(
                Code::InvalidState,
                "tls network has no client configuration",
            ));
        };
        let server_name = match ServerName::try_from(address.host().to_string()) {
            Ok(name) => name,
            Err(error) => {
                return Conveyor::failed(Error::new(
                    Code::GenericCritical,
                    format!("invalid tls server name: {}", error),
                ));
            }
        };

        let pair = one_time_conveyor_and_feeder::<Box<dyn IoStream>>();
        let driver = HandshakeDriver::new(pair.feeder);

        let on_stream = Rc::downgrade(&driver);
        let on_error = Rc::downgrade(&driver);
        let connection = self.network.connect(address).then_else(
            move |stream| {
                let Some(driver) = on_stream.upgrade() else {
                    return;
                };
                match rustls::ClientConnection::new(config.clone(), server_name.clone()) {
                    Ok(session) => driver.start(stream, session.into()),
                    Err(error) => driver.connection_failed(map_tls_error(error)),
                }
            },
            move |error| {
                if let Some(driver) = on_error.upgrade() {
                    driver.connection_failed(error);
                }
                Ok(())
            },
        );
        driver.set_connection_sink(connection.sink());

        pair.conveyor.attach(driver)
    }

    /// Sets up a listener whose accepted streams complete a server
    /// handshake before being yielded.
    pub fn listen(&self, address: &NetworkAddress) -> Result<TlsServer> {
        let config = self.server_config.clone().ok_or_else(|| {
            Error::new(Code::InvalidState, "tls network has no server configuration")
        })?;
        let mut server = self.network.listen(address)?;
        let accepts = server.accept();

        let inner = Rc::new(TlsServerInner {
            config,
            feeder: RefCell::new(None),
        });
        let on_accept = Rc::downgrade(&inner);
        let accept_sink = accepts
            .then(move |stream| {
                if let Some(inner) = on_accept.upgrade() {
                    TlsServerInner::spawn_handshake(&inner, stream);
                }
            })
            .sink();

        Ok(TlsServer {
            inner,
            _server: server,
            _accept_sink: accept_sink,
        })
    }
}

struct TlsServerInner {
    config: Arc<rustls::ServerConfig>,
    feeder: RefCell<Option<Box<dyn ConveyorFeeder<Box<dyn IoStream>>>>>,
}

impl TlsServerInner {
    fn spawn_handshake(inner: &Rc<TlsServerInner>, stream: Box<dyn IoStream>) {
        let session = match rustls::ServerConnection::new(inner.config.clone()) {
            Ok(session) => session,
            Err(error) => {
                trace!("rejecting accepted stream: {}", map_tls_error(error));
                return;
            }
        };

        let pair = one_time_conveyor_and_feeder::<Box<dyn IoStream>>();
        let driver = HandshakeDriver::new(pair.feeder);
        driver.clone().start(stream, session.into());

        // The handshake chain parks in the daemon; its completion feeds the
        // accept conveyor, and its eventual exhaustion lets the daemon
        // scavenge the driver.
        let inner = Rc::downgrade(inner);
        pair.conveyor
            .attach(driver)
            .then(move |tls_stream| {
                if let Some(inner) = inner.upgrade() {
                    if let Some(feeder) = &mut *inner.feeder.borrow_mut() {
                        if feeder.space() > 0 {
                            feeder.feed(tls_stream);
                        }
                    }
                }
            })
            .detach();
    }
}

/// A listener yielding TLS-established streams.
pub struct TlsServer {
    inner: Rc<TlsServerInner>,
    _server: crate::net::Server,
    _accept_sink: SinkConveyor,
}

impl TlsServer {
    /// Streams whose server handshake completed.
    pub fn accept(&mut self) -> Conveyor<Box<dyn IoStream>> {
        let pair = new_conveyor_and_feeder();
        *self.inner.feeder.borrow_mut() = Some(pair.feeder);
        pair.conveyor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shim_errors_keep_nonblocking_semantics() {
        let would_block = map_shim_error(std::io::ErrorKind::WouldBlock.into());
        assert_eq!(would_block.code(), Code::WouldBlock);
        assert!(would_block.is_recoverable());

        let broken: Error = map_shim_error(std::io::ErrorKind::BrokenPipe.into());
        assert_eq!(broken.code(), Code::Disconnected);
        assert!(broken.is_critical());
    }

    #[test]
    fn engine_errors_are_critical() {
        let error = map_tls_error(rustls::Error::HandshakeNotComplete);
        assert!(error.is_critical());
    }
}
