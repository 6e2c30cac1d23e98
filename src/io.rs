//! Byte stream contracts and the read/write task state machines.
//!
//! The raw traits mirror the OS's non-blocking semantics: `read`/`write`
//! may fail with the recoverable would-block error and a zero-length read
//! means the peer closed. The ready conveyors fire once per readiness edge.
//!
//! [`AsyncIoStream`] layers fire-and-await reads and writes on top: a task
//! holds an owned buffer plus progress counters and is advanced from the
//! readiness conveyors until its completion feeder fires.

use std::cell::RefCell;
use std::rc::Rc;

use crate::conveyor::{
    new_conveyor_and_feeder, Conveyor, ConveyorFeeder, EventLoop, SinkConveyor,
};
use crate::error::{Code, Error, Result};
use crate::net::Network;
use crate::reactor::UnixEventPort;

/// Source of bytes with edge-triggered readiness conveyors.
pub trait InputStream {
    /// Reads into `buf`, returning the number of bytes read. `Ok(0)` means
    /// the peer closed; a [`Code::WouldBlock`] error means retry after the
    /// next readiness event.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Fires once per read-readiness edge.
    fn read_ready(&mut self) -> Conveyor<()>;

    /// Fires once when the peer disconnects the read half.
    fn on_read_disconnected(&mut self) -> Conveyor<()>;
}

/// Sink of bytes with an edge-triggered readiness conveyor.
pub trait OutputStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Fires once per write-readiness edge.
    fn write_ready(&mut self) -> Conveyor<()>;
}

pub trait IoStream: InputStream + OutputStream {}

/// In-flight read: fill `buffer` with at least `min_length` bytes.
pub(crate) struct ReadTask {
    buffer: Vec<u8>,
    min_length: usize,
    already_read: usize,
}

pub(crate) struct ReadHelper {
    task: Option<ReadTask>,
    read_done: Option<Box<dyn ConveyorFeeder<(Vec<u8>, usize)>>>,
    on_disconnect: Option<Box<dyn ConveyorFeeder<()>>>,
}

impl ReadHelper {
    pub(crate) fn new() -> ReadHelper {
        ReadHelper {
            task: None,
            read_done: None,
            on_disconnect: None,
        }
    }

    pub(crate) fn start(&mut self, buffer: Vec<u8>, min_length: usize) -> Result<()> {
        if self.task.is_some() {
            return Err(Error::recoverable("a read task is already in flight"));
        }
        if buffer.is_empty() || min_length == 0 || min_length > buffer.len() {
            return Err(Error::new(Code::InvalidState, "bad read task bounds"));
        }
        self.task = Some(ReadTask {
            buffer,
            min_length,
            already_read: 0,
        });
        Ok(())
    }

    /// Advances the current task as far as the reader allows.
    pub(crate) fn step<R: InputStream + ?Sized>(&mut self, reader: &mut R) {
        while let Some(task) = &mut self.task {
            let dst = &mut task.buffer[task.already_read..];
            match reader.read(dst) {
                Err(error) if error.code() == Code::WouldBlock => break,
                Err(error) => {
                    if let Some(done) = &mut self.read_done {
                        done.fail(error);
                    }
                    self.task = None;
                }
                Ok(0) => {
                    if let Some(disconnect) = &mut self.on_disconnect {
                        disconnect.feed(());
                    }
                    self.task = None;
                }
                Ok(n) => {
                    task.already_read += n;
                    if task.already_read >= task.min_length {
                        if let Some(task) = self.task.take() {
                            if let Some(done) = &mut self.read_done {
                                done.feed((task.buffer, task.already_read));
                            }
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn disconnected(&mut self) {
        if let Some(disconnect) = &mut self.on_disconnect {
            disconnect.feed(());
        }
    }

    pub(crate) fn read_done(&mut self) -> Conveyor<(Vec<u8>, usize)> {
        let pair = new_conveyor_and_feeder();
        self.read_done = Some(pair.feeder);
        pair.conveyor
    }

    pub(crate) fn on_read_disconnected(&mut self) -> Conveyor<()> {
        let pair = new_conveyor_and_feeder();
        self.on_disconnect = Some(pair.feeder);
        pair.conveyor
    }
}

/// In-flight write: push all of `buffer` out.
pub(crate) struct WriteTask {
    buffer: Vec<u8>,
    already_written: usize,
}

pub(crate) struct WriteHelper {
    task: Option<WriteTask>,
    write_done: Option<Box<dyn ConveyorFeeder<usize>>>,
}

impl WriteHelper {
    pub(crate) fn new() -> WriteHelper {
        WriteHelper {
            task: None,
            write_done: None,
        }
    }

    pub(crate) fn start(&mut self, buffer: Vec<u8>) -> Result<()> {
        if self.task.is_some() {
            return Err(Error::recoverable("a write task is already in flight"));
        }
        if buffer.is_empty() {
            return Err(Error::new(Code::InvalidState, "empty write task"));
        }
        self.task = Some(WriteTask {
            buffer,
            already_written: 0,
        });
        Ok(())
    }

    pub(crate) fn step<W: OutputStream + ?Sized>(&mut self, writer: &mut W) {
        while let Some(task) = &mut self.task {
            let src = &task.buffer[task.already_written..];
            match writer.write(src) {
                Err(error) if error.code() == Code::WouldBlock => break,
                Err(error) => {
                    if let Some(done) = &mut self.write_done {
                        done.fail(error);
                    }
                    self.task = None;
                }
                Ok(n) => {
                    task.already_written += n;
                    if task.already_written == task.buffer.len() {
                        if let Some(task) = self.task.take() {
                            if let Some(done) = &mut self.write_done {
                                done.feed(task.already_written);
                            }
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn write_done(&mut self) -> Conveyor<usize> {
        let pair = new_conveyor_and_feeder();
        self.write_done = Some(pair.feeder);
        pair.conveyor
    }
}

struct AsyncIoInner {
    stream: Box<dyn IoStream>,
    read: ReadHelper,
    write: WriteHelper,
}

/// Fire-and-await reads and writes over any [`IoStream`].
///
/// At most one read and one write task may be in flight; completions are
/// announced through the [`read_done`](AsyncIoStream::read_done) and
/// [`write_done`](AsyncIoStream::write_done) conveyors.
pub struct AsyncIoStream {
    inner: Rc<RefCell<AsyncIoInner>>,
    _read_ready: SinkConveyor,
    _write_ready: SinkConveyor,
    _read_disconnected: SinkConveyor,
}

impl AsyncIoStream {
    pub fn new(mut stream: Box<dyn IoStream>) -> AsyncIoStream {
        let read_ready = stream.read_ready();
        let write_ready = stream.write_ready();
        let read_disconnected = stream.on_read_disconnected();

        let inner = Rc::new(RefCell::new(AsyncIoInner {
            stream,
            read: ReadHelper::new(),
            write: WriteHelper::new(),
        }));

        let for_read = Rc::downgrade(&inner);
        let read_ready = read_ready
            .then(move |()| {
                if let Some(inner) = for_read.upgrade() {
                    let mut guard = inner.borrow_mut();
                    let inner = &mut *guard;
                    inner.read.step(inner.stream.as_mut());
                }
            })
            .sink();

        let for_write = Rc::downgrade(&inner);
        let write_ready = write_ready
            .then(move |()| {
                if let Some(inner) = for_write.upgrade() {
                    let mut guard = inner.borrow_mut();
                    let inner = &mut *guard;
                    inner.write.step(inner.stream.as_mut());
                }
            })
            .sink();

        let for_disconnect = Rc::downgrade(&inner);
        let read_disconnected = read_disconnected
            .then(move |()| {
                if let Some(inner) = for_disconnect.upgrade() {
                    inner.borrow_mut().read.disconnected();
                }
            })
            .sink();

        AsyncIoStream {
            inner,
            _read_ready: read_ready,
            _write_ready: write_ready,
            _read_disconnected: read_disconnected,
        }
    }

    /// Starts filling `buffer` until at least `min_length` bytes arrived.
    /// Completion is announced on [`read_done`](AsyncIoStream::read_done)
    /// with the buffer and the byte count.
    pub fn read(&mut self, buffer: Vec<u8>, min_length: usize) -> Result<()> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.read.start(buffer, min_length)?;
        inner.read.step(inner.stream.as_mut());
        Ok(())
    }

    pub fn read_done(&mut self) -> Conveyor<(Vec<u8>, usize)> {
        self.inner.borrow_mut().read.read_done()
    }

    pub fn on_read_disconnected(&mut self) -> Conveyor<()> {
        self.inner.borrow_mut().read.on_read_disconnected()
    }

    /// Starts writing all of `buffer`. Completion is announced on
    /// [`write_done`](AsyncIoStream::write_done) with the byte count.
    pub fn write(&mut self, buffer: Vec<u8>) -> Result<()> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.write.start(buffer)?;
        inner.write.step(inner.stream.as_mut());
        Ok(())
    }

    pub fn write_done(&mut self) -> Conveyor<usize> {
        self.inner.borrow_mut().write.write_done()
    }
}

/// Everything needed to run conveyor-based I/O on this thread.
pub struct AsyncIoContext {
    pub event_loop: EventLoop,
    pub network: Network,
    pub port: Rc<UnixEventPort>,
}

/// Creates an event port, an event loop blocking on it, and a network
/// bound to it.
pub fn setup_async_io() -> Result<AsyncIoContext> {
    let port = UnixEventPort::new()?;
    let event_loop = EventLoop::with_port(port.clone());
    let network = Network::new(port.clone());
    Ok(AsyncIoContext {
        event_loop,
        network,
        port,
    })
}
