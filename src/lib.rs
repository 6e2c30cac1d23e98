//! Promise-pipeline based non-blocking I/O.
//!
//! Conveyor is an asynchronous I/O runtime built around lazy data-flow
//! chains ("conveyors") driven by a single-threaded cooperative event loop.
//! External sources — feeders, file descriptors, timers, signals — drop
//! values into storage at the leaf of a chain; each arming places an event
//! on the loop's queue; the loop drains the queue in priority order and
//! every firing node pulls one element from its child, transforms it, and
//! notifies its own parent. A sink at the root is the terminal consumer,
//! and bounded buffer edges are the sole source of backpressure.
//!
//! # Example
//!
//! ```
//! use conveyor::{Conveyor, EventLoop, WaitScope};
//!
//! let event_loop = EventLoop::new();
//! let wait_scope = WaitScope::new(&event_loop);
//!
//! let mut chain = Conveyor::immediate(5).then(|value| value == 5);
//! wait_scope.poll().unwrap();
//! assert_eq!(chain.take().unwrap(), true);
//! ```
//!
//! I/O runs on top of the readiness reactor: [`setup_async_io`] creates an
//! event port (epoll, signalfd, and a cross-thread wake pipe), an event
//! loop blocking on it, and a [`Network`] for sockets.
//!
//! All conveyor operations are bound to the loop entered on the current
//! thread; [`Waker::wake`] is the only API safe to call from another
//! thread.

mod sys;

mod buffer;
mod conveyor;
mod error;
mod io;
mod net;
mod reactor;
mod timer;
mod tls;

pub use buffer::{ArrayBuffer, Buffer, BufferView, ChainBuffer, RingBuffer};
pub use conveyor::{
    exec_later, new_conveyor_and_feeder, one_time_conveyor_and_feeder, yield_last, yield_later,
    yield_next, Conveyor, ConveyorAndFeeder, ConveyorFeeder, EventLoop, EventPort, MergeConveyor,
    SinkConveyor, WaitScope,
};
pub use error::{Code, Error, Result};
pub use io::{
    setup_async_io, AsyncIoContext, AsyncIoStream, InputStream, IoStream, OutputStream,
};
pub use net::{Datagram, Network, NetworkAddress, Server, UnixIoStream};
pub use reactor::{Interest, Readiness, Signal, Token, UnixEventPort, Waker};
pub use timer::timeout_after;
pub use tls::{TlsNetwork, TlsServer, TlsStream};
