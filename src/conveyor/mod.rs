//! The conveyor graph and its single-threaded cooperative event loop.
//!
//! User code composes lazy data-flow chains ([`Conveyor`]) that the loop
//! drives to completion, fed by OS readiness events, timers, and
//! user-supplied feeders. See the crate-level documentation for the data
//! flow and the scheduling guarantees.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::error::{Code, Error, Result};
use crate::timer::TimerQueue;

mod feeder;
mod merge;
mod node;
mod queue;
mod sink;

pub use feeder::{
    new_conveyor_and_feeder, one_time_conveyor_and_feeder, ConveyorAndFeeder, ConveyorFeeder,
};
pub use merge::MergeConveyor;
pub use sink::SinkConveyor;

use queue::EventQueue;

use node::{Arming, AttachNode, BufferNode, ConvertNode, ConveyorNode, ConveyorStorage, ImmediateNode};
use sink::SinkCollection;

/// Correspondent between the running loop and outside events: OS readiness,
/// signals, or other threads. The default port is supplied by
/// [`setup_async_io`](crate::setup_async_io).
pub trait EventPort {
    /// Dispatches pending external events without blocking. Returns `true`
    /// if a cross-thread wake was observed.
    fn poll(&self) -> Result<bool>;

    /// Blocks until external events arrive, a wake is observed, or
    /// `timeout` elapses, then dispatches. Returns `true` on wake.
    fn wait(&self, timeout: Option<Duration>) -> Result<bool>;
}

pub(crate) struct LoopInner {
    pub(crate) queue: Rc<RefCell<EventQueue>>,
    port: Option<Rc<dyn EventPort>>,
    daemon: RefCell<Option<Rc<SinkCollection>>>,
    pub(crate) timers: RefCell<TimerQueue>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<LoopInner>>> = RefCell::new(None);
}

/// Runs `f` with the loop entered on this thread. Panics outside a
/// [`WaitScope`]; conveyor construction and arming are only legal inside
/// one.
pub(crate) fn with_current<R>(f: impl FnOnce(&Rc<LoopInner>) -> R) -> R {
    CURRENT.with(|current| {
        let current = current.borrow();
        let inner = current
            .as_ref()
            .expect("no event loop entered on this thread");
        f(inner)
    })
}

impl LoopInner {
    /// Runs the loop for a single step. Returns false once the queue is
    /// empty.
    fn turn(&self) -> bool {
        let event = {
            let mut queue = self.queue.borrow_mut();
            if !queue.runnable() {
                return false;
            }
            queue.pop_front()
        };
        let Some(event) = event else {
            return false;
        };
        if let Some(event) = event.upgrade() {
            event.fire();
        }
        true
    }

    fn expire_timers(&self) {
        let due = self.timers.borrow_mut().take_due(Instant::now());
        for mut feeder in due {
            feeder.feed(());
        }
    }

    fn poll_loop(&self) -> Result<()> {
        if let Some(port) = &self.port {
            port.poll()?;
        }
        self.expire_timers();
        while self.turn() {}
        Ok(())
    }

    fn wait_loop(&self, timeout: Option<Duration>) -> Result<()> {
        while self.turn() {}

        let until_deadline = self
            .timers
            .borrow()
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let effective = match (timeout, until_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        match &self.port {
            Some(port) => {
                port.wait(effective)?;
            }
            None => {
                if let Some(duration) = effective {
                    std::thread::sleep(duration);
                }
            }
        }

        self.expire_timers();
        while self.turn() {}
        Ok(())
    }

    pub(crate) fn daemon(&self) -> Rc<SinkCollection> {
        self.daemon
            .borrow_mut()
            .get_or_insert_with(|| SinkCollection::new(&self.queue))
            .clone()
    }
}

/// A queue of events executed in a loop on a single thread.
///
/// Exactly one loop may be entered by a thread at a time; entering is done
/// by constructing a [`WaitScope`]. The loop optionally owns an
/// [`EventPort`] feeding it OS-level events, and a daemon sink collection
/// absorbing [detached](Conveyor::detach) chains.
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Creates a loop without an event port. Such a loop can only be driven
    /// by feeders and timers.
    pub fn new() -> EventLoop {
        EventLoop::build(None)
    }

    /// Creates a loop blocking on `port` for external events.
    pub fn with_port(port: Rc<dyn EventPort>) -> EventLoop {
        EventLoop::build(Some(port))
    }

    fn build(port: Option<Rc<dyn EventPort>>) -> EventLoop {
        EventLoop {
            inner: Rc::new(LoopInner {
                queue: Rc::new(RefCell::new(EventQueue::new())),
                port,
                daemon: RefCell::new(None),
                timers: RefCell::new(TimerQueue::new()),
            }),
        }
    }

    /// Installs the handler invoked when a detached chain fails with a
    /// critical error. The default silently drops the error.
    pub fn set_daemon_error_handler(&self, handler: impl FnMut(Error) + 'static) {
        self.inner.daemon().set_error_handler(Box::new(handler));
    }

    /// Number of detached chains currently held by the daemon.
    pub fn daemon_chains(&self) -> usize {
        self.inner
            .daemon
            .borrow()
            .as_ref()
            .map_or(0, |daemon| daemon.live())
    }
}

impl Default for EventLoop {
    fn default() -> EventLoop {
        EventLoop::new()
    }
}

/// A scope in which conveyors can be built and driven. Construction enters
/// the loop on the current thread; destruction leaves it.
pub struct WaitScope<'l> {
    event_loop: &'l EventLoop,
}

impl<'l> WaitScope<'l> {
    /// Enters `event_loop` on this thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread already entered a loop.
    pub fn new(event_loop: &'l EventLoop) -> WaitScope<'l> {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            assert!(
                current.is_none(),
                "an event loop is already entered on this thread"
            );
            *current = Some(event_loop.inner.clone());
        });
        WaitScope { event_loop }
    }

    /// Dispatches pending port events, then drains the event queue without
    /// blocking.
    pub fn poll(&self) -> Result<()> {
        self.event_loop.inner.poll_loop()
    }

    /// Drains pending events, blocks on the port once, then drains again.
    pub fn wait(&self) -> Result<()> {
        self.event_loop.inner.wait_loop(None)
    }

    /// Like [`wait`](WaitScope::wait), bounding the block by `timeout`.
    pub fn wait_for(&self, timeout: Duration) -> Result<()> {
        self.event_loop.inner.wait_loop(Some(timeout))
    }
}

impl Drop for WaitScope<'_> {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            current.borrow_mut().take();
        });
    }
}

/// A lazy, possibly-infinite sequence of values produced by a chain of
/// nodes.
///
/// A `Conveyor` pairs ownership of the chain's root node with a non-owning
/// pointer at the chain's next storage edge. It is move-only and bound to
/// the loop of the thread it was created on.
pub struct Conveyor<T: 'static> {
    node: Rc<dyn ConveyorNode>,
    storage: Option<Weak<dyn ConveyorStorage>>,
    _marker: PhantomData<*const T>,
}

impl<T: 'static> Conveyor<T> {
    pub(crate) fn from_parts(
        node: Rc<impl ConveyorNode + 'static>,
        storage: Option<Weak<dyn ConveyorStorage>>,
    ) -> Conveyor<T> {
        Conveyor {
            node,
            storage,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_node(self) -> Rc<dyn ConveyorNode> {
        self.node
    }

    fn from_immediate(result: Result<T>, arming: Arming) -> Conveyor<T> {
        let node = ImmediateNode::new(result, arming);
        let node_dyn: Rc<dyn ConveyorStorage> = node.clone();
        let storage: Weak<dyn ConveyorStorage> = Rc::downgrade(&node_dyn);
        Conveyor::from_parts(node, Some(storage))
    }

    /// An immediately fulfilled conveyor.
    pub fn immediate(value: T) -> Conveyor<T> {
        Conveyor::from_immediate(Ok(value), Arming::Next)
    }

    /// An immediately failed conveyor.
    pub fn failed(error: Error) -> Conveyor<T> {
        Conveyor::from_immediate(Err(error), Arming::Next)
    }

    /// Converts each value through `func`. Errors are propagated unchanged.
    pub fn then<U, F>(self, mut func: F) -> Conveyor<U>
    where
        U: 'static,
        F: FnMut(T) -> U + 'static,
    {
        self.try_then_else(move |value| Ok(func(value)), |error| Err(error))
    }

    /// Converts values through `func` and errors through `error_func`,
    /// which may propagate, substitute, or map.
    pub fn then_else<U, F, EF>(self, mut func: F, error_func: EF) -> Conveyor<U>
    where
        U: 'static,
        F: FnMut(T) -> U + 'static,
        EF: FnMut(Error) -> Result<U> + 'static,
    {
        self.try_then_else(move |value| Ok(func(value)), error_func)
    }

    /// Like [`then`](Conveyor::then) for a fallible conversion.
    pub fn try_then<U, F>(self, func: F) -> Conveyor<U>
    where
        U: 'static,
        F: FnMut(T) -> Result<U> + 'static,
    {
        self.try_then_else(func, |error| Err(error))
    }

    /// The general conversion: both callbacks return `Result`.
    pub fn try_then_else<U, F, EF>(self, func: F, error_func: EF) -> Conveyor<U>
    where
        U: 'static,
        F: FnMut(T) -> Result<U> + 'static,
        EF: FnMut(Error) -> Result<U> + 'static,
    {
        let node = Rc::new(ConvertNode::new(self.node, func, error_func));
        Conveyor {
            node,
            storage: self.storage,
            _marker: PhantomData,
        }
    }

    /// Inserts a bounded storage edge. The buffer acts as a scheduler
    /// interrupt point and collects up to `limit` elements; a full buffer
    /// stops the producer side from arming until space returns.
    pub fn buffer(self, limit: usize) -> Conveyor<T> {
        let node: Rc<BufferNode<T>> = BufferNode::new(self.node, self.storage.clone(), limit);
        let node_dyn: Rc<dyn ConveyorStorage> = node.clone();
        let storage: Weak<dyn ConveyorStorage> = Rc::downgrade(&node_dyn);
        if let Some(previous) = self.storage.as_ref().and_then(Weak::upgrade) {
            previous.set_parent(storage.clone());
        }
        Conveyor::from_parts(node, Some(storage))
    }

    /// Takes ownership of `attachment`, destroying it with the chain.
    /// Useful for resource lifetime control.
    pub fn attach<A: 'static>(self, attachment: A) -> Conveyor<T> {
        let node = Rc::new(AttachNode::new(self.node, attachment));
        Conveyor {
            node,
            storage: self.storage,
            _marker: PhantomData,
        }
    }

    /// Splits into a merged lane and a handle for attaching further
    /// conveyors to it. Values are delivered round-robin across attached
    /// chains.
    pub fn merge(self) -> (Conveyor<T>, MergeConveyor<T>) {
        merge::new_merge(self)
    }

    /// Moves the chain into the loop's daemon, which drops every element
    /// and holds the chain until it fails or the loop dies.
    pub fn detach(self) {
        let void = self.then(|_| ());
        with_current(|lp| lp.daemon().add(void, &lp.queue));
    }

    /// Takes the next queued element out of the chain. Use this when no
    /// sink drives the chain.
    ///
    /// Returns a recoverable [`Code::NotAvailable`] error when nothing is
    /// queued, and [`Code::Exhausted`] once a one-shot source was consumed.
    pub fn take(&mut self) -> Result<T> {
        let Some(storage) = self.storage.as_ref().and_then(Weak::upgrade) else {
            return Err(Error::new(Code::InvalidState, "conveyor has no storage"));
        };
        if storage.queued() > 0 {
            let mut out: Option<Result<T>> = None;
            self.node.get_result(&mut out);
            out.unwrap_or_else(|| Err(Error::new(Code::InvalidState, "chain produced no value")))
        } else if storage.exhausted() {
            Err(Error::exhausted("value already taken"))
        } else {
            Err(Error::new(
                Code::NotAvailable,
                "conveyor has no element queued",
            ))
        }
    }
}

impl Conveyor<()> {
    /// Creates a local sink which drains and drops elements; lifetime
    /// control stays with the caller.
    pub fn sink(self) -> SinkConveyor {
        with_current(|lp| SinkConveyor::new(self, &lp.queue))
    }
}

/// Schedules `func` to run on a later turn of the loop.
pub fn exec_later<U, F>(mut func: F) -> Conveyor<U>
where
    U: 'static,
    F: FnMut() -> U + 'static,
{
    Conveyor::immediate(()).then(move |()| func())
}

/// A void conveyor delivered within the current turn batch.
pub fn yield_next() -> Conveyor<()> {
    Conveyor::from_immediate(Ok(()), Arming::Next)
}

/// A void conveyor delivered after the current turn batch.
pub fn yield_later() -> Conveyor<()> {
    Conveyor::from_immediate(Ok(()), Arming::Later)
}

/// A void conveyor delivered at the end of the queue.
pub fn yield_last() -> Conveyor<()> {
    Conveyor::from_immediate(Ok(()), Arming::Last)
}
