//! External input endpoints paired with in-graph storage nodes.
//!
//! A feeder and its node are independently owned: the feeder typically lives
//! with the code producing events (an FD owner, a signal dispatcher) while
//! the node lives in a conveyor chain. The link is a weak pointer, so either
//! side tolerates the other's disappearance without unwinding.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::error::{Code, Error, Result};

use super::node::{write_result, ConveyorNode, ConveyorStorage, ParentLink};
use super::queue::{EventHandle, FireEvent};
use super::{with_current, Conveyor};

/// External producer handle for a conveyor.
pub trait ConveyorFeeder<T: 'static> {
    /// Enqueues a value. For one-shot feeders, calls after the first are
    /// ignored.
    fn feed(&mut self, value: T);
    /// Enqueues an error.
    fn fail(&mut self, error: Error);
    /// Space left in the paired node, 0 if the node is gone.
    fn space(&self) -> usize;
    /// Values queued in the paired node.
    fn queued(&self) -> usize;
}

/// A feeder together with the conveyor it feeds.
pub struct ConveyorAndFeeder<T: 'static> {
    pub feeder: Box<dyn ConveyorFeeder<T>>,
    pub conveyor: Conveyor<T>,
}

/// Creates an adapt (multi-value) feeder/conveyor pair.
pub fn new_conveyor_and_feeder<T: 'static>() -> ConveyorAndFeeder<T> {
    let node = AdaptNode::new();
    let feeder = Box::new(AdaptFeeder {
        node: Rc::downgrade(&node),
    });
    let node_dyn: Rc<dyn ConveyorStorage> = node.clone();
    let storage: Weak<dyn ConveyorStorage> = Rc::downgrade(&node_dyn);
    ConveyorAndFeeder {
        feeder,
        conveyor: Conveyor::from_parts(node, Some(storage)),
    }
}

/// Creates a one-shot feeder/conveyor pair. The first `feed` or `fail`
/// consumes the slot.
pub fn one_time_conveyor_and_feeder<T: 'static>() -> ConveyorAndFeeder<T> {
    let node = OneTimeNode::new();
    let feeder = Box::new(OneTimeFeeder {
        node: Rc::downgrade(&node),
    });
    let node_dyn: Rc<dyn ConveyorStorage> = node.clone();
    let storage: Weak<dyn ConveyorStorage> = Rc::downgrade(&node_dyn);
    ConveyorAndFeeder {
        feeder,
        conveyor: Conveyor::from_parts(node, Some(storage)),
    }
}

/// Leaf storage with an unbounded queue of values and errors.
pub(crate) struct AdaptNode<T: 'static> {
    queue: RefCell<VecDeque<Result<T>>>,
    parent: ParentLink,
    event: EventHandle,
}

impl<T: 'static> AdaptNode<T> {
    fn new() -> Rc<AdaptNode<T>> {
        with_current(|lp| {
            Rc::new_cyclic(|me: &Weak<AdaptNode<T>>| AdaptNode {
                queue: RefCell::new(VecDeque::new()),
                parent: ParentLink::new(),
                event: EventHandle::new(&lp.queue, me.clone()),
            })
        })
    }

    fn push(&self, result: Result<T>) {
        self.queue.borrow_mut().push_back(result);
        self.event.arm_next();
    }
}

impl<T: 'static> ConveyorNode for AdaptNode<T> {
    fn get_result(&self, out: &mut dyn Any) {
        let front = self.queue.borrow_mut().pop_front();
        match front {
            Some(result) => write_result(out, result),
            None => write_result::<T>(
                out,
                Err(Error::new(Code::InvalidState, "no element queued")),
            ),
        }
    }
}

impl<T: 'static> ConveyorStorage for AdaptNode<T> {
    fn space(&self) -> usize {
        // Effectively unbounded; not a numeric contract.
        usize::MAX - self.queue.borrow().len()
    }

    fn queued(&self) -> usize {
        self.queue.borrow().len()
    }

    fn child_has_fired(&self) {
        debug_assert!(false, "adapt node has no child");
    }

    fn parent_has_fired(&self) {
        let Some(parent) = self.parent.get() else {
            return;
        };
        if parent.space() > 0 && self.queued() > 0 {
            self.event.arm_later();
        }
    }

    fn set_parent(&self, parent: Weak<dyn ConveyorStorage>) {
        self.parent.set(parent);
        if self.queued() > 0 {
            self.event.arm_next();
        }
    }
}

impl<T: 'static> FireEvent for AdaptNode<T> {
    fn fire(&self) {
        let Some(parent) = self.parent.get() else {
            return;
        };
        parent.child_has_fired();
        if self.queued() > 0 && parent.space() > 0 {
            self.event.arm_later();
        }
    }
}

struct AdaptFeeder<T: 'static> {
    node: Weak<AdaptNode<T>>,
}

impl<T: 'static> ConveyorFeeder<T> for AdaptFeeder<T> {
    fn feed(&mut self, value: T) {
        if let Some(node) = self.node.upgrade() {
            node.push(Ok(value));
        }
    }

    fn fail(&mut self, error: Error) {
        if let Some(node) = self.node.upgrade() {
            node.push(Err(error));
        }
    }

    fn space(&self) -> usize {
        self.node.upgrade().map_or(0, |node| node.space())
    }

    fn queued(&self) -> usize {
        self.node.upgrade().map_or(0, |node| node.queued())
    }
}

const FRESH: u8 = 0;
const DELIVERED: u8 = 1;
const FINISHED: u8 = 2;

/// Leaf storage holding at most one value over its lifetime.
pub(crate) struct OneTimeNode<T: 'static> {
    slot: RefCell<Option<Result<T>>>,
    fed: Cell<bool>,
    state: Cell<u8>,
    parent: ParentLink,
    event: EventHandle,
}

impl<T: 'static> OneTimeNode<T> {
    fn new() -> Rc<OneTimeNode<T>> {
        with_current(|lp| {
            Rc::new_cyclic(|me: &Weak<OneTimeNode<T>>| OneTimeNode {
                slot: RefCell::new(None),
                fed: Cell::new(false),
                state: Cell::new(FRESH),
                parent: ParentLink::new(),
                event: EventHandle::new(&lp.queue, me.clone()),
            })
        })
    }

    fn fill(&self, result: Result<T>) {
        if self.fed.get() {
            return;
        }
        self.fed.set(true);
        *self.slot.borrow_mut() = Some(result);
        self.event.arm_next();
    }
}

impl<T: 'static> ConveyorNode for OneTimeNode<T> {
    fn get_result(&self, out: &mut dyn Any) {
        let value = self.slot.borrow_mut().take();
        match value {
            Some(result) => {
                self.state.set(DELIVERED);
                write_result(out, result);
            }
            None => write_result::<T>(out, Err(Error::exhausted("one-shot value already taken"))),
        }
    }
}

impl<T: 'static> ConveyorStorage for OneTimeNode<T> {
    fn space(&self) -> usize {
        if self.fed.get() {
            0
        } else {
            1
        }
    }

    fn queued(&self) -> usize {
        if self.slot.borrow().is_some() {
            1
        } else {
            0
        }
    }

    fn child_has_fired(&self) {
        debug_assert!(false, "one-time node has no child");
    }

    fn parent_has_fired(&self) {
        if self.queued() > 0 {
            self.event.arm_next();
        }
    }

    fn set_parent(&self, parent: Weak<dyn ConveyorStorage>) {
        self.parent.set(parent);
        if self.queued() > 0 {
            self.event.arm_next();
        }
    }

    fn exhausted(&self) -> bool {
        self.fed.get() && self.slot.borrow().is_none()
    }
}

impl<T: 'static> FireEvent for OneTimeNode<T> {
    fn fire(&self) {
        let Some(parent) = self.parent.get() else {
            return;
        };
        parent.child_has_fired();
        if self.queued() > 0 {
            if parent.space() > 0 {
                self.event.arm_last();
            }
        } else if self.state.get() == DELIVERED {
            self.state.set(FINISHED);
            self.event.arm_last();
        }
    }
}

struct OneTimeFeeder<T: 'static> {
    node: Weak<OneTimeNode<T>>,
}

impl<T: 'static> ConveyorFeeder<T> for OneTimeFeeder<T> {
    fn feed(&mut self, value: T) {
        if let Some(node) = self.node.upgrade() {
            node.fill(Ok(value));
        }
    }

    fn fail(&mut self, error: Error) {
        if let Some(node) = self.node.upgrade() {
            node.fill(Err(error));
        }
    }

    fn space(&self) -> usize {
        self.node.upgrade().map_or(0, |node| node.space())
    }

    fn queued(&self) -> usize {
        self.node.upgrade().map_or(0, |node| node.queued())
    }
}
