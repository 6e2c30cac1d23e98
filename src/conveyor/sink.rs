//! Terminal consumers: sinks, detach, and the loop-owned daemon.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::{Code, Error};

use super::node::{pull, write_result, ConveyorNode, ConveyorStorage};
use super::queue::{EventHandle, EventQueue, FireEvent};
use super::Conveyor;

/// Keeps a drained chain alive. Dropping the handle dismantles the chain.
pub struct SinkConveyor {
    _node: Rc<SinkNode>,
}

impl SinkConveyor {
    pub(crate) fn new(conveyor: Conveyor<()>, queue: &Rc<RefCell<EventQueue>>) -> SinkConveyor {
        SinkConveyor {
            _node: SinkNode::new(conveyor, queue, None),
        }
    }
}

/// Terminal node. Always has space, drains its child on every child firing
/// and absorbs values. On a critical error it arms itself `Last` so it can
/// free its own child and retire from the owning collection.
pub(crate) struct SinkNode {
    child: RefCell<Option<Rc<dyn ConveyorNode>>>,
    child_storage: RefCell<Option<Weak<dyn ConveyorStorage>>>,
    collection: RefCell<Option<(Weak<SinkCollection>, usize)>>,
    event: EventHandle,
}

impl SinkNode {
    fn new(
        conveyor: Conveyor<()>,
        queue: &Rc<RefCell<EventQueue>>,
        collection: Option<(Weak<SinkCollection>, usize)>,
    ) -> Rc<SinkNode> {
        let storage = conveyor.storage.clone();
        let node = Rc::new_cyclic(|me: &Weak<SinkNode>| SinkNode {
            child: RefCell::new(Some(conveyor.into_node())),
            child_storage: RefCell::new(storage.clone()),
            collection: RefCell::new(collection),
            event: EventHandle::new(queue, me.clone()),
        });
        if let Some(storage) = storage.as_ref().and_then(Weak::upgrade) {
            let node_dyn: Rc<dyn ConveyorStorage> = node.clone();
            let parent: Weak<dyn ConveyorStorage> = Rc::downgrade(&node_dyn);
            storage.set_parent(parent);
        }
        node
    }
}

impl ConveyorNode for SinkNode {
    fn get_result(&self, out: &mut dyn Any) {
        write_result::<()>(
            out,
            Err(Error::new(
                Code::InvalidState,
                "a sink node cannot return a result",
            )),
        );
    }
}

impl ConveyorStorage for SinkNode {
    fn space(&self) -> usize {
        1
    }

    fn queued(&self) -> usize {
        0
    }

    fn child_has_fired(&self) {
        let child = self.child.borrow().clone();
        let Some(child) = child else {
            return;
        };
        if let Err(error) = pull::<()>(&child) {
            if error.is_critical() && !self.event.is_armed() {
                self.event.arm_last();
            }
            let collection = self
                .collection
                .borrow()
                .as_ref()
                .and_then(|(collection, _)| collection.upgrade());
            if let Some(collection) = collection {
                collection.fail(error);
            }
        }
    }

    // A sink always has space, so nothing above ever needs releasing.
    fn parent_has_fired(&self) {}

    fn set_parent(&self, _parent: Weak<dyn ConveyorStorage>) {}
}

impl FireEvent for SinkNode {
    // Queued only to destroy the chain after a critical error.
    fn fire(&self) {
        *self.child.borrow_mut() = None;
        *self.child_storage.borrow_mut() = None;
        if let Some((collection, index)) = self.collection.borrow_mut().take() {
            if let Some(collection) = collection.upgrade() {
                collection.retire(index);
            }
        }
    }
}

/// Loop-owned collection absorbing detached chains for the loop's lifetime.
/// Dead sinks are scavenged from an `arm_last`-scheduled sweep; critical
/// failures go to the installable error handler.
pub(crate) struct SinkCollection {
    sinks: RefCell<Vec<Option<Rc<SinkNode>>>>,
    free: RefCell<Vec<usize>>,
    retired: RefCell<Vec<usize>>,
    error_handler: RefCell<Box<dyn FnMut(Error)>>,
    event: EventHandle,
}

impl SinkCollection {
    pub(crate) fn new(queue: &Rc<RefCell<EventQueue>>) -> Rc<SinkCollection> {
        Rc::new_cyclic(|me: &Weak<SinkCollection>| SinkCollection {
            sinks: RefCell::new(Vec::new()),
            free: RefCell::new(Vec::new()),
            retired: RefCell::new(Vec::new()),
            // Detached chains have no user-visible failure channel.
            error_handler: RefCell::new(Box::new(|_| {})),
            event: EventHandle::new(queue, me.clone()),
        })
    }

    pub(crate) fn add(self: Rc<Self>, conveyor: Conveyor<()>, queue: &Rc<RefCell<EventQueue>>) {
        let index = match self.free.borrow_mut().pop() {
            Some(index) => index,
            None => {
                self.sinks.borrow_mut().push(None);
                self.sinks.borrow().len() - 1
            }
        };
        let sink = SinkNode::new(conveyor, queue, Some((Rc::downgrade(&self), index)));
        self.sinks.borrow_mut()[index] = Some(sink);
    }

    pub(crate) fn set_error_handler(&self, handler: Box<dyn FnMut(Error)>) {
        *self.error_handler.borrow_mut() = handler;
    }

    fn fail(&self, error: Error) {
        (self.error_handler.borrow_mut())(error);
    }

    fn retire(&self, index: usize) {
        self.retired.borrow_mut().push(index);
        self.event.arm_last();
    }

    /// Number of chains currently held. Exposed for the loop's quiescence
    /// accounting.
    pub(crate) fn live(&self) -> usize {
        self.sinks.borrow().iter().filter(|s| s.is_some()).count()
    }
}

impl FireEvent for SinkCollection {
    fn fire(&self) {
        loop {
            let Some(index) = self.retired.borrow_mut().pop() else {
                break;
            };
            self.sinks.borrow_mut()[index] = None;
            self.free.borrow_mut().push(index);
        }
    }
}
