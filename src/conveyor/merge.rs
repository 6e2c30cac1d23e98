//! Merging any number of conveyors into a single lane.
//!
//! Each attached conveyor is consumed by an appendage, a one-slot storage
//! acting as that chain's parent. The merge node exposes one appendage's
//! value per firing, round-robin across appendages.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::error::{Code, Error, Result};

use super::node::{pull, write_result, ConveyorNode, ConveyorStorage, ParentLink};
use super::queue::{EventHandle, FireEvent};
use super::{with_current, Conveyor};

/// Attach handle returned by [`Conveyor::merge`]. Additional conveyors fed
/// into the merged lane are attached through this handle.
pub struct MergeConveyor<T: 'static> {
    data: Rc<MergeData<T>>,
}

impl<T: 'static> MergeConveyor<T> {
    /// Routes all of `conveyor`'s values into the merged lane.
    pub fn attach(&mut self, conveyor: Conveyor<T>) {
        let storage = conveyor.storage.clone();
        let appendage = Rc::new(Appendage {
            child: RefCell::new(Some(conveyor.into_node())),
            child_storage: RefCell::new(storage.clone()),
            slot: RefCell::new(None),
            merger: self.data.merger.borrow().clone(),
        });
        if let Some(storage) = storage.as_ref().and_then(Weak::upgrade) {
            let appendage_dyn: Rc<dyn ConveyorStorage> = appendage.clone();
            let parent: Weak<dyn ConveyorStorage> = Rc::downgrade(&appendage_dyn);
            storage.set_parent(parent);
        }
        self.data.appendages.borrow_mut().push(appendage);
    }
}

pub(crate) struct MergeData<T: 'static> {
    appendages: RefCell<Vec<Rc<Appendage<T>>>>,
    merger: RefCell<Option<Weak<MergeNode<T>>>>,
}

pub(crate) fn new_merge<T: 'static>(conveyor: Conveyor<T>) -> (Conveyor<T>, MergeConveyor<T>) {
    let data = Rc::new(MergeData {
        appendages: RefCell::new(Vec::new()),
        merger: RefCell::new(None),
    });
    let node = with_current(|lp| {
        Rc::new_cyclic(|me: &Weak<MergeNode<T>>| MergeNode {
            data: data.clone(),
            next_appendage: Cell::new(0),
            parent: ParentLink::new(),
            event: EventHandle::new(&lp.queue, me.clone()),
        })
    });
    *data.merger.borrow_mut() = Some(Rc::downgrade(&node));

    let mut handle = MergeConveyor { data };
    handle.attach(conveyor);

    let node_dyn: Rc<dyn ConveyorStorage> = node.clone();

    let storage: Weak<dyn ConveyorStorage> = Rc::downgrade(&node_dyn);
    (Conveyor::from_parts(node, Some(storage)), handle)
}

pub(crate) struct MergeNode<T: 'static> {
    data: Rc<MergeData<T>>,
    next_appendage: Cell<usize>,
    parent: ParentLink,
    event: EventHandle,
}

impl<T: 'static> ConveyorNode for MergeNode<T> {
    fn get_result(&self, out: &mut dyn Any) {
        let count = self.data.appendages.borrow().len();
        let start = self.next_appendage.get();
        for offset in 0..count {
            let index = (start + offset) % count;
            let appendage = self.data.appendages.borrow()[index].clone();
            let value = appendage.slot.borrow_mut().take();
            if let Some(result) = value {
                self.next_appendage.set((index + 1) % count);
                write_result(out, result);
                appendage.parent_has_fired();
                return;
            }
        }
        write_result::<T>(
            out,
            Err(Error::new(Code::InvalidState, "no merge value queued")),
        );
    }
}

impl<T: 'static> ConveyorStorage for MergeNode<T> {
    fn space(&self) -> usize {
        self.data
            .appendages
            .borrow()
            .iter()
            .filter(|a| a.slot.borrow().is_none())
            .count()
    }

    fn queued(&self) -> usize {
        self.data
            .appendages
            .borrow()
            .iter()
            .filter(|a| a.slot.borrow().is_some())
            .count()
    }

    fn child_has_fired(&self) {
        self.event.arm_next();
    }

    fn parent_has_fired(&self) {
        if self.queued() > 0 {
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

impl<T: 'static> FireEvent for MergeNode<T> {
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

/// One-slot storage consuming from one attached chain.
struct Appendage<T: 'static> {
    child: RefCell<Option<Rc<dyn ConveyorNode>>>,
    child_storage: RefCell<Option<Weak<dyn ConveyorStorage>>>,
    slot: RefCell<Option<Result<T>>>,
    merger: Option<Weak<MergeNode<T>>>,
}

impl<T: 'static> Appendage<T> {
    fn child_storage_has_element_queued(&self) -> bool {
        match self.child_storage.borrow().as_ref().and_then(Weak::upgrade) {
            Some(storage) => storage.queued() > 0,
            None => false,
        }
    }
}

impl<T: 'static> ConveyorStorage for Appendage<T> {
    fn space(&self) -> usize {
        if self.slot.borrow().is_none() {
            1
        } else {
            0
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
        if self.space() == 0 || !self.child_storage_has_element_queued() {
            return;
        }
        let child = self.child.borrow().clone();
        let Some(child) = child else {
            return;
        };
        *self.slot.borrow_mut() = Some(pull::<T>(&child));
        if let Some(merger) = self.merger.as_ref().and_then(Weak::upgrade) {
            merger.event.arm_next();
        }
    }

    fn parent_has_fired(&self) {
        if let Some(storage) = self.child_storage.borrow().as_ref().and_then(Weak::upgrade) {
            storage.parent_has_fired();
        }
    }

    fn set_parent(&self, _parent: Weak<dyn ConveyorStorage>) {}
}
