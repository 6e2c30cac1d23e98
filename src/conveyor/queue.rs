//! The loop-owned event queue.
//!
//! Events form a doubly-linked list threaded through an arena of slots, with
//! a permanent head sentinel at index 0. Nodes hold an [`EventHandle`] to
//! their slot; arming splices the slot into the list at one of three
//! positions and disarming splices it out, both in constant time.
//!
//! Cursors are "insert after this slot" anchors:
//!
//! - `next_insert` — where [`arm_next`] inserts; advanced past each
//!   insertion so a run of `arm_next` calls preserves call order. Reset to
//!   the head while an event fires, so events armed from inside `fire` run
//!   within the current turn.
//! - `later_insert` — where [`arm_later`] inserts; events land after the
//!   current "next" batch.
//! - `tail` — where [`arm_last`] inserts, without moving `later_insert`.
//!
//! [`arm_next`]: EventQueue::arm_next
//! [`arm_later`]: EventQueue::arm_later
//! [`arm_last`]: EventQueue::arm_last

use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// A schedulable unit. `fire` runs to completion without yielding.
pub(crate) trait FireEvent {
    fn fire(&self);
}

const HEAD: usize = 0;
const NIL: usize = usize::MAX;

struct Slot {
    prev: usize,
    next: usize,
    armed: bool,
    event: Option<Weak<dyn FireEvent>>,
}

impl Slot {
    fn detached(event: Option<Weak<dyn FireEvent>>) -> Slot {
        Slot {
            prev: NIL,
            next: NIL,
            armed: false,
            event,
        }
    }
}

pub(crate) struct EventQueue {
    slots: Vec<Slot>,
    free: Vec<usize>,
    tail: usize,
    next_insert: usize,
    later_insert: usize,
    runnable: bool,
}

impl EventQueue {
    pub(crate) fn new() -> EventQueue {
        EventQueue {
            slots: vec![Slot::detached(None)],
            free: Vec::new(),
            tail: HEAD,
            next_insert: HEAD,
            later_insert: HEAD,
            runnable: false,
        }
    }

    /// Registers a new slot for `event` and returns its index. The slot
    /// starts disarmed.
    pub(crate) fn register(&mut self, event: Weak<dyn FireEvent>) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Slot::detached(Some(event));
                index
            }
            None => {
                self.slots.push(Slot::detached(Some(event)));
                self.slots.len() - 1
            }
        }
    }

    /// Disarms and recycles a slot. Called when the owning node is dropped.
    pub(crate) fn release(&mut self, index: usize) {
        self.disarm(index);
        self.slots[index].event = None;
        self.free.push(index);
    }

    pub(crate) fn is_armed(&self, index: usize) -> bool {
        self.slots[index].armed
    }

    pub(crate) fn runnable(&self) -> bool {
        self.runnable
    }

    fn insert_after(&mut self, anchor: usize, index: usize) {
        let next = self.slots[anchor].next;
        self.slots[index].prev = anchor;
        self.slots[index].next = next;
        self.slots[anchor].next = index;
        match next {
            NIL => self.tail = index,
            n => self.slots[n].prev = index,
        }
        self.slots[index].armed = true;
        self.runnable = true;
    }

    /// Arms the event so it fires within the current turn batch. No-op if
    /// already armed.
    pub(crate) fn arm_next(&mut self, index: usize) {
        if self.slots[index].armed {
            return;
        }
        let anchor = self.next_insert;
        self.insert_after(anchor, index);
        self.next_insert = index;
        if self.later_insert == anchor {
            self.later_insert = index;
        }
    }

    /// Arms the event after the current "next" batch. No-op if already armed.
    pub(crate) fn arm_later(&mut self, index: usize) {
        if self.slots[index].armed {
            return;
        }
        let anchor = self.later_insert;
        self.insert_after(anchor, index);
        self.later_insert = index;
    }

    /// Arms the event at the very end of the queue. `later_insert` stays
    /// where it is, so this position is reserved for terminal actions.
    pub(crate) fn arm_last(&mut self, index: usize) {
        if self.slots[index].armed {
            return;
        }
        let anchor = self.tail;
        self.insert_after(anchor, index);
    }

    /// Splices the event out, fixing any cursor that pointed through it.
    pub(crate) fn disarm(&mut self, index: usize) {
        if !self.slots[index].armed {
            return;
        }
        let prev = self.slots[index].prev;
        let next = self.slots[index].next;
        self.slots[prev].next = next;
        match next {
            NIL => self.tail = prev,
            n => self.slots[n].prev = prev,
        }
        if self.next_insert == index {
            self.next_insert = prev;
        }
        if self.later_insert == index {
            self.later_insert = prev;
        }
        let slot = &mut self.slots[index];
        slot.prev = NIL;
        slot.next = NIL;
        slot.armed = false;
    }

    /// Removes and returns the front event, anchoring `next_insert` at the
    /// head so events armed while it fires run first.
    pub(crate) fn pop_front(&mut self) -> Option<Weak<dyn FireEvent>> {
        let index = self.slots[HEAD].next;
        if index == NIL {
            self.runnable = false;
            return None;
        }
        self.disarm(index);
        self.next_insert = HEAD;
        self.slots[index].event.clone()
    }
}

/// A node's registration with its loop's event queue.
///
/// Arming is a no-op once the owning loop is gone; dropping the handle
/// disarms and recycles the slot.
pub(crate) struct EventHandle {
    queue: Weak<RefCell<EventQueue>>,
    index: usize,
}

impl EventHandle {
    pub(crate) fn new(queue: &Rc<RefCell<EventQueue>>, event: Weak<dyn FireEvent>) -> EventHandle {
        let index = queue.borrow_mut().register(event);
        EventHandle {
            queue: Rc::downgrade(queue),
            index,
        }
    }

    pub(crate) fn arm_next(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.borrow_mut().arm_next(self.index);
        }
    }

    pub(crate) fn arm_later(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.borrow_mut().arm_later(self.index);
        }
    }

    pub(crate) fn arm_last(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.borrow_mut().arm_last(self.index);
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        match self.queue.upgrade() {
            Some(queue) => queue.borrow().is_armed(self.index),
            None => false,
        }
    }
}

impl Drop for EventHandle {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.borrow_mut().release(self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder {
        label: usize,
        log: Rc<RefCell<Vec<usize>>>,
    }

    impl FireEvent for Recorder {
        fn fire(&self) {
            self.log.borrow_mut().push(self.label);
        }
    }

    fn recorder(label: usize, log: &Rc<RefCell<Vec<usize>>>) -> Rc<Recorder> {
        Rc::new(Recorder {
            label,
            log: log.clone(),
        })
    }

    fn drain(queue: &mut EventQueue) {
        while let Some(event) = queue.pop_front() {
            if let Some(event) = event.upgrade() {
                event.fire();
            }
        }
    }

    #[test]
    fn next_before_later_before_last() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = EventQueue::new();

        let a = recorder(1, &log);
        let b = recorder(2, &log);
        let c = recorder(3, &log);
        let a_dyn: Rc<dyn FireEvent> = a.clone();
        let ia = queue.register(Rc::downgrade(&a_dyn));
        let b_dyn: Rc<dyn FireEvent> = b.clone();
        let ib = queue.register(Rc::downgrade(&b_dyn));
        let c_dyn: Rc<dyn FireEvent> = c.clone();
        let ic = queue.register(Rc::downgrade(&c_dyn));

        queue.arm_last(ic);
        queue.arm_later(ib);
        queue.arm_next(ia);

        drain(&mut queue);
        // arm_last landed at the tail of its time, but arm_later inserted
        // before it and arm_next before both.
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn arm_next_preserves_call_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = EventQueue::new();
        let events: Vec<_> = (1..=4).map(|i| recorder(i, &log)).collect();
        let indices: Vec<_> = events
            .iter()
            .map(|e| {
                let e_dyn: Rc<dyn FireEvent> = e.clone();
                queue.register(Rc::downgrade(&e_dyn))
            })
            .collect();
        for &i in &indices {
            queue.arm_next(i);
        }
        drain(&mut queue);
        assert_eq!(*log.borrow(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn arming_armed_event_is_noop() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = EventQueue::new();
        let a = recorder(1, &log);
        let a_dyn: Rc<dyn FireEvent> = a.clone();
        let ia = queue.register(Rc::downgrade(&a_dyn));
        queue.arm_next(ia);
        queue.arm_later(ia);
        queue.arm_last(ia);
        assert!(queue.is_armed(ia));
        drain(&mut queue);
        assert_eq!(*log.borrow(), vec![1]);
    }

    #[test]
    fn disarm_fixes_cursors() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = EventQueue::new();
        let a = recorder(1, &log);
        let b = recorder(2, &log);
        let c = recorder(3, &log);
        let a_dyn: Rc<dyn FireEvent> = a.clone();
        let ia = queue.register(Rc::downgrade(&a_dyn));
        let b_dyn: Rc<dyn FireEvent> = b.clone();
        let ib = queue.register(Rc::downgrade(&b_dyn));
        let c_dyn: Rc<dyn FireEvent> = c.clone();
        let ic = queue.register(Rc::downgrade(&c_dyn));

        queue.arm_next(ia);
        queue.arm_later(ib);
        // Both cursors sit behind b; removing it must pull them back.
        queue.disarm(ib);
        queue.arm_later(ic);

        drain(&mut queue);
        assert_eq!(*log.borrow(), vec![1, 3]);
        assert!(!queue.is_armed(ib));
    }

    #[test]
    fn released_slot_is_recycled() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = EventQueue::new();
        let a = recorder(1, &log);
        let a_dyn: Rc<dyn FireEvent> = a.clone();
        let ia = queue.register(Rc::downgrade(&a_dyn));
        queue.arm_next(ia);
        queue.release(ia);
        assert!(queue.pop_front().is_none());

        let b = recorder(2, &log);
        let b_dyn: Rc<dyn FireEvent> = b.clone();
        let ib = queue.register(Rc::downgrade(&b_dyn));
        assert_eq!(ia, ib);
    }
}
