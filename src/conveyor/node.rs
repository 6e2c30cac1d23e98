//! Conveyor node kinds and the storage protocol between them.
//!
//! A chain is a tree of nodes rooted at a sink or a user-held
//! [`Conveyor`](super::Conveyor) handle. Each non-leaf node owns its single
//! child; parents are reachable from below only through weak storage links.
//! Values move strictly by pulling: a storage node fires, notifies its
//! parent, and the parent pulls one element down through the stateless node
//! stack via `get_result`.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use crate::error::{Code, Error, Result};

use super::queue::{EventHandle, FireEvent};
use super::with_current;

/// The algorithmic element of a chain. `get_result` writes the next
/// value or error into the supplied carrier.
pub(crate) trait ConveyorNode {
    fn get_result(&self, out: &mut dyn Any);
}

/// The buffered edge between a child and a parent node.
pub(crate) trait ConveyorStorage {
    /// How many items can still be accepted before the storage must refuse.
    fn space(&self) -> usize;
    /// How many items are ready to be consumed by the parent.
    fn queued(&self) -> usize;
    /// Called by the child when a new item becomes available.
    fn child_has_fired(&self);
    /// Called by the parent when it has drained one item.
    fn parent_has_fired(&self);
    fn set_parent(&self, parent: Weak<dyn ConveyorStorage>);
    /// True once a one-shot source has given up its value.
    fn exhausted(&self) -> bool {
        false
    }
}

/// Writes `result` into a carrier expected to be `Option<Result<T>>`.
///
/// The carrier is the type-erasure boundary between nodes; a mismatch is a
/// bug in chain construction, not a recoverable condition.
pub(crate) fn write_result<T: 'static>(out: &mut dyn Any, result: Result<T>) {
    match out.downcast_mut::<Option<Result<T>>>() {
        Some(slot) => *slot = Some(result),
        None => panic!("conveyor chain produced a value of an unexpected type"),
    }
}

/// Pulls one element of type `T` out of `node`.
pub(crate) fn pull<T: 'static>(node: &Rc<dyn ConveyorNode>) -> Result<T> {
    let mut out: Option<Result<T>> = None;
    node.get_result(&mut out);
    out.unwrap_or_else(|| {
        Err(Error::new(
            Code::InvalidState,
            "dependency produced no value",
        ))
    })
}

/// Weak up-link from a storage node to the storage consuming it.
pub(crate) struct ParentLink(RefCell<Option<Weak<dyn ConveyorStorage>>>);

impl ParentLink {
    pub(crate) fn new() -> ParentLink {
        ParentLink(RefCell::new(None))
    }

    pub(crate) fn set(&self, parent: Weak<dyn ConveyorStorage>) {
        *self.0.borrow_mut() = Some(parent);
    }

    pub(crate) fn get(&self) -> Option<Rc<dyn ConveyorStorage>> {
        self.0.borrow().as_ref().and_then(Weak::upgrade)
    }
}

/// Queue position used when a node arms itself at creation.
#[derive(Clone, Copy)]
pub(crate) enum Arming {
    Next,
    Later,
    Last,
}

impl EventHandle {
    pub(crate) fn arm(&self, arming: Arming) {
        match arming {
            Arming::Next => self.arm_next(),
            Arming::Later => self.arm_later(),
            Arming::Last => self.arm_last(),
        }
    }
}

// One-shot delivery progress, shared by the immediate and one-time nodes.
// After the value went to a parent, the node schedules itself once more so
// a sink observes the terminal `Exhausted` error and dissolves the chain.
const FRESH: u8 = 0;
const DELIVERED: u8 = 1;
const FINISHED: u8 = 2;

/// Holds exactly one value or error, armed once at creation so the first
/// poll delivers it.
pub(crate) struct ImmediateNode<T: 'static> {
    value: RefCell<Option<Result<T>>>,
    state: Cell<u8>,
    parent: ParentLink,
    event: EventHandle,
}

impl<T: 'static> ImmediateNode<T> {
    pub(crate) fn new(result: Result<T>, arming: Arming) -> Rc<ImmediateNode<T>> {
        let node = with_current(|lp| {
            Rc::new_cyclic(|me: &Weak<ImmediateNode<T>>| ImmediateNode {
                value: RefCell::new(Some(result)),
                state: Cell::new(FRESH),
                parent: ParentLink::new(),
                event: EventHandle::new(&lp.queue, me.clone()),
            })
        });
        node.event.arm(arming);
        node
    }
}

impl<T: 'static> ConveyorNode for ImmediateNode<T> {
    fn get_result(&self, out: &mut dyn Any) {
        if self.state.get() != FRESH {
            write_result::<T>(out, Err(Error::exhausted("value already taken")));
            return;
        }
        let value = self.value.borrow_mut().take();
        self.state.set(DELIVERED);
        match value {
            Some(result) => write_result(out, result),
            None => write_result::<T>(out, Err(Error::new(Code::InvalidState, "no value present"))),
        }
    }
}

impl<T: 'static> ConveyorStorage for ImmediateNode<T> {
    fn space(&self) -> usize {
        0
    }

    fn queued(&self) -> usize {
        if self.state.get() == FRESH {
            1
        } else {
            0
        }
    }

    fn child_has_fired(&self) {
        debug_assert!(false, "immediate node has no child");
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
        self.state.get() != FRESH
    }
}

impl<T: 'static> FireEvent for ImmediateNode<T> {
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

/// Transforms child values through `func` and child errors through
/// `error_func`; both return `Result` so substitution and propagation use
/// the same path.
pub(crate) struct ConvertNode<In, Out, F, EF> {
    child: Rc<dyn ConveyorNode>,
    func: RefCell<F>,
    error_func: RefCell<EF>,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In, Out, F, EF> ConvertNode<In, Out, F, EF>
where
    In: 'static,
    Out: 'static,
    F: FnMut(In) -> Result<Out> + 'static,
    EF: FnMut(Error) -> Result<Out> + 'static,
{
    pub(crate) fn new(child: Rc<dyn ConveyorNode>, func: F, error_func: EF) -> Self {
        ConvertNode {
            child,
            func: RefCell::new(func),
            error_func: RefCell::new(error_func),
            _marker: PhantomData,
        }
    }
}

impl<In, Out, F, EF> ConveyorNode for ConvertNode<In, Out, F, EF>
where
    In: 'static,
    Out: 'static,
    F: FnMut(In) -> Result<Out> + 'static,
    EF: FnMut(Error) -> Result<Out> + 'static,
{
    fn get_result(&self, out: &mut dyn Any) {
        let result = match pull::<In>(&self.child) {
            Ok(value) => (self.func.borrow_mut())(value),
            Err(error) => (self.error_func.borrow_mut())(error),
        };
        write_result(out, result);
    }
}

/// Pure ownership pass-through; keeps `attachment` alive until the node
/// dies.
pub(crate) struct AttachNode<A> {
    child: Rc<dyn ConveyorNode>,
    _attachment: A,
}

impl<A: 'static> AttachNode<A> {
    pub(crate) fn new(child: Rc<dyn ConveyorNode>, attachment: A) -> AttachNode<A> {
        AttachNode {
            child,
            _attachment: attachment,
        }
    }
}

impl<A: 'static> ConveyorNode for AttachNode<A> {
    fn get_result(&self, out: &mut dyn Any) {
        self.child.get_result(out);
    }
}

/// Storage edge with a bounded queue; the sole source of backpressure in a
/// chain. When full it refuses `child_has_fired`, which stops the child
/// from arming until `parent_has_fired` releases room.
pub(crate) struct BufferNode<T: 'static> {
    child: RefCell<Option<Rc<dyn ConveyorNode>>>,
    child_storage: RefCell<Option<Weak<dyn ConveyorStorage>>>,
    queue: RefCell<VecDeque<Result<T>>>,
    limit: usize,
    parent: ParentLink,
    event: EventHandle,
}

impl<T: 'static> BufferNode<T> {
    pub(crate) fn new(
        child: Rc<dyn ConveyorNode>,
        child_storage: Option<Weak<dyn ConveyorStorage>>,
        limit: usize,
    ) -> Rc<BufferNode<T>> {
        with_current(|lp| {
            Rc::new_cyclic(|me: &Weak<BufferNode<T>>| BufferNode {
                child: RefCell::new(Some(child)),
                child_storage: RefCell::new(child_storage),
                queue: RefCell::new(VecDeque::new()),
                limit,
                parent: ParentLink::new(),
                event: EventHandle::new(&lp.queue, me.clone()),
            })
        })
    }

    fn child_storage(&self) -> Option<Rc<dyn ConveyorStorage>> {
        self.child_storage.borrow().as_ref().and_then(Weak::upgrade)
    }
}

impl<T: 'static> ConveyorNode for BufferNode<T> {
    fn get_result(&self, out: &mut dyn Any) {
        let front = self.queue.borrow_mut().pop_front();
        match front {
            Some(result) => write_result(out, result),
            None => write_result::<T>(
                out,
                Err(Error::new(Code::InvalidState, "buffer has no element queued")),
            ),
        }
        // One unit of space came back; let the producer side resume.
        if let Some(storage) = self.child_storage() {
            storage.parent_has_fired();
        }
    }
}

impl<T: 'static> ConveyorStorage for BufferNode<T> {
    fn space(&self) -> usize {
        self.limit.saturating_sub(self.queue.borrow().len())
    }

    fn queued(&self) -> usize {
        self.queue.borrow().len()
    }

    fn child_has_fired(&self) {
        if self.space() == 0 {
            return;
        }
        let child = self.child.borrow().clone();
        let Some(child) = child else {
            return;
        };
        let result = pull::<T>(&child);
        self.queue.borrow_mut().push_back(result);
        self.event.arm_next();
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

impl<T: 'static> FireEvent for BufferNode<T> {
    fn fire(&self) {
        // A critical error at the head dissolves everything below this edge.
        let head_is_critical = matches!(
            self.queue.borrow().front(),
            Some(Err(error)) if error.is_critical()
        );
        if head_is_critical {
            *self.child.borrow_mut() = None;
            *self.child_storage.borrow_mut() = None;
        }

        let had_space = self.space() > 0;
        if let Some(parent) = self.parent.get() {
            parent.child_has_fired();
            if self.queued() > 0 && parent.space() > 0 {
                self.event.arm_later();
            }
        }
        if !had_space {
            if let Some(storage) = self.child_storage() {
                storage.parent_has_fired();
            }
        }
    }
}
