//! Deriveds (lazily cached computations).

use std::any::Any;
use std::fmt;
use std::fmt::Formatter;
use std::hash::Hash;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::graph::PrevTracking;
use crate::node::{ComputeFn, DebugEvent, NodeFlags, NodeHandle, NodeId, NodeKind};
use crate::propagate::Dispatch;
use crate::root::Root;
use crate::utils::values_equal;

/// A reactive holder whose value is produced by a getter over other reactive
/// reads.
///
/// Deriveds are lazy: the getter does not run until the first read, and runs
/// again only when a read finds the cached value stale. A recomputation that
/// produces an equal value (NaN-aware) does not wake subscribers.
///
/// # Example
/// ```rust
/// # use alder_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_source(2);
/// let double = create_derived(move || state.get() * 2);
///
/// assert_eq!(double.get(), 4);
/// state.set(3);
/// assert_eq!(double.get(), 6);
/// # });
/// ```
pub struct Derived<T: 'static> {
    id: NodeId,
    root: &'static Root,
    /// Where the derived was created, for diagnostics.
    #[cfg(debug_assertions)]
    created_at: &'static std::panic::Location<'static>,
    _phantom: PhantomData<T>,
}

/// Options for [`create_derived_with`]: a getter, an optional setter, and
/// optional debug hooks.
pub struct DerivedOptions<T: 'static> {
    get: Box<dyn FnMut() -> T>,
    set: Option<Box<dyn FnMut(T)>>,
    on_track: Option<Rc<dyn Fn(&DebugEvent)>>,
    on_trigger: Option<Rc<dyn Fn(&DebugEvent)>>,
}

impl<T> DerivedOptions<T> {
    /// Options computing the value with `get`.
    pub fn new(get: impl FnMut() -> T + 'static) -> Self {
        Self {
            get: Box::new(get),
            set: None,
            on_track: None,
            on_trigger: None,
        }
    }

    /// Makes the derived writable: assignments are forwarded to `set`.
    pub fn with_setter(mut self, set: impl FnMut(T) + 'static) -> Self {
        self.set = Some(Box::new(set));
        self
    }

    /// Installs a hook fired (in debug builds) when the derived records a
    /// dependency.
    pub fn on_track(mut self, hook: impl Fn(&DebugEvent) + 'static) -> Self {
        self.on_track = Some(Rc::new(hook));
        self
    }

    /// Installs a hook fired (in debug builds) when the derived is triggered
    /// through keyed tracking.
    pub fn on_trigger(mut self, hook: impl Fn(&DebugEvent) + 'static) -> Self {
        self.on_trigger = Some(Rc::new(hook));
        self
    }
}

/// Creates a new [`Derived`] from a getter.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_derived<T: PartialEq + 'static>(f: impl FnMut() -> T + 'static) -> Derived<T> {
    create_derived_with(DerivedOptions::new(f))
}

/// Creates a new [`Derived`] from [`DerivedOptions`].
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_derived_with<T: PartialEq + 'static>(options: DerivedOptions<T>) -> Derived<T> {
    let root = Root::global();
    let mut get = options.get;
    let compute: ComputeFn = Box::new(move |slot| {
        let new = get();
        match slot.as_mut().and_then(|value| value.downcast_mut::<T>()) {
            Some(old) => {
                if values_equal(old, &new) {
                    false
                } else {
                    *old = new;
                    true
                }
            }
            None => {
                *slot = Some(Box::new(new));
                true
            }
        }
    });
    let assign = options.set.map(|mut set| {
        Box::new(move |value: Box<dyn Any>| {
            let Ok(value) = value.downcast::<T>() else {
                unreachable!("derived type mismatch");
            };
            set(*value);
        }) as Box<dyn FnMut(Box<dyn Any>)>
    });
    let id = root.create_node(
        NodeKind::Derived {
            value: None,
            compute: Some(compute),
            assign,
        },
        NodeFlags::MUTABLE | NodeFlags::DIRTY,
    );
    {
        let mut nodes = root.nodes.borrow_mut();
        let node = &mut nodes[id];
        node.on_track = options.on_track;
        node.on_trigger = options.on_trigger;
    }
    Derived {
        id,
        root,
        #[cfg(debug_assertions)]
        created_at: std::panic::Location::caller(),
        _phantom: PhantomData,
    }
}

/// Restores a derived's state if its getter unwinds: the callback and cache
/// slot go back into the node, staleness is cleared so the next read retries
/// cleanly, and the tracking pass is closed.
struct ComputeGuard {
    root: &'static Root,
    id: NodeId,
    prev: PrevTracking,
    prev_owner: NodeId,
    state: Option<(ComputeFn, Option<Box<dyn Any>>)>,
}

impl Drop for ComputeGuard {
    fn drop(&mut self) {
        if let Some((compute, value)) = self.state.take() {
            self.root.current_owner.set(self.prev_owner);
            let mut nodes = self.root.nodes.borrow_mut();
            if let Some(node) = nodes.get_mut(self.id) {
                if let NodeKind::Derived {
                    compute: slot_compute,
                    value: slot_value,
                    ..
                } = &mut node.kind
                {
                    *slot_compute = Some(compute);
                    *slot_value = value;
                }
                node.flags.remove(NodeFlags::DIRTY | NodeFlags::PENDING);
            }
            drop(nodes);
            self.root.end_tracking(self.id, self.prev);
        }
    }
}

impl<T> Derived<T> {
    pub(crate) fn id(self) -> NodeId {
        self.id
    }

    fn disposed_message(self) -> String {
        #[cfg(not(debug_assertions))]
        return "derived was disposed".to_string();

        #[cfg(debug_assertions)]
        return format!("derived was disposed. Created at {}", self.created_at);
    }

    /// Returns `true` if the derived has not been disposed.
    pub fn is_alive(self) -> bool {
        self.root.nodes.borrow().get(self.id).is_some()
    }

    /// Frees the node backing this derived. Accessing it afterwards panics.
    pub fn dispose(self) {
        NodeHandle(self.id, self.root).dispose();
    }

    /// Records this derived as a dependency of the currently evaluating
    /// subscriber, refreshing the cache first if it is stale.
    pub fn track(self) {
        self.ensure_fresh();
        if let Some(sub) = self.root.current_sub.get() {
            self.root.link(self.id, sub);
        }
    }

    /// Recomputes if known stale; resolves a pending mark with a dirty check
    /// down the dependency chain first.
    fn ensure_fresh(self) {
        let (flags, dep_head, unset) = {
            let nodes = self.root.nodes.borrow();
            let node = match nodes.get(self.id) {
                Some(node) => node,
                None => panic!("{}", self.disposed_message()),
            };
            let unset = match &node.kind {
                NodeKind::Derived { value, .. } => value.is_none(),
                _ => unreachable!("node is not a derived"),
            };
            (node.flags, node.dep_head, unset)
        };
        if flags.contains(NodeFlags::RECURSED_CHECK) {
            // Reading a derived while its own getter runs: hand back the
            // current cache rather than re-entering the getter.
            return;
        }
        if flags.contains(NodeFlags::DIRTY) || unset {
            self.recompute();
        } else if flags.contains(NodeFlags::PENDING) {
            let dirty = match dep_head {
                Some(head) => self.root.check_dirty(head, self.id),
                None => {
                    if let Some(node) = self.root.nodes.borrow_mut().get_mut(self.id) {
                        node.flags.remove(NodeFlags::PENDING);
                    }
                    false
                }
            };
            if dirty {
                self.recompute();
            }
        }
    }

    fn recompute(self) {
        let root = self.root;
        // Anything the previous run created belongs to that run.
        root.dispose_children(self.id);
        let prev = root.start_tracking(self.id);
        let taken = {
            let mut nodes = root.nodes.borrow_mut();
            match nodes.get_mut(self.id).map(|node| &mut node.kind) {
                Some(NodeKind::Derived { compute, value, .. }) => {
                    compute.take().map(|compute| (compute, value.take()))
                }
                _ => None,
            }
        };
        let Some(state) = taken else {
            root.end_tracking(self.id, prev);
            return;
        };
        let prev_owner = root.current_owner.replace(self.id);
        let mut guard = ComputeGuard {
            root,
            id: self.id,
            prev,
            prev_owner,
            state: Some(state),
        };
        let changed = {
            let (compute, slot) = guard.state.as_mut().expect("compute state taken");
            compute(slot)
        };
        let (compute, value) = guard.state.take().expect("compute state taken");
        std::mem::forget(guard);
        root.current_owner.set(prev_owner);
        {
            let mut nodes = root.nodes.borrow_mut();
            if let Some(node) = nodes.get_mut(self.id) {
                if let NodeKind::Derived {
                    compute: slot_compute,
                    value: slot_value,
                    ..
                } = &mut node.kind
                {
                    *slot_compute = Some(compute);
                    *slot_value = value;
                }
            }
        }
        root.end_tracking(self.id, prev);
        if changed {
            let mut to_dispatch = Dispatch::new();
            {
                let mut nodes = root.nodes.borrow_mut();
                let links = root.links.borrow();
                if let Some(head) = nodes.get(self.id).and_then(|node| node.sub_head) {
                    Root::shallow_propagate_in(&mut nodes, &links, head, &mut to_dispatch);
                }
            }
            for id in to_dispatch {
                root.dispatch_observer(id);
            }
        }
    }

    /// Gets the cached value without tracking or refreshing. Panics if the
    /// derived has never been evaluated.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with_untracked<U>(self, f: impl FnOnce(&T) -> U) -> U {
        let nodes = self.root.nodes.borrow();
        let node = match nodes.get(self.id) {
            Some(node) => node,
            None => panic!("{}", self.disposed_message()),
        };
        let NodeKind::Derived { value, .. } = &node.kind else {
            unreachable!("node is not a derived");
        };
        let value = value.as_ref().expect("derived has not been evaluated");
        f(value.downcast_ref().expect("derived type mismatch"))
    }

    /// Gets the value, refreshing it if stale and tracking it in the current
    /// subscriber.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.track();
        self.with_untracked(f)
    }

    /// Gets the value, refreshing it if stale and tracking it. The type must
    /// implement [`Copy`]; otherwise use [`Derived::get_clone`] or
    /// [`Derived::with`].
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get(self) -> T
    where
        T: Copy,
    {
        self.track();
        self.with_untracked(|value| *value)
    }

    /// Gets the value, refreshing it if stale, tracking it and cloning it.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone(self) -> T
    where
        T: Clone,
    {
        self.track();
        self.with_untracked(Clone::clone)
    }

    /// Reads the value without creating a dependency edge. Stale caches are
    /// still refreshed.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn peek(self) -> T
    where
        T: Copy,
    {
        self.ensure_fresh();
        self.with_untracked(|value| *value)
    }

    /// Writes through the setter when one was provided; without a setter the
    /// write is a debug warning and otherwise ignored.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set(self, new: T) {
        let assign = {
            let mut nodes = self.root.nodes.borrow_mut();
            let node = match nodes.get_mut(self.id) {
                Some(node) => node,
                None => panic!("{}", self.disposed_message()),
            };
            let NodeKind::Derived { assign, .. } = &mut node.kind else {
                unreachable!("node is not a derived");
            };
            assign.take()
        };
        match assign {
            Some(mut assign) => {
                assign(Box::new(new));
                let mut nodes = self.root.nodes.borrow_mut();
                if let Some(NodeKind::Derived { assign: slot, .. }) =
                    nodes.get_mut(self.id).map(|node| &mut node.kind)
                {
                    *slot = Some(assign);
                }
            }
            None => {
                crate::utils::debug_warn!("write to a derived without a setter is ignored");
            }
        }
    }
}

/// `Clone` + `Copy` are implemented manually so that `T` needs no bounds.
impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Derived<T> {}

impl<T: PartialEq> PartialEq for Derived<T> {
    fn eq(&self, other: &Self) -> bool {
        self.with(|value| other.with(|other| value == other))
    }
}
impl<T: Eq> Eq for Derived<T> {}
impl<T: Hash> Hash for Derived<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.with(|value| value.hash(state))
    }
}

impl<T: fmt::Debug> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Display> fmt::Display for Derived<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for Derived<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn derived_memoizes() {
        let _ = create_root(|| {
            let a = create_source(2);
            let calls = Rc::new(Cell::new(0));
            let d = create_derived({
                let calls = Rc::clone(&calls);
                move || {
                    calls.set(calls.get() + 1);
                    a.get() * 10
                }
            });
            assert_eq!(d.get(), 20);
            assert_eq!(d.get(), 20);
            assert_eq!(calls.get(), 1);

            a.set(2); // Unchanged: no recompute on the next read.
            assert_eq!(d.get(), 20);
            assert_eq!(calls.get(), 1);

            a.set(3);
            assert_eq!(d.get(), 30);
            assert_eq!(calls.get(), 2);
        });
    }

    #[test]
    fn first_evaluation_is_lazy() {
        let _ = create_root(|| {
            let calls = Rc::new(Cell::new(0));
            let d = create_derived({
                let calls = Rc::clone(&calls);
                move || {
                    calls.set(calls.get() + 1);
                    1
                }
            });
            assert_eq!(calls.get(), 0);
            assert_eq!(d.get(), 1);
            assert_eq!(calls.get(), 1);
        });
    }

    #[test]
    fn derived_chains_update_through() {
        let _ = create_root(|| {
            let state = create_source(0);
            let double = create_derived(move || state.get() * 2);
            let quadruple = create_derived(move || double.get() * 2);

            assert_eq!(quadruple.get(), 0);
            state.set(1);
            assert_eq!(quadruple.get(), 4);
        });
    }

    #[test]
    fn conditional_dependencies_are_recreated_each_run() {
        let _ = create_root(|| {
            let condition = create_source(true);
            let state1 = create_source(0);
            let state2 = create_source(1);
            let calls = Rc::new(Cell::new(0));
            let d = create_derived({
                let calls = Rc::clone(&calls);
                move || {
                    calls.set(calls.get() + 1);
                    if condition.get() {
                        state1.get()
                    } else {
                        state2.get()
                    }
                }
            });
            create_observer(move || {
                let _ = d.get();
            });
            assert_eq!(calls.get(), 1);

            state1.set(1);
            assert_eq!(calls.get(), 2);

            state2.set(2);
            assert_eq!(calls.get(), 2); // not tracked

            condition.set(false);
            assert_eq!(calls.get(), 3);

            state1.set(2);
            assert_eq!(calls.get(), 3); // no longer tracked

            state2.set(3);
            assert_eq!(calls.get(), 4);
        });
    }

    #[test]
    fn writable_derived_forwards_to_the_setter() {
        let _ = create_root(|| {
            let celsius = create_source(0.0f64);
            let fahrenheit = create_derived_with(
                DerivedOptions::new(move || celsius.get() * 9.0 / 5.0 + 32.0)
                    .with_setter(move |f: f64| celsius.set((f - 32.0) * 5.0 / 9.0)),
            );
            assert_eq!(fahrenheit.get(), 32.0);
            fahrenheit.set(212.0);
            assert_eq!(celsius.get(), 100.0);
            assert_eq!(fahrenheit.get(), 212.0);
        });
    }

    #[test]
    fn readonly_derived_ignores_writes() {
        let _ = create_root(|| {
            let d = create_derived(|| 1);
            d.set(2);
            assert_eq!(d.get(), 1);
        });
    }

    #[test]
    fn panicking_getter_retries_on_the_next_read() {
        let _ = create_root(|| {
            let fail = Rc::new(Cell::new(true));
            let d = create_derived({
                let fail = Rc::clone(&fail);
                move || {
                    if fail.get() {
                        panic!("getter failed");
                    }
                    42
                }
            });
            let caught =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| d.get())).is_err();
            assert!(caught);
            fail.set(false);
            assert_eq!(d.get(), 42);
        });
    }

    #[test]
    fn untracked_reads_in_a_getter_do_not_subscribe() {
        let _ = create_root(|| {
            let state = create_source(1);
            let double = create_derived(move || untrack(|| state.get() * 2));
            assert_eq!(double.get(), 2);

            state.set(2);
            assert_eq!(double.get(), 2);
        });
    }
}
