//! Reactive sources.

use std::fmt;
use std::fmt::Formatter;
use std::hash::Hash;
use std::marker::PhantomData;

use crate::deriveds::{create_derived, Derived};
use crate::node::{NodeFlags, NodeHandle, NodeId, NodeKind};
use crate::propagate::Dispatch;
use crate::root::Root;
use crate::utils::erased_eq;

/// A reactive holder of a plain value: the only kind of node that accepts
/// writes without a user-defined recomputation.
///
/// The handle is `Copy`; the value lives in the current root. Reads inside a
/// derived getter or an observer automatically record a dependency edge, so
/// writing the source later re-runs exactly the consumers that read it.
///
/// # Example
/// ```rust
/// # use alder_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_source(1);
/// assert_eq!(state.get(), 1);
/// state.set(2);
/// assert_eq!(state.get(), 2);
/// # });
/// ```
pub struct Source<T: 'static> {
    id: NodeId,
    root: &'static Root,
    /// Where the source was created, for diagnostics.
    #[cfg(debug_assertions)]
    created_at: &'static std::panic::Location<'static>,
    _phantom: PhantomData<T>,
}

/// Creates a new [`Source`].
///
/// Writes go through a NaN-aware equality gate: setting a source to a value
/// equal to the current one is a no-op and wakes nobody.
///
/// # Example
/// ```rust
/// # use alder_reactive::*;
/// # let _ = create_root(|| {
/// let greeting = create_source("Hello".to_string());
/// let shout = create_derived(move || greeting.with(|g| g.to_uppercase()));
/// assert_eq!(shout.get_clone(), "HELLO");
///
/// greeting.set("Goodbye".to_string());
/// assert_eq!(shout.get_clone(), "GOODBYE");
/// # });
/// ```
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_source<T: PartialEq + 'static>(value: T) -> Source<T> {
    create_source_impl(value, false)
}

/// Creates a [`Source`] marked shallow. The core treats it like any other
/// source; the flag tells the container-proxy layer not to wrap the value's
/// interior.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_shallow_source<T: PartialEq + 'static>(value: T) -> Source<T> {
    create_source_impl(value, true)
}

#[cfg_attr(debug_assertions, track_caller)]
fn create_source_impl<T: PartialEq + 'static>(value: T, shallow: bool) -> Source<T> {
    let root = Root::global();
    let id = root.create_node(
        NodeKind::Source {
            value: Some(Box::new(value)),
            old_value: None,
            eq: erased_eq::<T>,
            shallow,
        },
        NodeFlags::MUTABLE,
    );
    Source {
        id,
        root,
        #[cfg(debug_assertions)]
        created_at: std::panic::Location::caller(),
        _phantom: PhantomData,
    }
}

impl<T> Source<T> {
    pub(crate) fn id(self) -> NodeId {
        self.id
    }

    fn disposed_message(self) -> String {
        #[cfg(not(debug_assertions))]
        return "source was disposed".to_string();

        #[cfg(debug_assertions)]
        return format!("source was disposed. Created at {}", self.created_at);
    }

    /// Returns `true` if the source is still alive, i.e. has not been
    /// disposed.
    pub fn is_alive(self) -> bool {
        self.root.nodes.borrow().get(self.id).is_some()
    }

    /// Frees the node backing this source. Accessing it afterwards panics.
    pub fn dispose(self) {
        NodeHandle(self.id, self.root).dispose();
    }

    /// Whether the source was created with [`create_shallow_source`].
    pub fn is_shallow(self) -> bool {
        let nodes = self.root.nodes.borrow();
        match nodes.get(self.id).map(|node| &node.kind) {
            Some(NodeKind::Source { shallow, .. }) => *shallow,
            _ => panic!("{}", self.disposed_message()),
        }
    }

    /// Records this source as a dependency of the currently evaluating
    /// subscriber. Done automatically by every non-`peek` read.
    pub fn track(self) {
        self.settle();
        if let Some(sub) = self.root.current_sub.get() {
            self.root.link(self.id, sub);
        }
    }

    /// Consumes a pending write on read: clears the dirty bit and, if the
    /// value actually changed since the last read, promotes pending
    /// subscribers to dirty.
    fn settle(self) {
        let mut to_dispatch = Dispatch::new();
        {
            let mut nodes = self.root.nodes.borrow_mut();
            let links = self.root.links.borrow();
            let Some(node) = nodes.get(self.id) else { return };
            if !node.flags.contains(NodeFlags::DIRTY) {
                return;
            }
            let sub_head = node.sub_head;
            let changed = {
                let node = &mut nodes[self.id];
                node.flags.remove(NodeFlags::DIRTY);
                let NodeKind::Source {
                    value, old_value, eq, ..
                } = &mut node.kind
                else {
                    return;
                };
                match (old_value.take(), value.as_deref()) {
                    (Some(old), Some(current)) => !eq(old.as_ref(), current),
                    // No before-image (e.g. the write went through
                    // `replace`): assume changed.
                    _ => true,
                }
            };
            if changed {
                if let Some(head) = sub_head {
                    Root::shallow_propagate_in(&mut nodes, &links, head, &mut to_dispatch);
                }
            }
        }
        for id in to_dispatch {
            self.root.dispatch_observer(id);
        }
    }

    /// Gets a value out of the source without tracking it.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with_untracked<U>(self, f: impl FnOnce(&T) -> U) -> U {
        let nodes = self.root.nodes.borrow();
        let node = match nodes.get(self.id) {
            Some(node) => node,
            None => panic!("{}", self.disposed_message()),
        };
        let NodeKind::Source { value, .. } = &node.kind else {
            unreachable!("node is not a source");
        };
        let value = value.as_ref().expect("source value taken during update");
        f(value.downcast_ref().expect("source type mismatch"))
    }

    /// Gets a value out of the source, tracking it in the current subscriber.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn with<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.track();
        self.with_untracked(f)
    }

    /// Gets the value without tracking. The type must implement [`Copy`];
    /// otherwise use [`Source::get_clone_untracked`] or
    /// [`Source::with_untracked`].
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_untracked(self) -> T
    where
        T: Copy,
    {
        self.with_untracked(|value| *value)
    }

    /// Gets the value without tracking, cloning it.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone_untracked(self) -> T
    where
        T: Clone,
    {
        self.with_untracked(Clone::clone)
    }

    /// Gets the value, tracking the source in the current subscriber. The
    /// type must implement [`Copy`]; otherwise use [`Source::get_clone`] or
    /// [`Source::with`].
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get(self) -> T
    where
        T: Copy,
    {
        self.track();
        self.get_untracked()
    }

    /// Gets the value, tracking the source in the current subscriber and
    /// cloning the value.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn get_clone(self) -> T
    where
        T: Clone,
    {
        self.track();
        self.get_clone_untracked()
    }

    /// Reads the value without creating a dependency edge.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn peek(self) -> T
    where
        T: Copy,
    {
        self.get_untracked()
    }

    /// Sets a new value, waking dependents if it differs from the current
    /// one under NaN-aware equality.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set(self, new: T) {
        let (changed, sub_head) = {
            let mut nodes = self.root.nodes.borrow_mut();
            let node = match nodes.get_mut(self.id) {
                Some(node) => node,
                None => panic!("{}", self.disposed_message()),
            };
            let sub_head = node.sub_head;
            let NodeKind::Source {
                value, old_value, eq, ..
            } = &mut node.kind
            else {
                unreachable!("node is not a source");
            };
            let current = value.as_deref().expect("source value taken during update");
            if eq(current, &new) {
                (false, None)
            } else {
                let previous = value.replace(Box::new(new));
                if old_value.is_none() {
                    *old_value = previous;
                }
                node.flags.insert(NodeFlags::DIRTY);
                (true, sub_head)
            }
        };
        if changed {
            if let Some(head) = sub_head {
                self.root.propagate(head);
            }
            self.root.maybe_flush();
        }
    }

    /// Sets a new value without waking dependents.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn set_silent(self, new: T) {
        let _ = self.replace_silent(new);
    }

    /// Sets a new value and returns the previous one, waking dependents on
    /// change.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn replace(self, new: T) -> T {
        let (previous, changed, sub_head) = {
            let mut nodes = self.root.nodes.borrow_mut();
            let node = match nodes.get_mut(self.id) {
                Some(node) => node,
                None => panic!("{}", self.disposed_message()),
            };
            let sub_head = node.sub_head;
            let NodeKind::Source { value, eq, .. } = &mut node.kind else {
                unreachable!("node is not a source");
            };
            let current = value.as_deref().expect("source value taken during update");
            let changed = !eq(current, &new);
            let previous = value
                .replace(Box::new(new))
                .expect("source value taken during update");
            let Ok(previous) = previous.downcast::<T>() else {
                unreachable!("source type mismatch");
            };
            let previous = *previous;
            if changed {
                node.flags.insert(NodeFlags::DIRTY);
            }
            (previous, changed, sub_head)
        };
        if changed {
            if let Some(head) = sub_head {
                self.root.propagate(head);
            }
            self.root.maybe_flush();
        }
        previous
    }

    /// Sets a new value and returns the previous one without waking
    /// dependents.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn replace_silent(self, new: T) -> T {
        let mut nodes = self.root.nodes.borrow_mut();
        let node = match nodes.get_mut(self.id) {
            Some(node) => node,
            None => panic!("{}", self.disposed_message()),
        };
        let NodeKind::Source { value, .. } = &mut node.kind else {
            unreachable!("node is not a source");
        };
        let previous = value
            .replace(Box::new(new))
            .expect("source value taken during update");
        let Ok(previous) = previous.downcast::<T>() else {
            unreachable!("source type mismatch");
        };
        *previous
    }

    /// Replaces the value with `T::default()`, returning it and waking
    /// dependents on change.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn take(self) -> T
    where
        T: Default,
    {
        self.replace(T::default())
    }

    /// Replaces the value with `T::default()` without waking dependents.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn take_silent(self) -> T
    where
        T: Default,
    {
        self.replace_silent(T::default())
    }

    /// Reads the current value without tracking, computes a new one and
    /// writes it back through the equality gate.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn update(self, f: impl FnOnce(&T) -> T) {
        let new = {
            let taken = {
                let mut nodes = self.root.nodes.borrow_mut();
                let node = match nodes.get_mut(self.id) {
                    Some(node) => node,
                    None => panic!("{}", self.disposed_message()),
                };
                let NodeKind::Source { value, .. } = &mut node.kind else {
                    unreachable!("node is not a source");
                };
                value.take().expect("source value taken during update")
            };
            let new = f(taken.downcast_ref().expect("source type mismatch"));
            let mut nodes = self.root.nodes.borrow_mut();
            if let Some(node) = nodes.get_mut(self.id) {
                if let NodeKind::Source { value, .. } = &mut node.kind {
                    *value = Some(taken);
                }
            }
            new
        };
        self.set(new);
    }

    /// Creates a [`Derived`] computed from this source.
    pub fn map<U: PartialEq + 'static>(
        self,
        mut f: impl FnMut(&T) -> U + 'static,
    ) -> Derived<U> {
        create_derived(move || self.with(|value| f(value)))
    }
}

/// `Clone` + `Copy` are implemented manually so that `T` needs no bounds.
impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Source<T> {}

impl<T: Default + PartialEq> Default for Source<T> {
    fn default() -> Self {
        create_source(Default::default())
    }
}

// Forward `PartialEq`, `Eq`, `PartialOrd`, `Ord`, `Hash` from the inner type.
impl<T: PartialEq> PartialEq for Source<T> {
    fn eq(&self, other: &Self) -> bool {
        self.with(|value| other.with(|other| value == other))
    }
}
impl<T: Eq> Eq for Source<T> {}
impl<T: PartialOrd> PartialOrd for Source<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.with(|value| other.with(|other| value.partial_cmp(other)))
    }
}
impl<T: Ord> Ord for Source<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.with(|value| other.with(|other| value.cmp(other)))
    }
}
impl<T: Hash> Hash for Source<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.with(|value| value.hash(state))
    }
}

impl<T: fmt::Debug> fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Display> fmt::Display for Source<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

#[cfg(feature = "serde")]
impl<T: serde::Serialize> serde::Serialize for Source<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.with(|value| value.serialize(serializer))
    }
}
#[cfg(feature = "serde")]
impl<'de, T: serde::Deserialize<'de> + PartialEq> serde::Deserialize<'de> for Source<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(create_source(T::deserialize(deserializer)?))
    }
}
