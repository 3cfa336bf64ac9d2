//! Reactive nodes.

use std::any::Any;
use std::rc::Rc;

use bitflags::bitflags;
use slotmap::{new_key_type, Key};

use crate::graph::{unlink_in, LinkId};
use crate::keyed::{Key as TrackKey, TargetId};
use crate::observers::ObserverScheduler;
use crate::root::{untrack_in, Root};

new_key_type! {
    /// Identifier of a node in the reactive graph.
    pub struct NodeId;
}

bitflags! {
    /// Bitset state carried by every node.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub(crate) struct NodeFlags: u16 {
        /// The node holds a value that can change (source, derived).
        const MUTABLE = 1 << 0;
        /// The node is an observer and must be scheduled on dirtying.
        const WATCHING = 1 << 1;
        /// The value or side effect is known stale.
        const DIRTY = 1 << 2;
        /// Possibly stale; a dependency chain check is required first.
        const PENDING = 1 << 3;
        /// Already a member of the scheduler's job set.
        const QUEUED = 1 << 4;
        /// Currently evaluating, between `start_tracking`/`end_tracking`.
        const RECURSED_CHECK = 1 << 5;
        /// Reached again during propagation via a subscriber-graph cycle.
        const RECURSED = 1 << 6;
        /// Observer only: notifications accumulate but do not schedule.
        const PAUSED = 1 << 7;
        /// Observer only: terminal.
        const STOPPED = 1 << 8;
    }
}

/// Type-erased recomputation callback of a derived: given the cache slot,
/// produces the next value and reports whether it differs from the cached one.
pub(crate) type ComputeFn = Box<dyn FnMut(&mut Option<Box<dyn Any>>) -> bool>;

/// Type-erased setter of a writable derived.
pub(crate) type AssignFn = Box<dyn FnMut(Box<dyn Any>)>;

/// Type-erased NaN-aware equality between two values of the same type.
pub(crate) type ErasedEq = fn(&dyn Any, &dyn Any) -> bool;

/// Variant payload of a node. Propagation dispatches on [`NodeFlags`], not on
/// the variant; the variant only carries kind-specific state.
pub(crate) enum NodeKind {
    /// A plain owner node created by `create_child_scope`.
    Scope,
    /// Holds a value written from outside the graph.
    Source {
        value: Option<Box<dyn Any>>,
        /// Last value seen by a read; created lazily on the first write of a
        /// dirty window and consumed by the next read.
        old_value: Option<Box<dyn Any>>,
        eq: ErasedEq,
        shallow: bool,
    },
    /// Caches a computation over other reactive reads.
    Derived {
        /// `None` until the lazy first evaluation.
        value: Option<Box<dyn Any>>,
        /// Taken out while the getter runs.
        compute: Option<ComputeFn>,
        assign: Option<AssignFn>,
    },
    /// Re-runs a side effect when its dependencies change.
    Observer {
        /// Taken out while the effect runs.
        callback: Option<Box<dyn FnMut()>>,
        scheduler: ObserverScheduler,
        on_stop: Option<Box<dyn FnOnce()>>,
        active: bool,
    },
}

/// The kind of operation reported to a debug hook.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DebugEventKind {
    /// A tracked read created a dependency edge.
    Get,
    /// A keyed or plain write.
    Set,
    /// A keyed insertion.
    Add,
    /// A keyed removal.
    Delete,
    /// A keyed collection clear.
    Clear,
    /// An iteration-key access.
    Iterate,
}

/// Payload passed to `on_track`/`on_trigger` debug hooks. Hooks only fire in
/// debug builds.
#[derive(Clone, Debug)]
pub struct DebugEvent {
    /// The subscriber node the hook is installed on.
    pub node: NodeId,
    /// The keyed-tracking target, when the event came through `track`/`trigger`.
    pub target: Option<TargetId>,
    /// What happened.
    pub kind: DebugEventKind,
    /// The key involved, for keyed events.
    pub key: Option<TrackKey>,
}

pub(crate) type DebugHook = Rc<dyn Fn(&DebugEvent)>;

pub(crate) struct ReactiveNode {
    pub flags: NodeFlags,
    pub kind: NodeKind,
    /// Generation of this node's current (or latest) tracking pass.
    pub generation: u64,
    pub dep_head: Option<LinkId>,
    pub dep_tail: Option<LinkId>,
    pub sub_head: Option<LinkId>,
    pub sub_tail: Option<LinkId>,
    /// The scope that owns this node, or the null key at the top level.
    pub parent: NodeId,
    pub children: Vec<NodeId>,
    pub cleanups: Vec<Box<dyn FnOnce()>>,
    /// Keyed-tracker entries this node appears in, for pruning on stop and
    /// disposal.
    pub keyed_entries: Vec<(TargetId, TrackKey)>,
    pub on_track: Option<DebugHook>,
    pub on_trigger: Option<DebugHook>,
    /// Where the node was created, for diagnostics.
    #[cfg(debug_assertions)]
    pub created_at: &'static std::panic::Location<'static>,
}

impl Root {
    /// Inserts a fresh node into the arena, parented to the current owner
    /// scope.
    #[cfg_attr(debug_assertions, track_caller)]
    pub(crate) fn create_node(&self, kind: NodeKind, flags: NodeFlags) -> NodeId {
        let parent = self.current_owner.get();
        let id = self.nodes.borrow_mut().insert(ReactiveNode {
            flags,
            kind,
            generation: 0,
            dep_head: None,
            dep_tail: None,
            sub_head: None,
            sub_tail: None,
            parent,
            children: Vec::new(),
            cleanups: Vec::new(),
            keyed_entries: Vec::new(),
            on_track: None,
            on_trigger: None,
            #[cfg(debug_assertions)]
            created_at: std::panic::Location::caller(),
        });
        if !parent.is_null() {
            if let Some(parent) = self.nodes.borrow_mut().get_mut(parent) {
                parent.children.push(id);
            }
        }
        id
    }

    /// Removes a node: children disposed, cleanups run, every dep and sub
    /// edge unlinked, keyed-tracker sets pruned, arena slot freed.
    pub(crate) fn dispose_node(&'static self, id: NodeId) {
        if self.nodes.borrow().get(id).is_none() {
            return;
        }
        self.dispose_children(id);
        {
            let mut nodes = self.nodes.borrow_mut();
            let mut links = self.links.borrow_mut();
            let (dep_head, sub_head) = match nodes.get_mut(id) {
                Some(node) => {
                    node.dep_tail = None;
                    (node.dep_head.take(), node.sub_head)
                }
                None => return,
            };
            let mut cur = dep_head;
            while let Some(link) = cur {
                cur = unlink_in(&mut nodes, &mut links, link, id);
            }
            // Edges where this node is the dependency: unlink each from the
            // subscriber's side.
            let mut cur = sub_head;
            while let Some(link) = cur {
                let (sub, next) = (links[link].sub, links[link].next_sub);
                unlink_in(&mut nodes, &mut links, link, sub);
                cur = next;
            }
        }
        let node = self.nodes.borrow_mut().remove(id);
        if let Some(node) = node {
            self.prune_keyed(id, &node.keyed_entries);
            if let NodeKind::Observer {
                on_stop: Some(on_stop),
                active: true,
                ..
            } = node.kind
            {
                on_stop();
            }
        }
    }

    /// Runs a node's cleanups (untracked) and disposes everything it owns,
    /// leaving the node itself alive.
    pub(crate) fn dispose_children(&'static self, id: NodeId) {
        let (cleanups, children) = {
            let mut nodes = self.nodes.borrow_mut();
            match nodes.get_mut(id) {
                Some(node) => (
                    std::mem::take(&mut node.cleanups),
                    std::mem::take(&mut node.children),
                ),
                None => return,
            }
        };
        untrack_in(self, || {
            for cleanup in cleanups {
                cleanup();
            }
        });
        for child in children {
            self.dispose_node(child);
        }
    }
}

/// A handle to a node, used to dispose it and everything it owns.
#[derive(Clone, Copy)]
pub struct NodeHandle(pub(crate) NodeId, pub(crate) &'static Root);

impl NodeHandle {
    /// Disposes the node, its children, and all of its graph edges.
    pub fn dispose(self) {
        self.1.dispose_node(self.0);
    }

    /// Disposes everything owned by the node but keeps the node alive.
    pub fn dispose_children(self) {
        self.1.dispose_children(self.0);
    }

    /// Returns `true` if the node has not been disposed.
    pub fn is_alive(self) -> bool {
        self.1.nodes.borrow().get(self.0).is_some()
    }
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn dispose_is_idempotent() {
        let _ = create_root(|| {
            let scope = create_child_scope(|| {});
            assert!(scope.is_alive());
            scope.dispose();
            assert!(!scope.is_alive());
            scope.dispose();
        });
    }

    #[test]
    fn disposing_a_scope_disposes_nodes_created_in_it() {
        let _ = create_root(|| {
            let mut inner = None;
            let scope = create_child_scope(|| {
                inner = Some(create_source(123));
            });
            let inner = inner.unwrap();
            assert!(inner.is_alive());
            scope.dispose();
            assert!(!inner.is_alive());
        });
    }

    #[test]
    fn disposing_a_source_detaches_its_subscribers() {
        let _ = create_root(|| {
            let mut state = None;
            let scope = create_child_scope(|| {
                state = Some(create_source(0));
            });
            let state = state.unwrap();
            let runs = create_source(0);
            create_observer(move || {
                if state.is_alive() {
                    state.track();
                }
                runs.set(runs.get_untracked() + 1);
            });
            assert_eq!(runs.get(), 1);
            scope.dispose();
            // The observer's edge to the disposed source is gone; nothing
            // left to trigger it.
            assert_eq!(runs.get(), 1);
        });
    }
}
