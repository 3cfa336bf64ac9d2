//! Keyed tracking for external collaborators.
//!
//! The container-proxy layer (not part of this crate) reports per-property
//! reads with [`track`] and per-property writes with [`trigger`]. The table
//! maps a target identity and a key to the set of subscriber nodes that read
//! that `(target, key)` during their last evaluation; triggering delivers
//! notifications equivalent to a propagation from a source.

use std::borrow::Cow;

use indexmap::IndexSet;

use crate::node::{DebugEvent, DebugEventKind, NodeFlags, NodeId};
use crate::root::Root;

/// Opaque identity of a tracked container, derived from its address by the
/// proxy layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TargetId(usize);

impl TargetId {
    /// Identity of a value by address. The caller keeps the value alive for
    /// as long as it is tracked.
    pub fn of<T: ?Sized>(target: &T) -> Self {
        Self(target as *const T as *const () as usize)
    }

    /// Identity from a raw address.
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

/// A tracked key: a property, an index, or one of the reserved iteration
/// keys.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Key {
    /// A named property.
    Prop(Cow<'static, str>),
    /// An array index.
    Index(usize),
    /// Reserved key tracked by keyed iteration (`for key in map`).
    Iterate,
    /// Reserved key tracked by array iteration.
    ArrayIterate,
    /// Reserved key tracked by whole-collection reads (`len`, `contains`).
    Collection,
}

/// The write operation reported through [`trigger`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TriggerOp {
    /// An existing entry changed value.
    Set,
    /// A new entry appeared.
    Add,
    /// An entry was removed.
    Delete,
    /// The whole collection was cleared.
    Clear,
}

impl From<TriggerOp> for DebugEventKind {
    fn from(op: TriggerOp) -> Self {
        match op {
            TriggerOp::Set => DebugEventKind::Set,
            TriggerOp::Add => DebugEventKind::Add,
            TriggerOp::Delete => DebugEventKind::Delete,
            TriggerOp::Clear => DebugEventKind::Clear,
        }
    }
}

/// Records that the currently evaluating subscriber read `(target, key)`.
/// Outside an evaluation, or inside [`untrack`](crate::untrack), does
/// nothing.
pub fn track(target: TargetId, key: Key) {
    let root = Root::global();
    if root.untracked.get() {
        return;
    }
    let Some(sub) = root.current_sub.get() else {
        return;
    };
    let inserted = {
        let mut keyed = root.keyed.borrow_mut();
        keyed
            .entry(target)
            .or_default()
            .entry(key.clone())
            .or_default()
            .insert(sub)
    };
    if inserted {
        if let Some(node) = root.nodes.borrow_mut().get_mut(sub) {
            node.keyed_entries.push((target, key.clone()));
        }
    }
    if cfg!(debug_assertions) {
        let hook = root
            .nodes
            .borrow()
            .get(sub)
            .and_then(|node| node.on_track.clone());
        if let Some(hook) = hook {
            let kind = match key {
                Key::Iterate | Key::ArrayIterate | Key::Collection => DebugEventKind::Iterate,
                _ => DebugEventKind::Get,
            };
            hook(&DebugEvent {
                node: sub,
                target: Some(target),
                kind,
                key: Some(key),
            });
        }
    }
}

/// Notifies every subscriber recorded for `(target, key)` for each given
/// key. Iteration-affecting ops (`Add`, `Delete`, `Clear`) also notify the
/// reserved iteration-key subscribers. Array index writes pass several keys
/// at once (the index, the array-iterate key and the length key).
pub fn trigger(target: TargetId, op: TriggerOp, keys: &[Key]) {
    let root = Root::global();
    let subs: IndexSet<NodeId> = {
        let keyed = root.keyed.borrow();
        let mut subs = IndexSet::new();
        if let Some(map) = keyed.get(&target) {
            for key in keys {
                if let Some(set) = map.get(key) {
                    subs.extend(set.iter().copied());
                }
            }
            if matches!(op, TriggerOp::Add | TriggerOp::Delete | TriggerOp::Clear) {
                for key in [Key::Iterate, Key::ArrayIterate, Key::Collection] {
                    if let Some(set) = map.get(&key) {
                        subs.extend(set.iter().copied());
                    }
                }
            }
        }
        subs
    };
    for id in subs {
        let (flags, sub_head, hook) = {
            let nodes = root.nodes.borrow();
            let Some(node) = nodes.get(id) else { continue };
            (node.flags, node.sub_head, node.on_trigger.clone())
        };
        let event = DebugEvent {
            node: id,
            target: Some(target),
            kind: op.into(),
            key: keys.first().cloned(),
        };
        if flags.contains(NodeFlags::WATCHING) {
            root.notify_observer(id, Some(&event));
        } else if flags.contains(NodeFlags::MUTABLE) {
            if cfg!(debug_assertions) {
                if let Some(hook) = hook {
                    hook(&event);
                }
            }
            if let Some(node) = root.nodes.borrow_mut().get_mut(id) {
                node.flags.insert(NodeFlags::DIRTY);
            }
            if let Some(head) = sub_head {
                root.propagate(head);
            }
        }
    }
    root.maybe_flush();
}

impl Root {
    /// Removes a node from the keyed table entries it was recorded in.
    pub(crate) fn prune_keyed(&self, id: NodeId, entries: &[(TargetId, Key)]) {
        let mut keyed = self.keyed.borrow_mut();
        for (target, key) in entries {
            let Some(map) = keyed.get_mut(target) else {
                continue;
            };
            if let Some(set) = map.get_mut(key) {
                set.shift_remove(&id);
                if set.is_empty() {
                    map.remove(key);
                }
            }
            if map.is_empty() {
                keyed.remove(target);
            }
        }
    }
}
