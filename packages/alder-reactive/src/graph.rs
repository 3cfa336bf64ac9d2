//! The dependency link graph.
//!
//! Every edge is a [`Link`]: a versioned connection from a dependency node to
//! a subscriber node, threaded through two doubly-linked lists at once (the
//! dep's subscriber chain and the sub's dependency chain). Re-evaluating a
//! subscriber walks its dependency chain in access order, reusing edges in
//! O(1) in the common case and sweeping out whatever was not re-reached.

use slotmap::{new_key_type, SlotMap};

use crate::node::{DebugEvent, DebugEventKind, NodeFlags, NodeId, NodeKind, ReactiveNode};
use crate::root::Root;

new_key_type! {
    pub(crate) struct LinkId;
}

/// A versioned edge from a dependency node to a subscriber node.
pub(crate) struct Link {
    /// Generation of the subscriber's tracking pass that last confirmed this
    /// edge.
    pub version: u64,
    pub dep: NodeId,
    pub sub: NodeId,
    /// Sibling pointers in `dep`'s subscriber chain.
    pub prev_sub: Option<LinkId>,
    pub next_sub: Option<LinkId>,
    /// Sibling pointers in `sub`'s dependency chain.
    pub prev_dep: Option<LinkId>,
    pub next_dep: Option<LinkId>,
}

pub(crate) type Nodes = SlotMap<NodeId, ReactiveNode>;
pub(crate) type Links = SlotMap<LinkId, Link>;

/// Saved tracker state returned by `start_tracking` and consumed by
/// `end_tracking`.
#[derive(Clone, Copy)]
pub(crate) struct PrevTracking {
    sub: Option<NodeId>,
    untracked: bool,
}

impl Root {
    /// Begins a tracking pass for `sub`: bumps the generation, rewinds the
    /// dep cursor and clears the staleness flags. Returns the tracker state
    /// to restore afterwards.
    pub(crate) fn start_tracking(&self, sub: NodeId) -> PrevTracking {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        let keyed_entries = {
            let mut nodes = self.nodes.borrow_mut();
            match nodes.get_mut(sub) {
                Some(node) => {
                    node.generation = generation;
                    node.dep_tail = None;
                    node.flags
                        .remove(NodeFlags::RECURSED | NodeFlags::DIRTY | NodeFlags::PENDING);
                    node.flags.insert(NodeFlags::RECURSED_CHECK);
                    std::mem::take(&mut node.keyed_entries)
                }
                None => Vec::new(),
            }
        };
        // Keyed registrations describe the previous evaluation; the run
        // about to start re-records what it actually reads.
        if !keyed_entries.is_empty() {
            self.prune_keyed(sub, &keyed_entries);
        }
        PrevTracking {
            sub: self.current_sub.replace(Some(sub)),
            untracked: self.untracked.replace(false),
        }
    }

    /// Ends a tracking pass: restores the previous tracker state and unlinks
    /// every dep edge that was not re-reached in this pass.
    pub(crate) fn end_tracking(&self, sub: NodeId, prev: PrevTracking) {
        self.current_sub.set(prev.sub);
        self.untracked.set(prev.untracked);
        let mut nodes = self.nodes.borrow_mut();
        let mut links = self.links.borrow_mut();
        let Some(node) = nodes.get(sub) else { return };
        let mut cur = match node.dep_tail {
            Some(tail) => links[tail].next_dep,
            None => node.dep_head,
        };
        while let Some(link) = cur {
            cur = unlink_in(&mut nodes, &mut links, link, sub);
        }
        if let Some(node) = nodes.get_mut(sub) {
            node.flags.remove(NodeFlags::RECURSED_CHECK);
        }
    }

    /// Records `dep` as a dependency of `sub`, reusing an existing edge where
    /// possible. Every reuse check is O(1).
    pub(crate) fn link(&self, dep: NodeId, sub: NodeId) {
        if self.untracked.get() {
            return;
        }
        let mut nodes = self.nodes.borrow_mut();
        let mut links = self.links.borrow_mut();
        if nodes.get(dep).is_none() {
            return;
        }
        let Some(sub_node) = nodes.get(sub) else { return };
        if sub_node.flags.contains(NodeFlags::STOPPED) {
            return;
        }
        let generation = sub_node.generation;
        // The dependency that was accessed immediately before this one.
        if let Some(tail) = sub_node.dep_tail {
            if links[tail].dep == dep {
                return;
            }
        }
        // The edge just after the cursor, in chain order: the common case
        // when the same dependencies are re-read in the same order as in the
        // previous run.
        let candidate = match sub_node.dep_tail {
            Some(tail) => links[tail].next_dep,
            None => sub_node.dep_head,
        };
        if let Some(next) = candidate {
            if links[next].dep == dep {
                links[next].version = generation;
                nodes[sub].dep_tail = Some(next);
                return;
            }
        }
        // An edge already created earlier in this same pass, from a previous
        // read of the same dep.
        if let Some(tail) = nodes[dep].sub_tail {
            let link = &links[tail];
            if link.sub == sub && link.version == generation {
                return;
            }
        }
        // New edge: spliced immediately after the cursor in the dependency
        // chain and appended to the dep's subscriber chain.
        let prev_dep = nodes[sub].dep_tail;
        let prev_sub = nodes[dep].sub_tail;
        let id = links.insert(Link {
            version: generation,
            dep,
            sub,
            prev_sub,
            next_sub: None,
            prev_dep,
            next_dep: candidate,
        });
        match prev_dep {
            Some(prev) => links[prev].next_dep = Some(id),
            None => nodes[sub].dep_head = Some(id),
        }
        if let Some(next) = candidate {
            links[next].prev_dep = Some(id);
        }
        nodes[sub].dep_tail = Some(id);
        match prev_sub {
            Some(prev) => links[prev].next_sub = Some(id),
            None => nodes[dep].sub_head = Some(id),
        }
        nodes[dep].sub_tail = Some(id);
        if cfg!(debug_assertions) {
            let hook = nodes[sub].on_track.clone();
            drop(links);
            drop(nodes);
            if let Some(hook) = hook {
                hook(&DebugEvent {
                    node: sub,
                    target: None,
                    kind: DebugEventKind::Get,
                    key: None,
                });
            }
        }
    }
}

/// Removes `link` from both chains it belongs to, fixing up the four
/// neighbors and the endpoint head/tail pointers. A derived whose subscriber
/// chain becomes empty cascades: its own dep edges are released and it is
/// marked dirty so a future read recomputes. Returns the next link in `sub`'s
/// dependency chain, enabling iterator-style cleanup.
pub(crate) fn unlink_in(
    nodes: &mut Nodes,
    links: &mut Links,
    link: LinkId,
    sub: NodeId,
) -> Option<LinkId> {
    let Some(Link {
        dep,
        prev_sub,
        next_sub,
        prev_dep,
        next_dep,
        ..
    }) = links.remove(link)
    else {
        return None;
    };
    match prev_dep {
        Some(prev) => links[prev].next_dep = next_dep,
        None => {
            if let Some(node) = nodes.get_mut(sub) {
                node.dep_head = next_dep;
            }
        }
    }
    match next_dep {
        Some(next) => links[next].prev_dep = prev_dep,
        None => {
            if let Some(node) = nodes.get_mut(sub) {
                node.dep_tail = prev_dep;
            }
        }
    }
    match prev_sub {
        Some(prev) => links[prev].next_sub = next_sub,
        None => {
            if let Some(node) = nodes.get_mut(dep) {
                node.sub_head = next_sub;
            }
        }
    }
    match next_sub {
        Some(next) => links[next].prev_sub = prev_sub,
        None => {
            if let Some(node) = nodes.get_mut(dep) {
                node.sub_tail = prev_sub;
            }
        }
    }
    let cascade = match nodes.get_mut(dep) {
        Some(node)
            if node.sub_head.is_none() && matches!(node.kind, NodeKind::Derived { .. }) =>
        {
            node.flags.insert(NodeFlags::DIRTY);
            node.dep_tail = None;
            node.dep_head
        }
        _ => None,
    };
    let mut cur = cascade;
    while let Some(link) = cur {
        cur = unlink_in(nodes, links, link, dep);
    }
    next_dep
}

/// Whether `link` sits in the confirmed prefix of `sub`'s dependency chain,
/// walking backwards from the dep cursor. Guards against propagating across
/// an edge that has been replaced in the current tracking pass.
pub(crate) fn is_valid_link(nodes: &Nodes, links: &Links, link: LinkId, sub: NodeId) -> bool {
    let Some(node) = nodes.get(sub) else {
        return false;
    };
    let mut cur = node.dep_tail;
    while let Some(candidate) = cur {
        if candidate == link {
            return true;
        }
        cur = links[candidate].prev_dep;
    }
    false
}
