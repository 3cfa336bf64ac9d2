//! Change propagation over the subscriber graph.
//!
//! `propagate` marks the subscriber subgraph of a changed node as possibly
//! stale; `check_dirty` later resolves "possibly" into "definitely" (or
//! clean) by descending the dependency chains. Both walks use explicit heap
//! stacks: subscriber graphs are arbitrarily deep and user-built, so the
//! native call stack is never an option. No user code runs while a walk
//! holds the arenas borrowed; watching subscribers are collected and
//! dispatched afterwards.

use smallvec::SmallVec;

use crate::graph::{is_valid_link, LinkId, Links, Nodes};
use crate::node::{NodeFlags, NodeId};
use crate::root::Root;

/// Watching subscribers discovered by a graph walk, dispatched once the
/// arena borrows are released.
pub(crate) type Dispatch = SmallVec<[NodeId; 8]>;

impl Root {
    /// Marks every subscriber transitively reachable from `start` as pending
    /// and schedules the watching ones. Depth-first over the subscriber
    /// chains, with sibling resume points kept on an explicit stack.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub(crate) fn propagate(&'static self, start: LinkId) {
        let mut to_dispatch = Dispatch::new();
        {
            let mut nodes = self.nodes.borrow_mut();
            let links = self.links.borrow();
            let mut stack: Vec<LinkId> = Vec::new();
            let mut current = start;
            loop {
                let Some(link) = links.get(current) else {
                    break;
                };
                let sub_id = link.sub;
                let next_sub = link.next_sub;
                let mut reached = false;
                if let Some(flags) = nodes.get(sub_id).map(|node| node.flags) {
                    if !flags.intersects(
                        NodeFlags::DIRTY
                            | NodeFlags::PENDING
                            | NodeFlags::RECURSED
                            | NodeFlags::RECURSED_CHECK,
                    ) {
                        // First visit.
                        nodes[sub_id].flags.insert(NodeFlags::PENDING);
                        reached = true;
                    } else if flags.contains(NodeFlags::RECURSED)
                        && !flags.contains(NodeFlags::RECURSED_CHECK)
                    {
                        // Reached again through a cycle after its evaluation
                        // finished: treat as a fresh visit.
                        nodes[sub_id].flags.remove(NodeFlags::RECURSED);
                        nodes[sub_id].flags.insert(NodeFlags::PENDING);
                        reached = true;
                    } else if !flags.intersects(NodeFlags::DIRTY | NodeFlags::PENDING)
                        && flags.contains(NodeFlags::RECURSED_CHECK)
                        && is_valid_link(&nodes, &links, current, sub_id)
                    {
                        // The subscriber is mid-evaluation and the edge is in
                        // its confirmed prefix: a re-entrant write.
                        nodes[sub_id].flags.insert(NodeFlags::RECURSED | NodeFlags::PENDING);
                        reached = true;
                    }
                    // Everything else was already propagated to (or the edge
                    // is stale): stop downward here.
                }
                if reached {
                    let sub = &nodes[sub_id];
                    // Only a mutable subscriber (a derived) has subscribers
                    // of its own to descend into.
                    if sub.flags.contains(NodeFlags::MUTABLE) {
                        if let Some(inner) = sub.sub_head {
                            if let Some(next) = next_sub {
                                stack.push(next);
                            }
                            current = inner;
                            continue;
                        }
                    }
                    if sub.flags.contains(NodeFlags::WATCHING) {
                        to_dispatch.push(sub_id);
                    }
                }
                if let Some(next) = next_sub {
                    current = next;
                    continue;
                }
                match stack.pop() {
                    Some(resume) => current = resume,
                    None => break,
                }
            }
        }
        for id in to_dispatch {
            self.dispatch_observer(id);
        }
    }

    /// One-level promotion used after a value genuinely changed: direct
    /// subscribers that are pending-but-not-dirty become dirty, and watching
    /// ones that are not currently evaluating are scheduled. Mutable
    /// subscribers are deliberately not descended into; `propagate` or a
    /// later `check_dirty` covers them.
    pub(crate) fn shallow_propagate_in(
        nodes: &mut Nodes,
        links: &Links,
        start: LinkId,
        to_dispatch: &mut Dispatch,
    ) {
        let mut cur = Some(start);
        while let Some(id) = cur {
            let Some(link) = links.get(id) else {
                break;
            };
            cur = link.next_sub;
            let Some(sub) = nodes.get_mut(link.sub) else {
                continue;
            };
            if sub.flags.contains(NodeFlags::PENDING) && !sub.flags.contains(NodeFlags::DIRTY) {
                sub.flags.insert(NodeFlags::DIRTY);
                if sub.flags.contains(NodeFlags::WATCHING)
                    && !sub.flags.contains(NodeFlags::RECURSED_CHECK)
                {
                    to_dispatch.push(link.sub);
                }
            }
        }
    }

    /// Whether `sub` must recompute, resolving the pending chain that starts
    /// at `start`. Descends into pending mutable dependencies with an
    /// explicit stack; intermediate nodes along a confirmed-dirty path are
    /// promoted to dirty before returning, and nodes on paths confirmed
    /// clean have their pending bit cleared.
    pub(crate) fn check_dirty(&'static self, start: LinkId, sub: NodeId) -> bool {
        let mut to_dispatch = Dispatch::new();
        let dirty = {
            let mut nodes = self.nodes.borrow_mut();
            let links = self.links.borrow();
            let mut stack: SmallVec<[Option<LinkId>; 8]> = SmallVec::new();
            let mut pending_nodes: SmallVec<[NodeId; 8]> = SmallVec::new();
            let mut current = Some(start);
            let mut dirty = false;
            loop {
                if let Some(id) = current {
                    let Some(link) = links.get(id) else {
                        current = None;
                        continue;
                    };
                    let dep_id = link.dep;
                    let next_dep = link.next_dep;
                    let Some((flags, dep_head)) =
                        nodes.get(dep_id).map(|dep| (dep.flags, dep.dep_head))
                    else {
                        current = next_dep;
                        continue;
                    };
                    if flags.contains(NodeFlags::MUTABLE | NodeFlags::DIRTY) {
                        // A genuinely stale dependency: everything on the
                        // pending path must recompute. The first dirty path
                        // short-circuits the whole check.
                        for &node in &pending_nodes {
                            let node = &mut nodes[node];
                            node.flags.remove(NodeFlags::PENDING);
                            node.flags.insert(NodeFlags::DIRTY);
                        }
                        if let Some(head) = nodes[dep_id].sub_head {
                            Self::shallow_propagate_in(&mut nodes, &links, head, &mut to_dispatch);
                        }
                        dirty = true;
                        break;
                    } else if flags.contains(NodeFlags::MUTABLE | NodeFlags::PENDING)
                        && dep_head.is_some()
                    {
                        // Possibly stale itself: descend into its deps.
                        stack.push(next_dep);
                        pending_nodes.push(dep_id);
                        current = dep_head;
                    } else {
                        if flags.contains(NodeFlags::PENDING) {
                            nodes[dep_id].flags.remove(NodeFlags::PENDING);
                        }
                        current = next_dep;
                    }
                } else {
                    // Chain exhausted without dirt at this level.
                    match stack.pop() {
                        Some(resume) => {
                            // The descended dependency is confirmed clean.
                            if let Some(node) = pending_nodes.pop() {
                                if let Some(node) = nodes.get_mut(node) {
                                    node.flags.remove(NodeFlags::PENDING);
                                }
                            }
                            current = resume;
                        }
                        None => {
                            if let Some(node) = nodes.get_mut(sub) {
                                node.flags.remove(NodeFlags::PENDING);
                            }
                            break;
                        }
                    }
                }
            }
            dirty
        };
        // The checked subscriber's own fate is the caller's to decide;
        // re-dispatching it here would double-schedule it.
        for id in to_dispatch {
            if id != sub {
                self.dispatch_observer(id);
            }
        }
        dirty
    }
}
