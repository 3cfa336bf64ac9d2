//! [`Root`] and scopes.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use slotmap::Key;

use crate::graph::{Links, Nodes};
use crate::keyed::{Key as TrackKey, TargetId};
use crate::node::{NodeFlags, NodeHandle, NodeId, NodeKind};
use crate::scheduler::{Job, JobKey};
use crate::utils::debug_warn;

/// The struct managing the state of the reactive system: the node and link
/// arenas, the tracker, and the scheduler queues. One per running app.
///
/// A `Root` is leaked to obtain a `&'static Root`, but it is also
/// `dispose`-able: disposing releases every node and link allocated in it,
/// so nothing accumulates beyond the `Root` itself, which is expected to
/// live for the whole app.
pub(crate) struct Root {
    /// All nodes created in this root.
    pub nodes: RefCell<Nodes>,
    /// All live dependency edges.
    pub links: RefCell<Links>,
    /// The subscriber currently being evaluated, if any.
    pub current_sub: Cell<Option<NodeId>>,
    /// When set, reads do not create edges.
    pub untracked: Cell<bool>,
    /// Monotonic tracking-pass counter.
    pub generation: Cell<u64>,
    /// The scope that owns everything created right now. Null at top level.
    pub current_owner: Cell<NodeId>,
    /// The top-level scope of this root.
    pub root_scope: Cell<NodeId>,
    /// Nesting depth of `batch` scopes.
    pub batch_depth: Cell<u32>,
    /// Main job set, insertion-ordered and deduplicated by identity.
    pub jobs: RefCell<IndexMap<JobKey, Job>>,
    /// Pre-flush set, drained ahead of `jobs`.
    pub pre_flush: RefCell<IndexMap<JobKey, Job>>,
    /// Whether queued work awaits a flush point.
    pub flush_pending: Cell<bool>,
    /// Re-entrancy guard for `flush_jobs`.
    pub in_flush: Cell<bool>,
    /// Keyed-tracking table: target -> key -> subscribers.
    pub keyed: RefCell<HashMap<TargetId, HashMap<TrackKey, IndexSet<NodeId>>>>,
}

thread_local! {
    /// The current reactive root.
    static GLOBAL_ROOT: Cell<Option<&'static Root>> = const { Cell::new(None) };
}

impl Root {
    /// Gets the current reactive root. Panics if none is installed.
    #[cfg_attr(debug_assertions, track_caller)]
    pub fn global() -> &'static Root {
        GLOBAL_ROOT
            .with(|root| root.get())
            .expect("no reactive root found; use `create_root`")
    }

    /// Sets the current reactive root. Returns the previous one.
    pub fn set_global(root: Option<&'static Root>) -> Option<&'static Root> {
        GLOBAL_ROOT.with(|global| global.replace(root))
    }

    /// Creates a new leaked root that lives until the end of the program.
    pub fn new_static() -> &'static Self {
        let this = Self {
            nodes: RefCell::new(Nodes::default()),
            links: RefCell::new(Links::default()),
            current_sub: Cell::new(None),
            untracked: Cell::new(false),
            generation: Cell::new(0),
            current_owner: Cell::new(NodeId::null()),
            root_scope: Cell::new(NodeId::null()),
            batch_depth: Cell::new(0),
            jobs: RefCell::new(IndexMap::new()),
            pre_flush: RefCell::new(IndexMap::new()),
            flush_pending: Cell::new(false),
            in_flush: Cell::new(false),
            keyed: RefCell::new(HashMap::new()),
        };
        let leaked = Box::leak(Box::new(this));
        leaked.reinit();
        leaked
    }

    /// Disposes every resource held by this root and resets its state.
    pub fn reinit(&'static self) {
        let prev = Root::set_global(Some(self));
        let old_scope = self.root_scope.get();
        if !old_scope.is_null() {
            self.dispose_node(old_scope);
        }
        let _ = self.nodes.take();
        let _ = self.links.take();
        let _ = self.jobs.take();
        let _ = self.pre_flush.take();
        let _ = self.keyed.take();
        self.current_sub.set(None);
        self.untracked.set(false);
        self.generation.set(0);
        self.batch_depth.set(0);
        self.flush_pending.set(false);
        self.in_flush.set(false);
        self.current_owner.set(NodeId::null());
        let scope = self.create_node(NodeKind::Scope, NodeFlags::empty());
        self.root_scope.set(scope);
        self.current_owner.set(scope);
        Root::set_global(prev);
    }

    /// Creates a scope node and runs `f` with it as the owner.
    pub fn create_child_scope(&'static self, f: impl FnOnce()) -> NodeHandle {
        let scope = self.create_node(NodeKind::Scope, NodeFlags::empty());
        let prev = self.current_owner.replace(scope);
        f();
        self.current_owner.set(prev);
        NodeHandle(scope, self)
    }

    fn end_batch_in(&'static self) {
        let depth = self.batch_depth.get();
        if depth == 0 {
            debug_warn!("end_batch called without a matching start_batch");
            return;
        }
        self.batch_depth.set(depth - 1);
        if depth == 1 {
            self.flush_jobs();
        }
    }
}

/// A handle to a root, obtained from [`create_root`]. Lets you reinitialize
/// or dispose the root for resource cleanup.
#[derive(Clone, Copy)]
pub struct RootHandle {
    _ref: &'static Root,
}

impl RootHandle {
    /// Destroys everything created under this root.
    pub fn dispose(&self) {
        self._ref.reinit();
    }

    /// Runs `f` with this root installed as the current one.
    pub fn run_in<T>(&self, f: impl FnOnce() -> T) -> T {
        let prev = Root::set_global(Some(self._ref));
        let ret = f();
        Root::set_global(prev);
        ret
    }
}

/// Creates a new reactive root and runs `f` inside it. Every node created by
/// `f` (and later through the returned handle) lives in this root.
///
/// # Example
/// ```rust
/// # use alder_reactive::*;
/// create_root(|| {
///     let state = create_source(123);
///     assert_eq!(state.get(), 123);
/// });
/// ```
#[must_use = "root should be disposed"]
pub fn create_root(f: impl FnOnce()) -> RootHandle {
    let _ref = Root::new_static();
    {
        /// A raw pointer we promise never to touch, making it thread-safe.
        struct UnsafeSendPtr<T>(*const T);
        unsafe impl<T> Send for UnsafeSendPtr<T> {}

        /// Keeps holding the allocated `Root`s so leak checkers see them as
        /// reachable.
        static KEEP_ALIVE: std::sync::Mutex<Vec<UnsafeSendPtr<Root>>> =
            std::sync::Mutex::new(Vec::new());
        KEEP_ALIVE
            .lock()
            .unwrap()
            .push(UnsafeSendPtr(_ref as *const Root));
    }
    let prev = Root::set_global(Some(_ref));
    f();
    Root::set_global(prev);
    RootHandle { _ref }
}

/// Creates a child scope owning every node created inside `f`. The returned
/// [`NodeHandle`] disposes the scope and with it everything it owns.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_child_scope(f: impl FnOnce()) -> NodeHandle {
    Root::global().create_child_scope(f)
}

/// Registers a callback run (untracked) when the owning scope or node is
/// disposed or re-run.
///
/// # Example
/// ```rust
/// # use alder_reactive::*;
/// # let _ = create_root(|| {
/// let scope = create_child_scope(|| {
///     on_cleanup(|| println!("scope dropped"));
/// });
/// scope.dispose(); // Prints "scope dropped".
/// # });
/// ```
pub fn on_cleanup(f: impl FnOnce() + 'static) {
    let root = Root::global();
    let owner = root.current_owner.get();
    if !owner.is_null() {
        if let Some(node) = root.nodes.borrow_mut().get_mut(owner) {
            node.cleanups.push(Box::new(f));
        }
    }
}

/// Runs `f` with dependency tracking suppressed: reads inside `f` do not
/// create edges.
///
/// # Example
/// ```rust
/// # use alder_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_source(1);
/// let double = create_derived(move || untrack(|| state.get() * 2));
/// assert_eq!(double.get(), 2);
///
/// state.set(2);
/// // Still the old value: the read was untracked.
/// assert_eq!(double.get(), 2);
/// # });
/// ```
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    untrack_in(Root::global(), f)
}

/// Same as [`untrack`] but for a specific root.
pub(crate) fn untrack_in<T>(root: &Root, f: impl FnOnce() -> T) -> T {
    let prev_sub = root.current_sub.replace(None);
    let prev_untracked = root.untracked.replace(true);
    let ret = f();
    root.untracked.set(prev_untracked);
    root.current_sub.set(prev_sub);
    ret
}

/// Defers and deduplicates observer runs for the duration of `f`: however
/// many writes happen inside, each affected observer runs once, at the end
/// of the outermost batch, seeing the final state.
///
/// # Example
/// ```rust
/// # use alder_reactive::*;
/// # let _ = create_root(|| {
/// let a = create_source(1);
/// let b = create_source(2);
/// batch(|| {
///     a.set(10);
///     b.set(20);
/// });
/// # });
/// ```
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    let root = Root::global();
    root.batch_depth.set(root.batch_depth.get() + 1);
    let ret = f();
    root.end_batch_in();
    ret
}

/// Opens a batch scope. Pair with [`end_batch`].
pub fn start_batch() {
    let root = Root::global();
    root.batch_depth.set(root.batch_depth.get() + 1);
}

/// Closes a batch scope; the outermost close flushes the queued jobs.
/// Closing with no batch open is a debug warning and does nothing.
pub fn end_batch() {
    Root::global().end_batch_in();
}

/// Whether a batch scope is currently open.
pub fn is_batching() -> bool {
    Root::global().batch_depth.get() > 0
}

/// Current batch nesting depth.
pub fn batch_depth() -> u32 {
    Root::global().batch_depth.get()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn cleanup_runs_on_scope_dispose() {
        let _ = create_root(|| {
            let cleanup_called = create_source(false);
            let scope = create_child_scope(move || {
                on_cleanup(move || cleanup_called.set(true));
            });
            assert!(!cleanup_called.get());
            scope.dispose();
            assert!(cleanup_called.get());
        });
    }

    #[test]
    fn cleanup_in_observer_runs_before_each_rerun() {
        let _ = create_root(|| {
            let trigger = create_source(0);
            let counter = create_source(0);
            create_observer(move || {
                trigger.track();
                on_cleanup(move || counter.set(counter.get_untracked() + 1));
            });
            assert_eq!(counter.get(), 0);
            trigger.set(1);
            assert_eq!(counter.get(), 1);
            trigger.set(2);
            assert_eq!(counter.get(), 2);
        });
    }

    #[test]
    fn cleanup_is_untracked() {
        let _ = create_root(|| {
            let trigger = create_source(0);
            let counter = create_source(0);
            create_observer(move || {
                counter.set(counter.get_untracked() + 1);
                on_cleanup(move || {
                    trigger.track();
                });
            });
            assert_eq!(counter.get(), 1);
            trigger.set(1);
            assert_eq!(counter.get(), 1);
        });
    }

    #[test]
    fn untracked_reads_do_not_subscribe() {
        let _ = create_root(|| {
            let a = create_source(0);
            let runs = Rc::new(Cell::new(0));
            create_observer({
                let runs = Rc::clone(&runs);
                move || {
                    runs.set(runs.get() + 1);
                    let _ = untrack(|| a.get());
                }
            });
            assert_eq!(runs.get(), 1);
            a.set(1);
            assert_eq!(runs.get(), 1);
        });
    }

    #[test]
    fn batch_coalesces_writes_to_one_run() {
        let _ = create_root(|| {
            let x = create_source(0);
            let runs = Rc::new(Cell::new(0));
            let seen = Rc::new(Cell::new(0));
            create_observer({
                let runs = Rc::clone(&runs);
                let seen = Rc::clone(&seen);
                move || {
                    seen.set(x.get());
                    runs.set(runs.get() + 1);
                }
            });
            batch(|| {
                for i in 1..100 {
                    x.set(i);
                }
            });
            assert_eq!(runs.get(), 2);
            assert_eq!(seen.get(), 99);
        });
    }

    #[test]
    fn batch_over_two_sources_runs_each_observer_once() {
        let _ = create_root(|| {
            let a = create_source(1);
            let b = create_source(2);
            let runs = Rc::new(Cell::new(0));
            let seen = Rc::new(Cell::new((0, 0)));
            create_observer({
                let runs = Rc::clone(&runs);
                let seen = Rc::clone(&seen);
                move || {
                    seen.set((a.get(), b.get()));
                    runs.set(runs.get() + 1);
                }
            });
            batch(|| {
                a.set(10);
                b.set(20);
            });
            assert_eq!(runs.get(), 2);
            assert_eq!(seen.get(), (10, 20));
        });
    }

    #[test]
    fn nested_batches_flush_only_at_the_outermost_exit() {
        let _ = create_root(|| {
            let x = create_source(0);
            let runs = Rc::new(Cell::new(0));
            create_observer({
                let runs = Rc::clone(&runs);
                move || {
                    x.track();
                    runs.set(runs.get() + 1);
                }
            });
            batch(|| {
                x.set(1);
                batch(|| {
                    x.set(2);
                });
                // The inner batch closed but the outer is still open.
                assert_eq!(runs.get(), 1);
                assert!(is_batching());
            });
            assert_eq!(runs.get(), 2);
            assert!(!is_batching());
        });
    }

    #[test]
    fn unbalanced_end_batch_is_ignored() {
        let _ = create_root(|| {
            assert_eq!(batch_depth(), 0);
            end_batch();
            assert_eq!(batch_depth(), 0);
        });
    }

    #[test]
    fn disposing_a_root_stops_its_observers() {
        let runs = Rc::new(Cell::new(0));
        let mut source = None;
        let root = create_root(|| {
            let a = create_source(0);
            source = Some(a);
            create_observer({
                let runs = Rc::clone(&runs);
                move || {
                    a.track();
                    runs.set(runs.get() + 1);
                }
            });
        });
        assert_eq!(runs.get(), 1);
        root.dispose();
        assert!(!source.unwrap().is_alive());
    }
}
