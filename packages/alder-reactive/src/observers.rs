//! Observers (reactive side effects).

use std::rc::Rc;

use crate::graph::{unlink_in, PrevTracking};
use crate::node::{DebugEvent, NodeFlags, NodeId, NodeKind};
use crate::root::{untrack_in, Root};
use crate::utils::debug_warn;

/// When a notified observer actually runs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FlushTiming {
    /// Immediately at the notification point, even inside a batch.
    Sync,
    /// In the pre-flush drain, ahead of the main job set.
    Pre,
    /// In the main job set.
    Post,
}

/// How a notified observer is dispatched.
#[derive(Clone)]
pub(crate) enum ObserverScheduler {
    /// Queue on the main job set; the queue drains synchronously at the end
    /// of the outermost non-batched write.
    Default,
    Timing(FlushTiming),
    /// A user callback invoked with the observer instead of running it.
    Custom(Rc<dyn Fn(Observer)>),
}

/// Options for [`create_observer_with`].
#[derive(Default)]
pub struct ObserverOptions {
    /// When the observer runs after a notification. Ignored if `scheduler`
    /// is set.
    pub flush: Option<FlushTiming>,
    /// A callback invoked with the observer on notification, instead of
    /// running it. The callback decides when (or whether) to call
    /// [`Observer::run`].
    pub scheduler: Option<Rc<dyn Fn(Observer)>>,
    on_stop: Option<Box<dyn FnOnce()>>,
    on_track: Option<Rc<dyn Fn(&DebugEvent)>>,
    on_trigger: Option<Rc<dyn Fn(&DebugEvent)>>,
}

impl ObserverOptions {
    /// Options selecting a flush timing.
    pub fn with_flush(flush: FlushTiming) -> Self {
        Self {
            flush: Some(flush),
            ..Default::default()
        }
    }

    /// Options routing notifications through a custom scheduler callback.
    pub fn with_scheduler(scheduler: impl Fn(Observer) + 'static) -> Self {
        Self {
            scheduler: Some(Rc::new(scheduler)),
            ..Default::default()
        }
    }

    /// Registers a callback run once when the observer stops.
    pub fn on_stop(mut self, f: impl FnOnce() + 'static) -> Self {
        self.on_stop = Some(Box::new(f));
        self
    }

    /// Installs a hook fired (in debug builds) when the observer records a
    /// dependency.
    pub fn on_track(mut self, hook: impl Fn(&DebugEvent) + 'static) -> Self {
        self.on_track = Some(Rc::new(hook));
        self
    }

    /// Installs a hook fired (in debug builds) when the observer is
    /// notified.
    pub fn on_trigger(mut self, hook: impl Fn(&DebugEvent) + 'static) -> Self {
        self.on_trigger = Some(Rc::new(hook));
        self
    }
}

/// A handle to a reactive side effect: the runner returned by observer
/// creation.
///
/// The effect function runs once at creation, recording every source and
/// derived it reads; any later change to those re-runs it. The handle
/// re-runs manually ([`Observer::run`]), pauses, resumes and stops the
/// effect.
///
/// # Example
/// ```rust
/// # use alder_reactive::*;
/// # let _ = create_root(|| {
/// let state = create_source(0);
/// create_observer(move || {
///     println!("state = {}", state.get());
/// });
/// // Printed "state = 0".
///
/// state.set(1); // Prints "state = 1".
/// # });
/// ```
#[derive(Clone, Copy)]
pub struct Observer {
    id: NodeId,
    root: &'static Root,
}

/// Creates an observer with default options and evaluates it once.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_observer(f: impl FnMut() + 'static) -> Observer {
    create_observer_with(f, ObserverOptions::default())
}

/// Creates an observer and evaluates it once, synchronously. A panic in the
/// initial evaluation stops the observer before unwinding further.
#[cfg_attr(debug_assertions, track_caller)]
pub fn create_observer_with(f: impl FnMut() + 'static, options: ObserverOptions) -> Observer {
    let root = Root::global();
    let scheduler = match (options.scheduler, options.flush) {
        (Some(scheduler), _) => ObserverScheduler::Custom(scheduler),
        (None, Some(timing)) => ObserverScheduler::Timing(timing),
        (None, None) => ObserverScheduler::Default,
    };
    let id = root.create_node(
        NodeKind::Observer {
            callback: Some(Box::new(f)),
            scheduler,
            on_stop: options.on_stop,
            active: true,
        },
        NodeFlags::WATCHING,
    );
    {
        let mut nodes = root.nodes.borrow_mut();
        let node = &mut nodes[id];
        node.on_track = options.on_track;
        node.on_trigger = options.on_trigger;
    }
    let observer = Observer { id, root };

    /// Stops the observer if the initial evaluation unwinds.
    struct StopOnUnwind(Observer);
    impl Drop for StopOnUnwind {
        fn drop(&mut self) {
            self.0.stop();
        }
    }
    let guard = StopOnUnwind(observer);
    observer.run_tracked();
    std::mem::forget(guard);
    observer
}

/// Stops an observer: releases its edges and prevents any future scheduling.
pub fn stop_observer(observer: Observer) {
    observer.stop();
}

/// Restores an observer's state if its effect function unwinds: the callback
/// goes back into the node, `DIRTY` is restored so the next notification
/// retries, and the tracking pass is closed.
struct RunGuard {
    root: &'static Root,
    id: NodeId,
    prev: PrevTracking,
    prev_owner: NodeId,
    callback: Option<Box<dyn FnMut()>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            self.root.current_owner.set(self.prev_owner);
            let mut nodes = self.root.nodes.borrow_mut();
            if let Some(node) = nodes.get_mut(self.id) {
                if let NodeKind::Observer { callback: slot, .. } = &mut node.kind {
                    *slot = Some(callback);
                }
                node.flags.insert(NodeFlags::DIRTY);
            }
            drop(nodes);
            self.root.end_tracking(self.id, self.prev);
        }
    }
}

impl Observer {
    pub(crate) fn id(self) -> NodeId {
        self.id
    }

    /// Whether the observer has not been stopped or disposed.
    pub fn is_active(self) -> bool {
        let nodes = self.root.nodes.borrow();
        matches!(
            nodes.get(self.id).map(|node| &node.kind),
            Some(NodeKind::Observer { active: true, .. })
        )
    }

    /// Re-runs the effect manually. After [`Observer::stop`], the function
    /// is invoked without tracking.
    pub fn run(self) {
        if self.is_active() {
            self.run_tracked();
        } else {
            let callback = {
                let mut nodes = self.root.nodes.borrow_mut();
                match nodes.get_mut(self.id).map(|node| &mut node.kind) {
                    Some(NodeKind::Observer { callback, .. }) => callback.take(),
                    _ => None,
                }
            };
            let Some(mut callback) = callback else { return };
            untrack_in(self.root, &mut callback);
            let mut nodes = self.root.nodes.borrow_mut();
            if let Some(NodeKind::Observer { callback: slot, .. }) =
                nodes.get_mut(self.id).map(|node| &mut node.kind)
            {
                *slot = Some(callback);
            }
        }
    }

    /// Runs the effect under tracking, sweeping edges that are not re-read.
    pub(crate) fn run_tracked(self) {
        let root = self.root;
        // The previous run's scopes and cleanups go first.
        root.dispose_children(self.id);
        let prev = root.start_tracking(self.id);
        let callback = {
            let mut nodes = root.nodes.borrow_mut();
            match nodes.get_mut(self.id).map(|node| &mut node.kind) {
                Some(NodeKind::Observer { callback, .. }) => callback.take(),
                _ => None,
            }
        };
        let Some(callback) = callback else {
            root.end_tracking(self.id, prev);
            return;
        };
        let prev_owner = root.current_owner.replace(self.id);
        let mut guard = RunGuard {
            root,
            id: self.id,
            prev,
            prev_owner,
            callback: Some(callback),
        };
        (guard.callback.as_mut().expect("observer callback taken"))();
        let callback = guard.callback.take().expect("observer callback taken");
        std::mem::forget(guard);
        root.current_owner.set(prev_owner);
        {
            let mut nodes = root.nodes.borrow_mut();
            if let Some(NodeKind::Observer { callback: slot, .. }) =
                nodes.get_mut(self.id).map(|node| &mut node.kind)
            {
                *slot = Some(callback);
            }
        }
        root.end_tracking(self.id, prev);
        // A re-entrant write during the run may have re-dirtied this
        // observer; its queue slot (if any) was already consumed, so
        // dispatch again.
        let flags = {
            let nodes = root.nodes.borrow();
            nodes.get(self.id).map(|node| node.flags)
        };
        if let Some(flags) = flags {
            if flags.intersects(NodeFlags::DIRTY | NodeFlags::PENDING)
                && !flags.contains(NodeFlags::STOPPED)
            {
                root.dispatch_observer(self.id);
                root.maybe_flush();
            }
        }
    }

    /// Suspends scheduling. Notifications accumulate while paused.
    pub fn pause(self) {
        if let Some(node) = self.root.nodes.borrow_mut().get_mut(self.id) {
            node.flags.insert(NodeFlags::PAUSED);
        }
    }

    /// Resumes scheduling; anything accumulated while paused is dispatched
    /// immediately.
    pub fn resume(self) {
        let stale = {
            let mut nodes = self.root.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(self.id) else { return };
            node.flags.remove(NodeFlags::PAUSED);
            node.flags
                .intersects(NodeFlags::DIRTY | NodeFlags::PENDING)
        };
        if stale {
            self.root.dispatch_observer(self.id);
            self.root.maybe_flush();
        }
    }

    /// Stops the observer: every dep and sub edge is released, children are
    /// disposed, `on_stop` runs, and no future notification schedules it.
    /// Idempotent; a second call is a debug warning.
    pub fn stop(self) {
        {
            let nodes = self.root.nodes.borrow();
            match nodes.get(self.id).map(|node| &node.kind) {
                Some(NodeKind::Observer { active: true, .. }) => {}
                Some(_) => {
                    debug_warn!("observer is already stopped");
                    return;
                }
                None => return,
            }
        }
        self.root.dispose_children(self.id);
        let (keyed_entries, on_stop) = {
            let mut nodes = self.root.nodes.borrow_mut();
            let mut links = self.root.links.borrow_mut();
            let Some(node) = nodes.get_mut(self.id) else { return };
            node.flags.insert(NodeFlags::STOPPED);
            node.dep_tail = None;
            node.sub_tail = None;
            let dep_head = node.dep_head.take();
            let sub_head = node.sub_head.take();
            let mut cur = dep_head;
            while let Some(link) = cur {
                cur = unlink_in(&mut nodes, &mut links, link, self.id);
            }
            let mut cur = sub_head;
            while let Some(link) = cur {
                let (sub, next) = (links[link].sub, links[link].next_sub);
                unlink_in(&mut nodes, &mut links, link, sub);
                cur = next;
            }
            let node = &mut nodes[self.id];
            let NodeKind::Observer {
                active, on_stop, ..
            } = &mut node.kind
            else {
                unreachable!("node is not an observer");
            };
            *active = false;
            (std::mem::take(&mut node.keyed_entries), on_stop.take())
        };
        self.root.prune_keyed(self.id, &keyed_entries);
        if let Some(on_stop) = on_stop {
            on_stop();
        }
    }
}

impl Root {
    /// Delivers a direct notification to an observer: marks it dirty and,
    /// unless it is stopped, paused or already dirty, dispatches it.
    pub(crate) fn notify_observer(&'static self, id: NodeId, event: Option<&DebugEvent>) {
        let (flags, hook) = {
            let nodes = self.nodes.borrow();
            let Some(node) = nodes.get(id) else { return };
            (node.flags, node.on_trigger.clone())
        };
        if flags.contains(NodeFlags::STOPPED) || flags.contains(NodeFlags::DIRTY) {
            return;
        }
        if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
            node.flags.insert(NodeFlags::DIRTY);
        }
        if cfg!(debug_assertions) {
            if let (Some(hook), Some(event)) = (hook, event) {
                hook(event);
            }
        }
        if flags.contains(NodeFlags::PAUSED) {
            // Accumulates; `resume` dispatches.
            return;
        }
        self.dispatch_observer(id);
    }

    /// Routes a stale observer to its scheduler: custom callback, immediate
    /// run, or one of the two queues.
    pub(crate) fn dispatch_observer(&'static self, id: NodeId) {
        let (flags, scheduler) = {
            let nodes = self.nodes.borrow();
            let Some(node) = nodes.get(id) else { return };
            let NodeKind::Observer { scheduler, .. } = &node.kind else {
                return;
            };
            (node.flags, scheduler.clone())
        };
        if flags.contains(NodeFlags::STOPPED) || flags.contains(NodeFlags::PAUSED) {
            return;
        }
        match scheduler {
            ObserverScheduler::Custom(scheduler) => scheduler(Observer { id, root: self }),
            ObserverScheduler::Timing(FlushTiming::Sync) => self.run_observer_if_stale(id),
            ObserverScheduler::Timing(FlushTiming::Pre) => self.queue_observer(id, true),
            ObserverScheduler::Timing(FlushTiming::Post) | ObserverScheduler::Default => {
                self.queue_observer(id, false)
            }
        }
    }

    /// Runs an observer if it is actually stale: dirty runs directly, pending
    /// runs after a dirty check confirms, anything else is left alone.
    pub(crate) fn run_observer_if_stale(&'static self, id: NodeId) {
        let (flags, dep_head) = {
            let nodes = self.nodes.borrow();
            let Some(node) = nodes.get(id) else { return };
            (node.flags, node.dep_head)
        };
        if flags.contains(NodeFlags::STOPPED) {
            return;
        }
        if flags.contains(NodeFlags::RECURSED_CHECK) {
            // Already running higher up the stack; it re-dispatches itself
            // when that run completes.
            return;
        }
        if flags.contains(NodeFlags::DIRTY) {
            Observer { id, root: self }.run_tracked();
        } else if flags.contains(NodeFlags::PENDING) {
            let dirty = match dep_head {
                Some(head) => self.check_dirty(head, id),
                None => {
                    if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
                        node.flags.remove(NodeFlags::PENDING);
                    }
                    false
                }
            };
            if dirty {
                Observer { id, root: self }.run_tracked();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn observer_runs_once_at_creation() {
        let _ = create_root(|| {
            let state = create_source(0);
            let double = create_source(-1);
            create_observer(move || {
                double.set(state.get() * 2);
            });
            assert_eq!(double.get(), 0);

            state.set(1);
            assert_eq!(double.get(), 2);
            state.set(2);
            assert_eq!(double.get(), 4);
        });
    }

    #[test]
    fn branch_switching_replaces_the_dependency_set() {
        let _ = create_root(|| {
            let cond = create_source(true);
            let a = create_source(0);
            let b = create_source(0);
            let log = Rc::new(RefCell::new(Vec::new()));
            create_observer({
                let log = Rc::clone(&log);
                move || {
                    let value = if cond.get() { a.get() } else { b.get() };
                    log.borrow_mut().push(value);
                }
            });
            assert_eq!(log.borrow().len(), 1);
            a.set(1);
            assert_eq!(log.borrow().len(), 2);
            b.set(1);
            assert_eq!(log.borrow().len(), 2); // b is not a dependency yet
            cond.set(false);
            assert_eq!(log.borrow().len(), 3);
            a.set(2);
            assert_eq!(log.borrow().len(), 3); // a no longer is
            b.set(2);
            assert_eq!(log.borrow().len(), 4);
        });
    }

    #[test]
    fn mutual_observer_writes_terminate() {
        let _ = create_root(|| {
            let a = create_source(0);
            let b = create_source(0);
            let runs = Rc::new(Cell::new(0));
            create_observer({
                let runs = Rc::clone(&runs);
                move || {
                    runs.set(runs.get() + 1);
                    let value = a.get();
                    if value < 3 {
                        b.set(value + 1);
                    }
                }
            });
            create_observer({
                let runs = Rc::clone(&runs);
                move || {
                    runs.set(runs.get() + 1);
                    let value = b.get();
                    if value < 3 {
                        a.set(value + 1);
                    }
                }
            });
            a.set(1);
            assert_eq!(a.get_untracked(), 3);
            assert!(runs.get() < 16, "mutual writes must settle quickly");
        });
    }

    #[test]
    fn stop_is_idempotent_and_releases_edges() {
        let _ = create_root(|| {
            let state = create_source(0);
            let runs = Rc::new(Cell::new(0));
            let stopped = Rc::new(Cell::new(0));
            let observer = create_observer_with(
                {
                    let runs = Rc::clone(&runs);
                    move || {
                        state.track();
                        runs.set(runs.get() + 1);
                    }
                },
                ObserverOptions::default().on_stop({
                    let stopped = Rc::clone(&stopped);
                    move || stopped.set(stopped.get() + 1)
                }),
            );
            assert_eq!(runs.get(), 1);
            observer.stop();
            assert_eq!(stopped.get(), 1);
            {
                let root = crate::root::Root::global();
                let nodes = root.nodes.borrow();
                let node = &nodes[observer.id()];
                assert!(node.dep_head.is_none() && node.dep_tail.is_none());
                assert!(node.sub_head.is_none() && node.sub_tail.is_none());
            }
            state.set(1);
            assert_eq!(runs.get(), 1);
            observer.stop();
            assert_eq!(stopped.get(), 1);
        });
    }

    #[test]
    fn manual_run_after_stop_is_untracked() {
        let _ = create_root(|| {
            let state = create_source(0);
            let runs = Rc::new(Cell::new(0));
            let observer = create_observer({
                let runs = Rc::clone(&runs);
                move || {
                    state.track();
                    runs.set(runs.get() + 1);
                }
            });
            observer.stop();
            observer.run();
            assert_eq!(runs.get(), 2);
            // The manual run did not resubscribe.
            state.set(1);
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn paused_observers_accumulate_and_resume() {
        let _ = create_root(|| {
            let state = create_source(0);
            let runs = Rc::new(Cell::new(0));
            let observer = create_observer({
                let runs = Rc::clone(&runs);
                move || {
                    state.track();
                    runs.set(runs.get() + 1);
                }
            });
            observer.pause();
            state.set(1);
            state.set(2);
            assert_eq!(runs.get(), 1);
            observer.resume();
            assert_eq!(runs.get(), 2);
            // Resuming with nothing accumulated does not run.
            observer.pause();
            observer.resume();
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn panicking_initial_run_stops_the_observer() {
        let _ = create_root(|| {
            let stopped = Rc::new(Cell::new(false));
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                create_observer_with(
                    || panic!("initial run failed"),
                    ObserverOptions::default().on_stop({
                        let stopped = Rc::clone(&stopped);
                        move || stopped.set(true)
                    }),
                );
            }));
            assert!(result.is_err());
            assert!(stopped.get());
        });
    }

    #[test]
    fn panicking_rerun_restores_dirty_and_retries() {
        let _ = create_root(|| {
            let state = create_source(0);
            let fail = Rc::new(Cell::new(false));
            let runs = Rc::new(Cell::new(0));
            let observer = create_observer({
                let fail = Rc::clone(&fail);
                let runs = Rc::clone(&runs);
                move || {
                    state.track();
                    runs.set(runs.get() + 1);
                    if fail.get() {
                        panic!("rerun failed");
                    }
                }
            });
            fail.set(true);
            // The queued job isolates the panic; the observer stays dirty.
            state.set(1);
            assert_eq!(runs.get(), 2);
            fail.set(false);
            observer.run();
            assert_eq!(runs.get(), 3);
        });
    }

    #[test]
    fn custom_scheduler_controls_the_rerun() {
        let _ = create_root(|| {
            let state = create_source(0);
            let scheduled = Rc::new(RefCell::new(Vec::new()));
            let runs = Rc::new(Cell::new(0));
            create_observer_with(
                {
                    let runs = Rc::clone(&runs);
                    move || {
                        state.track();
                        runs.set(runs.get() + 1);
                    }
                },
                ObserverOptions::with_scheduler({
                    let scheduled = Rc::clone(&scheduled);
                    move |observer| scheduled.borrow_mut().push(observer)
                }),
            );
            assert_eq!(runs.get(), 1);
            state.set(1);
            // The scheduler was called instead of running the effect.
            assert_eq!(runs.get(), 1);
            assert_eq!(scheduled.borrow().len(), 1);
            let observer = scheduled.borrow_mut().pop().unwrap();
            observer.run();
            assert_eq!(runs.get(), 2);
        });
    }

    #[test]
    fn pre_observers_run_before_post_observers() {
        let _ = create_root(|| {
            let state = create_source(0);
            let order = Rc::new(RefCell::new(Vec::new()));
            create_observer_with(
                {
                    let order = Rc::clone(&order);
                    move || {
                        state.track();
                        order.borrow_mut().push("post");
                    }
                },
                ObserverOptions::with_flush(FlushTiming::Post),
            );
            create_observer_with(
                {
                    let order = Rc::clone(&order);
                    move || {
                        state.track();
                        order.borrow_mut().push("pre");
                    }
                },
                ObserverOptions::with_flush(FlushTiming::Pre),
            );
            order.borrow_mut().clear();
            state.set(1);
            assert_eq!(*order.borrow(), vec!["pre", "post"]);
        });
    }

    #[test]
    fn sync_observers_run_inside_a_batch() {
        let _ = create_root(|| {
            let state = create_source(0);
            let seen = Rc::new(Cell::new(0));
            create_observer_with(
                {
                    let seen = Rc::clone(&seen);
                    move || seen.set(state.get())
                },
                ObserverOptions::with_flush(FlushTiming::Sync),
            );
            batch(|| {
                state.set(1);
                assert_eq!(seen.get(), 1);
                state.set(2);
                assert_eq!(seen.get(), 2);
            });
        });
    }

    #[test]
    fn nested_observers_are_recreated_with_their_parent() {
        let _ = create_root(|| {
            let trigger = create_source(0);
            let outer_runs = Rc::new(Cell::new(0));
            let inner_runs = Rc::new(Cell::new(0));
            create_observer({
                let outer_runs = Rc::clone(&outer_runs);
                let inner_runs = Rc::clone(&inner_runs);
                move || {
                    trigger.track();
                    outer_runs.set(outer_runs.get() + 1);
                    let inner_runs = Rc::clone(&inner_runs);
                    create_observer(move || {
                        trigger.track();
                        inner_runs.set(inner_runs.get() + 1);
                    });
                }
            });
            assert_eq!(outer_runs.get(), 1);
            assert_eq!(inner_runs.get(), 1);
            trigger.set(1);
            // The old inner observer was disposed with the outer rerun; the
            // new one ran once.
            assert_eq!(outer_runs.get(), 2);
            assert_eq!(inner_runs.get(), 2);
        });
    }
}
