//! Job scheduling and flushing.
//!
//! The host has no microtask queue, so deferred work sits in two
//! insertion-ordered, identity-deduplicated sets (pre-flush callbacks and
//! main jobs) and drains at well-defined flush points: the end of the
//! outermost non-batched write or trigger, the close of the outermost
//! [`batch`](crate::batch), and [`next_tick`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use crate::node::{NodeFlags, NodeId};
use crate::root::Root;
use crate::utils::{debug_warn, panic_message};

/// Identity of a queued job: observers by node, callbacks by `Rc` pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum JobKey {
    Node(NodeId),
    Callback(usize),
}

pub(crate) enum Job {
    /// Re-evaluate an observer if it is still stale when the queue drains.
    Run(NodeId),
    /// An arbitrary user callback.
    Callback(Rc<dyn Fn()>),
}

impl JobKey {
    pub(crate) fn of_callback(callback: &Rc<dyn Fn()>) -> Self {
        Self::Callback(Rc::as_ptr(callback) as *const () as usize)
    }
}

impl Root {
    /// Adds a job to the main set. Duplicate keys collapse into one job.
    pub(crate) fn queue_job_in(&self, key: JobKey, job: Job) {
        self.jobs.borrow_mut().entry(key).or_insert(job);
        self.flush_pending.set(true);
    }

    /// Adds a job to the pre-flush set, drained ahead of the main set.
    pub(crate) fn queue_pre_flush_in(&self, key: JobKey, job: Job) {
        self.pre_flush.borrow_mut().entry(key).or_insert(job);
        self.flush_pending.set(true);
    }

    /// Queues an observer run, deduplicated through the `QUEUED` flag.
    pub(crate) fn queue_observer(&self, id: NodeId, pre: bool) {
        {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(id) else { return };
            if node.flags.contains(NodeFlags::QUEUED) {
                return;
            }
            node.flags.insert(NodeFlags::QUEUED);
        }
        if pre {
            self.queue_pre_flush_in(JobKey::Node(id), Job::Run(id));
        } else {
            self.queue_job_in(JobKey::Node(id), Job::Run(id));
        }
    }

    /// Drains both queues: pre-flush callbacks first, then the main set,
    /// repeatedly, so that jobs queued during the flush run in the same
    /// cycle. A panicking job is logged and skipped; the drain continues.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub(crate) fn flush_jobs(&'static self) {
        self.flush_pending.set(false);
        if self.in_flush.replace(true) {
            // Already draining higher up the stack; the active drain loop
            // will pick up whatever was queued.
            return;
        }
        loop {
            let pre: Vec<Job> = {
                let mut queue = self.pre_flush.borrow_mut();
                queue.drain(..).map(|(_, job)| job).collect()
            };
            for job in pre {
                self.run_job(job);
            }
            let jobs: Vec<Job> = {
                let mut queue = self.jobs.borrow_mut();
                queue.drain(..).map(|(_, job)| job).collect()
            };
            if jobs.is_empty() && self.pre_flush.borrow().is_empty() {
                break;
            }
            for job in jobs {
                self.run_job(job);
            }
        }
        self.in_flush.set(false);
    }

    /// Flushes if work is pending and no batch is open.
    pub(crate) fn maybe_flush(&'static self) {
        if self.batch_depth.get() == 0 && self.flush_pending.get() {
            self.flush_jobs();
        }
    }

    fn run_job(&'static self, job: Job) {
        match job {
            Job::Run(id) => {
                {
                    let mut nodes = self.nodes.borrow_mut();
                    let Some(node) = nodes.get_mut(id) else { return };
                    // Cleared exactly when the job begins executing.
                    node.flags.remove(NodeFlags::QUEUED);
                    if node.flags.contains(NodeFlags::STOPPED) {
                        return;
                    }
                }
                if let Err(payload) =
                    catch_unwind(AssertUnwindSafe(|| self.run_observer_if_stale(id)))
                {
                    debug_warn!("observer job panicked: {}", panic_message(payload.as_ref()));
                }
            }
            Job::Callback(callback) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback())) {
                    debug_warn!("queued job panicked: {}", panic_message(payload.as_ref()));
                }
            }
        }
    }
}

/// Queues a callback on the main job set. The same `Rc` queued twice before
/// a flush runs once.
pub fn queue_job(job: Rc<dyn Fn()>) {
    let root = Root::global();
    root.queue_job_in(JobKey::of_callback(&job), Job::Callback(job));
}

/// Queues a callback on the pre-flush set, which drains before the main job
/// set. The pre-flush and main sets are independent: the same `Rc` may sit
/// in both.
pub fn queue_pre_flush_callback(callback: Rc<dyn Fn()>) {
    let root = Root::global();
    root.queue_pre_flush_in(JobKey::of_callback(&callback), Job::Callback(callback));
}

/// Drains any pending work, then runs `f` and returns its result. The
/// stand-in for the host microtask boundary: everything scheduled before the
/// call is observable inside `f`.
pub fn next_tick<T>(f: impl FnOnce() -> T) -> T {
    let root = Root::global();
    root.flush_jobs();
    let ret = f();
    root.flush_jobs();
    ret
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn pre_flush_callbacks_run_before_jobs() {
        let _ = create_root(|| {
            let order = Rc::new(RefCell::new(Vec::new()));
            batch(|| {
                let order1 = Rc::clone(&order);
                queue_job(Rc::new(move || order1.borrow_mut().push("job")));
                let order2 = Rc::clone(&order);
                queue_pre_flush_callback(Rc::new(move || order2.borrow_mut().push("pre")));
            });
            assert_eq!(*order.borrow(), vec!["pre", "job"]);
        });
    }

    #[test]
    fn duplicate_jobs_collapse() {
        let _ = create_root(|| {
            let count = Rc::new(RefCell::new(0));
            let job: Rc<dyn Fn()> = {
                let count = Rc::clone(&count);
                Rc::new(move || *count.borrow_mut() += 1)
            };
            batch(|| {
                queue_job(Rc::clone(&job));
                queue_job(Rc::clone(&job));
                queue_job(Rc::clone(&job));
            });
            assert_eq!(*count.borrow(), 1);
        });
    }

    #[test]
    fn jobs_queued_during_flush_run_in_the_same_cycle() {
        let _ = create_root(|| {
            let log = Rc::new(RefCell::new(Vec::new()));
            batch(|| {
                let log1 = Rc::clone(&log);
                queue_job(Rc::new(move || {
                    log1.borrow_mut().push(1);
                    let log2 = Rc::clone(&log1);
                    queue_job(Rc::new(move || log2.borrow_mut().push(2)));
                }));
            });
            assert_eq!(*log.borrow(), vec![1, 2]);
        });
    }

    #[test]
    fn a_panicking_job_does_not_block_the_rest() {
        let _ = create_root(|| {
            let ran = Rc::new(RefCell::new(false));
            batch(|| {
                queue_job(Rc::new(|| panic!("boom")));
                let ran = Rc::clone(&ran);
                queue_job(Rc::new(move || *ran.borrow_mut() = true));
            });
            assert!(*ran.borrow());
        });
    }

    #[test]
    fn next_tick_drains_queued_work_first() {
        let _ = create_root(|| {
            let ran = Rc::new(RefCell::new(false));
            {
                let ran = Rc::clone(&ran);
                queue_job(Rc::new(move || *ran.borrow_mut() = true));
            }
            // Queuing alone is not a flush point.
            assert!(!*ran.borrow());
            assert!(next_tick(|| *ran.borrow()));
        });
    }
}
