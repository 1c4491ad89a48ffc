//! Thread-scoped active tracker.
//!
//! Passing a tracker into every place that allocates is impractical, so each
//! thread has one "active tracker" slot that the allocation hook reads. The
//! slot is filled from an explicit [`TaskContext`] that schedulers carry with a
//! unit of work and enter on whichever thread runs it; nothing installs a
//! tracker implicitly.
//!
//! The allocation hook cannot return an error to the code that allocated, so it
//! parks the first budget violation it sees in a second thread-local slot.
//! Engine code drains it with [`check_budget`] at safe points.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use memtrack_core::budget::BudgetExceeded;

use crate::tracker::Tracker;

thread_local! {
    static CURRENT: Cell<Option<Arc<Tracker>>> = const { Cell::new(None) };
    static PENDING: Cell<Option<BudgetExceeded>> = const { Cell::new(None) };
}

/// The tracker active on this thread, if any.
pub fn current() -> Option<Arc<Tracker>> {
    CURRENT
        .try_with(|slot| {
            let tracker = slot.take();
            let out = tracker.clone();
            slot.set(tracker);
            out
        })
        .ok()
        .flatten()
}

/// Install `tracker` as this thread's active tracker and return the previous one.
///
/// Prefer [`TaskContext::enter`], which restores the previous value for you.
pub fn set_current(tracker: Option<Arc<Tracker>>) -> Option<Arc<Tracker>> {
    CURRENT.try_with(|slot| slot.replace(tracker)).ok().flatten()
}

/// Whether allocations on this thread are currently being accounted.
pub fn is_tracking() -> bool {
    CURRENT
        .try_with(|slot| {
            let tracker = slot.take();
            let tracking = tracker.is_some();
            slot.set(tracker);
            tracking
        })
        .unwrap_or(false)
}

/// Remember a violation observed where it could not be returned. The first
/// one wins until it is drained.
pub(crate) fn park_exceeded(err: BudgetExceeded) {
    let _ = PENDING.try_with(|slot| {
        let parked = slot.take();
        slot.set(parked.or(Some(err)));
    });
}

/// Drain the violation parked by the allocation hook on this thread.
pub fn check_budget() -> Result<(), BudgetExceeded> {
    match PENDING.try_with(Cell::take).ok().flatten() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Drop a parked violation without reporting it, e.g. before reusing a worker
/// thread for an unrelated task.
pub fn clear_pending() {
    let _ = PENDING.try_with(Cell::take);
}

/// Explicit tracking context for one unit of work.
///
/// Cheap to clone; clones share the same tracker.
#[derive(Clone, Default)]
pub struct TaskContext {
    tracker: Option<Arc<Tracker>>,
}

impl TaskContext {
    pub fn new(tracker: Arc<Tracker>) -> Self {
        Self {
            tracker: Some(tracker),
        }
    }

    /// A context under which nothing is tracked.
    pub fn untracked() -> Self {
        Self { tracker: None }
    }

    /// Snapshot of whatever is active on the calling thread, for handing work
    /// to another thread.
    pub fn capture() -> Self {
        Self { tracker: current() }
    }

    pub fn tracker(&self) -> Option<&Arc<Tracker>> {
        self.tracker.as_ref()
    }

    /// Make this context active on the current thread until the guard drops.
    pub fn enter(&self) -> ContextGuard {
        ContextGuard {
            prev: set_current(self.tracker.clone()),
            _not_send: PhantomData,
        }
    }

    /// Run `f` with this context active.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter();
        f()
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("tracker", &self.tracker)
            .finish()
    }
}

/// Restores the previously active tracker on drop. Guards nest (LIFO) and must
/// be dropped on the thread that created them, hence `!Send`.
#[must_use = "the context is left as soon as the guard is dropped"]
pub struct ContextGuard {
    prev: Option<Arc<Tracker>>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        set_current(self.prev.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtrack_core::budget::ExceededKind;
    use std::thread;

    fn tracker() -> Arc<Tracker> {
        let mut t = Tracker::new();
        t.set_metric(None);
        t.set_log_peak_on_drop(false);
        Arc::new(t)
    }

    #[test]
    fn default_is_untracked() {
        thread::spawn(|| {
            assert!(current().is_none());
            assert!(!is_tracking());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn enter_and_restore_nested() {
        let outer = tracker();
        let inner = tracker();

        let g1 = TaskContext::new(Arc::clone(&outer)).enter();
        assert!(Arc::ptr_eq(&current().unwrap(), &outer));
        {
            let _g2 = TaskContext::new(Arc::clone(&inner)).enter();
            assert!(Arc::ptr_eq(&current().unwrap(), &inner));
            {
                let _g3 = TaskContext::untracked().enter();
                assert!(!is_tracking());
            }
            assert!(Arc::ptr_eq(&current().unwrap(), &inner));
        }
        assert!(Arc::ptr_eq(&current().unwrap(), &outer));
        drop(g1);
        assert!(current().is_none());
    }

    #[test]
    fn set_current_returns_previous() {
        let t = tracker();
        assert!(set_current(Some(Arc::clone(&t))).is_none());
        let prev = set_current(None).unwrap();
        assert!(Arc::ptr_eq(&prev, &t));
    }

    #[test]
    fn capture_hands_context_to_another_thread() {
        let t = tracker();
        let ctx = TaskContext::new(Arc::clone(&t)).scope(TaskContext::capture);

        thread::spawn(move || {
            ctx.scope(|| {
                current().unwrap().alloc(128).unwrap();
            });
            assert!(current().is_none());
        })
        .join()
        .unwrap();

        assert_eq!(t.get(), 128);
    }

    #[test]
    fn parked_violation_is_drained_once() {
        clear_pending();
        assert!(check_budget().is_ok());

        let first = BudgetExceeded {
            amount: 2,
            limit: 1,
            requested: 2,
            description: None,
            kind: ExceededKind::Limit,
        };
        let second = BudgetExceeded {
            amount: 3,
            ..first.clone()
        };
        park_exceeded(first.clone());
        park_exceeded(second);

        assert_eq!(check_budget(), Err(first));
        assert!(check_budget().is_ok());
    }
}
