//! Reentrancy guard: a scope in which nothing is charged to any tracker.
//!
//! Per thread there are two states, tracking (some tracker active) and
//! disabled. Creating a [`TrackingPause`] moves to disabled and remembers the
//! exact prior state; dropping it moves back to exactly that state. Pauses nest,
//! each one remembering only its immediate predecessor.
//!
//! The enforcement path pauses before it builds a `BudgetExceeded` or logs, so
//! allocations made while reporting a violation cannot raise it again. Engine
//! code can use the same guard for bookkeeping that must not count against the
//! current request.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::context;
use crate::tracker::Tracker;

#[must_use = "tracking resumes as soon as the pause is dropped"]
pub struct TrackingPause {
    prev: Option<Arc<Tracker>>,
    _not_send: PhantomData<*const ()>,
}

impl TrackingPause {
    pub fn new() -> Self {
        Self {
            prev: context::set_current(None),
            _not_send: PhantomData,
        }
    }

    /// The tracker that was active when the pause began.
    pub fn paused_tracker(&self) -> Option<&Arc<Tracker>> {
        self.prev.as_ref()
    }
}

impl Default for TrackingPause {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TrackingPause {
    fn drop(&mut self) {
        context::set_current(self.prev.take());
    }
}

/// Run `f` with tracking disabled on this thread.
pub fn pause_tracking<R>(f: impl FnOnce() -> R) -> R {
    let _pause = TrackingPause::new();
    f()
}
