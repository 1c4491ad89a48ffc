#![deny(unsafe_code)]
//! memtrack-mem: hierarchical memory trackers and the thread-scoped context
//! that routes allocations to them.
//!
//! - [`Tracker`] keeps lock-free current/peak counters, enforces its limit (and
//!   injected faults), and forwards every delta to the next tracker in its chain.
//! - [`context`] holds the per-thread active tracker and the explicit
//!   [`TaskContext`] schedulers carry between threads.
//! - [`TrackingPause`] disables tracking for a scope; the enforcement path uses
//!   it so that building an error never re-enters the tracker that raised it.
//! - [`TrackingAllocator`] is the `#[global_allocator]` hook.
//!
//! The only `unsafe` lives in `hook`, where `GlobalAlloc` requires it.

pub mod context;
pub mod error;
pub mod guard;
pub mod hook;
pub mod metrics;
pub mod tracker;

pub use context::{check_budget, ContextGuard, TaskContext};
pub use error::{Error, Result};
pub use guard::{pause_tracking, TrackingPause};
pub use hook::TrackingAllocator;
pub use metrics::{Metric, Metrics};
pub use tracker::Tracker;

pub use memtrack_core::budget::{BudgetExceeded, ExceededKind, MemoryAccount};
