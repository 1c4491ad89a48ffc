//! memtrack: hierarchical, thread-safe memory budgets.
//!
//! Facade over the workspace crates:
//! - [`core`]: budget error, accounting trait, ids, configuration
//! - [`mem`]: trackers, thread-scoped context, reentrancy guard, allocator hook
//! - [`exec`]: query/user/global registry and tracked execution

pub use memtrack_core as core;
pub use memtrack_exec as exec;
pub use memtrack_mem as mem;

pub use memtrack_core::budget::{BudgetExceeded, MemoryAccount};
pub use memtrack_core::config::TrackerConfig;
pub use memtrack_mem::{TaskContext, Tracker, TrackingAllocator, TrackingPause};
