#![forbid(unsafe_code)]
//! memtrack-exec: budget registry and tracked execution.
//!
//! The registry owns the global and per-user trackers and hands out query
//! scopes chained `query -> user -> global`. The scheduler helpers carry a
//! query's [`TaskContext`](memtrack_mem::TaskContext) onto worker threads (or
//! across the polls of a future) and turn parked budget violations into errors.

pub mod error;
pub mod metrics;
pub mod registry;
pub mod scheduler;

pub use error::ExecError;
pub use registry::{BudgetRegistry, QueryScope, QueryUsage};
pub use scheduler::{run_tracked, spawn_tracked, Tracked};

#[cfg(feature = "async-scheduler")]
pub use scheduler::spawn_tracked_async;
