//! Convenient re-exports for downstream crates.

pub use crate::budget::{BudgetExceeded, ExceededKind, MemoryAccount};
pub use crate::config::TrackerConfig;
pub use crate::error::{Error, Result};
pub use crate::format::{format_bytes, ReadableSize};
pub use crate::id::QueryId;
