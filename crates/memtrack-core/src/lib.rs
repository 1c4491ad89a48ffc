#![forbid(unsafe_code)]
//! memtrack-core: shared vocabulary for hierarchical memory budgets.
//!
//! Holds the budget error, the `MemoryAccount` interface, typed ids and the
//! tracker configuration. The atomic tracker itself lives in `memtrack-mem`;
//! crates that only need to *talk about* budgets depend on this one.

pub mod budget;
pub mod config;
pub mod error;
pub mod format;
pub mod id;
pub mod prelude;
