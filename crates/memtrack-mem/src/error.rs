use memtrack_core::budget::BudgetExceeded;
use thiserror::Error;

/// Result type local to memtrack-mem.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),

    #[error("unknown metric: {0}")]
    UnknownMetric(String),
}
