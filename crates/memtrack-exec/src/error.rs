use memtrack_core::budget::BudgetExceeded;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Budget(#[from] BudgetExceeded),
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),
    #[error(transparent)]
    Config(#[from] memtrack_core::error::Error),
}

impl ExecError {
    /// The budget violation behind this error, if that is what it is.
    pub fn as_budget(&self) -> Option<&BudgetExceeded> {
        match self {
            ExecError::Budget(err) => Some(err),
            _ => None,
        }
    }
}
