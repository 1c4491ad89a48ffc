//! Budget interfaces and the budget-exceeded condition.
//!
//! The concrete tracker lives in `memtrack-mem`. We keep only the trait and the
//! error here so any crate can depend on the API without pulling in the
//! atomics, the thread-local context, or the allocator hook.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::format::ReadableSize;

/// Why an allocation was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExceededKind {
    /// Usage went above a positive limit.
    Limit,
    /// Synthetic failure drawn from the tracker's fault probability.
    FaultInjected,
}

/// Raised by `alloc` when a tracked allocation pushed a budget past its limit,
/// or when fault injection fired.
///
/// Cloning is allocation-free (the description is reference counted), so the
/// condition can be produced, copied into thread-local slots and returned from
/// the allocation path without touching the heap. Rendering the message via
/// `Display` does allocate and belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetExceeded {
    /// Amount of the tracker that raised, *including* the rejected chunk.
    pub amount: i64,
    /// Limit of the tracker that raised (0 when fault injection fired on an
    /// unlimited tracker).
    pub limit: i64,
    /// Size of the chunk whose accounting triggered the condition.
    pub requested: i64,
    /// Label of the budget, e.g. "for query" or "for user".
    pub description: Option<Arc<str>>,
    pub kind: ExceededKind,
}

impl BudgetExceeded {
    pub fn is_fault_injected(&self) -> bool {
        self.kind == ExceededKind::FaultInjected
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl fmt::Display for BudgetExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ExceededKind::Limit => f.write_str("Memory limit")?,
            ExceededKind::FaultInjected => f.write_str("Memory tracker")?,
        }
        if let Some(desc) = &self.description {
            write!(f, " ({desc})")?;
        }
        match self.kind {
            ExceededKind::Limit => f.write_str(" exceeded: would use ")?,
            ExceededKind::FaultInjected => f.write_str(": fault injected. Would use ")?,
        }
        write!(
            f,
            "{} (attempt to allocate chunk of {} bytes), maximum: {}",
            ReadableSize(self.amount),
            self.requested,
            ReadableSize(self.limit)
        )
    }
}

impl std::error::Error for BudgetExceeded {}

/// Accounting interface implemented by `memtrack-mem::Tracker`.
///
/// Call `alloc` *before* the real allocation and `free` *after* the real
/// deallocation. An `Err` from `alloc` leaves the debit in place: whoever
/// unwinds the allocation must call `free` for it.
pub trait MemoryAccount: Send + Sync {
    /// Charge `size` bytes. May be rejected by this budget or any ancestor.
    fn alloc(&self, size: i64) -> Result<(), BudgetExceeded>;

    /// Credit `size` bytes. Never fails and never consults a limit.
    fn free(&self, size: i64);

    /// Account a resize as one net delta.
    fn realloc(&self, old_size: i64, new_size: i64) -> Result<(), BudgetExceeded> {
        self.alloc(new_size - old_size)
    }

    /// Current net bytes (advisory; may be slightly stale under concurrency).
    fn get(&self) -> i64;

    /// Highest `get()` value since construction or the last reset.
    fn peak(&self) -> i64;
}

// NOTE: Do *not* add a blanket "unlimited" impl here; an account that silently
// accepts everything hides misconfigured scopes.

#[cfg(test)]
mod tests {
    use super::*;

    fn exceeded(kind: ExceededKind, description: Option<&str>) -> BudgetExceeded {
        BudgetExceeded {
            amount: 1100,
            limit: 1000,
            requested: 500,
            description: description.map(Arc::from),
            kind,
        }
    }

    #[test]
    fn limit_message_names_the_budget() {
        let err = exceeded(ExceededKind::Limit, Some("for user"));
        assert_eq!(
            err.to_string(),
            "Memory limit (for user) exceeded: would use 1.07 KiB \
             (attempt to allocate chunk of 500 bytes), maximum: 1000.00 B"
        );
    }

    #[test]
    fn fault_message_without_description() {
        let err = exceeded(ExceededKind::FaultInjected, None);
        assert!(err.is_fault_injected());
        assert!(err
            .to_string()
            .starts_with("Memory tracker: fault injected. Would use 1.07 KiB"));
    }

    #[test]
    fn clone_shares_description() {
        let err = exceeded(ExceededKind::Limit, Some("for query"));
        let copy = err.clone();
        let (a, b) = (err.description.unwrap(), copy.description.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
    }

    struct Fixed(i64);

    impl MemoryAccount for Fixed {
        fn alloc(&self, size: i64) -> Result<(), BudgetExceeded> {
            if size > self.0 {
                return Err(BudgetExceeded {
                    amount: size,
                    limit: self.0,
                    requested: size,
                    description: None,
                    kind: ExceededKind::Limit,
                });
            }
            Ok(())
        }
        fn free(&self, _size: i64) {}
        fn get(&self) -> i64 {
            0
        }
        fn peak(&self) -> i64 {
            0
        }
    }

    #[test]
    fn default_realloc_charges_net_delta() {
        let account = Fixed(100);
        assert!(account.realloc(1_000, 1_100).is_ok());
        assert!(account.realloc(0, 101).is_err());
    }
}
