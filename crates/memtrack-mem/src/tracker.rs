//! The tracker: lock-free current/peak counters with limit enforcement and
//! forwarding to a chain of enclosing budgets (e.g. query -> user -> global).
//!
//! One tracker may be shared by every thread working on the same request, so
//! the counters are plain relaxed atomics. Nothing here blocks, allocates on the
//! success path, or takes a lock.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use memtrack_core::budget::{BudgetExceeded, ExceededKind, MemoryAccount};

use crate::guard::TrackingPause;
use crate::metrics::{self, Metric, Metrics};

pub struct Tracker {
    amount: AtomicI64,
    peak: AtomicI64,
    /// 0 means unlimited.
    limit: AtomicI64,
    /// `f64` bits.
    fault_probability: AtomicU64,

    next: Option<Arc<Tracker>>,
    metric: Option<Metric>,
    metrics: &'static Metrics,
    description: Option<Arc<str>>,
    log_peak_on_drop: bool,
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            amount: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            limit: AtomicI64::new(0),
            fault_probability: AtomicU64::new(0f64.to_bits()),
            next: None,
            metric: Some(Metric::MemoryTracking),
            metrics: metrics::global(),
            description: None,
            log_peak_on_drop: true,
        }
    }

    pub fn with_limit(limit: i64) -> Self {
        let tracker = Self::new();
        tracker.set_limit(limit);
        tracker
    }

    /// Charge `size` bytes to this tracker and every tracker after it.
    ///
    /// The whole chain is always debited, even when a level rejects; the first
    /// rejection walking outward from `self` is returned. Whoever unwinds the
    /// allocation calls [`Tracker::free`] with the same size.
    pub fn alloc(&self, size: i64) -> Result<(), BudgetExceeded> {
        let mut first_err = None;
        for tracker in self.chain() {
            if let Err(err) = tracker.alloc_local(size) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Credit `size` bytes to this tracker and every tracker after it.
    pub fn free(&self, size: i64) {
        for tracker in self.chain() {
            tracker.amount.fetch_sub(size, Ordering::Relaxed);
            tracker.report(-size);
        }
    }

    /// Account a resize as a single net delta of `new_size - old_size`.
    pub fn realloc(&self, old_size: i64, new_size: i64) -> Result<(), BudgetExceeded> {
        self.alloc(new_size - old_size)
    }

    pub fn get(&self) -> i64 {
        self.amount.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn fault_probability(&self) -> f64 {
        f64::from_bits(self.fault_probability.load(Ordering::Relaxed))
    }

    pub fn next(&self) -> Option<&Arc<Tracker>> {
        self.next.as_ref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn metric(&self) -> Option<Metric> {
        self.metric
    }

    /// `self` followed by every tracker reachable through `next`.
    pub fn chain(&self) -> impl Iterator<Item = &Tracker> {
        std::iter::successors(Some(self), |&t| t.next.as_deref())
    }

    /// Zero the counters. Limit, description, metric and chain are kept.
    pub fn reset(&self) {
        let amount = self.amount.swap(0, Ordering::Relaxed);
        self.report(-amount);
        self.peak.store(0, Ordering::Relaxed);
    }

    /// `0` disables the limit. Negative limits are a caller bug: they panic in
    /// debug builds and are treated as unlimited in release builds.
    pub fn set_limit(&self, limit: i64) {
        debug_assert!(limit >= 0, "limit must be non-negative, got {limit}");
        self.limit.store(limit.max(0), Ordering::Relaxed);
    }

    /// Clamped into `[0, 1]`. NaN disables injection.
    pub fn set_fault_probability(&self, probability: f64) {
        let p = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        self.fault_probability.store(p.to_bits(), Ordering::Relaxed);
    }

    /// Link the enclosing budget. The chain must not contain cycles.
    pub fn set_next(&mut self, next: Option<Arc<Tracker>>) {
        self.next = next;
    }

    /// `None` stops this tracker from reporting into any metric.
    pub fn set_metric(&mut self, metric: Option<Metric>) {
        self.metric = metric;
    }

    pub fn set_metrics(&mut self, metrics: &'static Metrics) {
        self.metrics = metrics;
    }

    pub fn set_description(&mut self, description: impl Into<Arc<str>>) {
        self.description = Some(description.into());
    }

    pub fn set_log_peak_on_drop(&mut self, enabled: bool) {
        self.log_peak_on_drop = enabled;
    }

    /// Emit one diagnostic event with the peak usage and description.
    pub fn log_peak_memory_usage(&self) {
        let _pause = TrackingPause::new();
        #[cfg(feature = "tracing")]
        tracing::debug!(
            peak = self.peak(),
            description = self.description().unwrap_or(""),
            "Peak memory usage"
        );
    }

    fn alloc_local(&self, size: i64) -> Result<(), BudgetExceeded> {
        let will_be = self
            .amount
            .fetch_add(size, Ordering::Relaxed)
            .wrapping_add(size);
        self.record_peak(will_be);
        self.report(size);
        self.check(will_be, size)
    }

    fn record_peak(&self, used: i64) {
        let mut cur = self.peak.load(Ordering::Relaxed);
        while used > cur {
            match self
                .peak
                .compare_exchange(cur, used, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    #[inline]
    fn check(&self, will_be: i64, size: i64) -> Result<(), BudgetExceeded> {
        let probability = self.fault_probability();
        if probability > 0.0 && rand::random::<f64>() < probability {
            return Err(self.exceeded(will_be, size, ExceededKind::FaultInjected));
        }

        let limit = self.limit();
        if limit > 0 && will_be > limit {
            return Err(self.exceeded(will_be, size, ExceededKind::Limit));
        }
        Ok(())
    }

    #[cold]
    fn exceeded(&self, amount: i64, requested: i64, kind: ExceededKind) -> BudgetExceeded {
        // Anything allocated while reporting must not land on this tracker again.
        let _pause = TrackingPause::new();
        #[cfg(feature = "tracing")]
        tracing::warn!(
            amount,
            limit = self.limit(),
            requested,
            description = self.description().unwrap_or(""),
            ?kind,
            "memory budget exceeded"
        );
        BudgetExceeded {
            amount,
            limit: self.limit(),
            requested,
            description: self.description.clone(),
            kind,
        }
    }

    /// Only the end of a chain reports, so each byte is counted once per process.
    #[inline]
    fn report(&self, delta: i64) {
        if self.next.is_none() {
            if let Some(metric) = self.metric {
                self.metrics.add(metric, delta);
            }
        }
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if self.log_peak_on_drop && self.peak() != 0 {
            self.log_peak_memory_usage();
        }
        let amount = self.get();
        if amount != 0 {
            self.report(-amount);
        }
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("amount", &self.get())
            .field("peak", &self.peak())
            .field("limit", &self.limit())
            .field("description", &self.description())
            .field("has_next", &self.next.is_some())
            .finish()
    }
}

impl MemoryAccount for Tracker {
    fn alloc(&self, size: i64) -> Result<(), BudgetExceeded> {
        Tracker::alloc(self, size)
    }

    fn free(&self, size: i64) {
        Tracker::free(self, size)
    }

    fn realloc(&self, old_size: i64, new_size: i64) -> Result<(), BudgetExceeded> {
        Tracker::realloc(self, old_size, new_size)
    }

    fn get(&self) -> i64 {
        Tracker::get(self)
    }

    fn peak(&self) -> i64 {
        Tracker::peak(self)
    }
}
