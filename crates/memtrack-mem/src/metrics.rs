//! Process-wide memory gauges that trackers reflect their usage into.
//!
//! Keep this cheap: one relaxed atomic per metric, no names on the hot path.
//! Exporters (Prometheus, the CLI's JSON dump) read a [`Metrics::snapshot`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    MemoryTracking,
    MemoryTrackingInBackgroundPool,
    MemoryTrackingForMerges,
    QueryMemory,
}

impl Metric {
    pub const COUNT: usize = 4;

    pub const ALL: [Metric; Metric::COUNT] = [
        Metric::MemoryTracking,
        Metric::MemoryTrackingInBackgroundPool,
        Metric::MemoryTrackingForMerges,
        Metric::QueryMemory,
    ];

    const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Metric::MemoryTracking => "MemoryTracking",
            Metric::MemoryTrackingInBackgroundPool => "MemoryTrackingInBackgroundPool",
            Metric::MemoryTrackingForMerges => "MemoryTrackingForMerges",
            Metric::QueryMemory => "QueryMemory",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Metric::MemoryTracking => "Total amount of memory (bytes) allocated in currently executing queries.",
            Metric::MemoryTrackingInBackgroundPool => "Memory (bytes) allocated by background tasks.",
            Metric::MemoryTrackingForMerges => "Memory (bytes) allocated by background merges.",
            Metric::QueryMemory => "Memory (bytes) attributed to individual query budgets.",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnknownMetric(s.to_string()))
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicI64 = AtomicI64::new(0);

/// A registry of gauges keyed by [`Metric`].
#[derive(Debug)]
pub struct Metrics {
    values: [AtomicI64; Metric::COUNT],
}

static GLOBAL: Metrics = Metrics::new();

/// The process-wide registry used by trackers unless told otherwise.
pub fn global() -> &'static Metrics {
    &GLOBAL
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            values: [ZERO; Metric::COUNT],
        }
    }

    #[inline]
    pub fn add(&self, metric: Metric, delta: i64) {
        self.values[metric.index()].fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, metric: Metric, delta: i64) {
        self.values[metric.index()].fetch_sub(delta, Ordering::Relaxed);
    }

    pub fn get(&self, metric: Metric) -> i64 {
        self.values[metric.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<(Metric, i64)> {
        Metric::ALL.iter().map(|&m| (m, self.get(m))).collect()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sub_and_snapshot() {
        let metrics = Metrics::new();
        metrics.add(Metric::MemoryTracking, 100);
        metrics.add(Metric::QueryMemory, 7);
        metrics.sub(Metric::MemoryTracking, 40);

        assert_eq!(metrics.get(Metric::MemoryTracking), 60);
        let snap = metrics.snapshot();
        assert_eq!(snap.len(), Metric::COUNT);
        assert!(snap.contains(&(Metric::QueryMemory, 7)));
        assert!(snap.contains(&(Metric::MemoryTrackingForMerges, 0)));
    }

    #[test]
    fn metric_names_round_trip() {
        for m in Metric::ALL {
            assert_eq!(m.name().parse::<Metric>().unwrap(), m);
            assert!(!m.description().is_empty());
        }
        assert_eq!("querymemory".parse::<Metric>().unwrap(), Metric::QueryMemory);
        assert!(matches!(
            "Nope".parse::<Metric>(),
            Err(Error::UnknownMetric(name)) if name == "Nope"
        ));
    }
}
