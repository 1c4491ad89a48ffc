//! Budget configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Per-query limit in bytes (0 = unlimited).
    pub max_memory_usage: i64,

    /// Limit shared by all queries of one user (0 = unlimited).
    pub max_memory_usage_for_user: i64,

    /// Limit shared by all running queries (0 = unlimited).
    pub max_memory_usage_for_all_queries: i64,

    /// Probability in [0, 1] that a query-level `alloc` fails on purpose.
    /// Only useful for exception-safety testing.
    pub fault_probability: f64,

    /// Upper bound on worker threads a single query may fan out to.
    pub worker_threads: usize,

    /// Emit the peak-usage log line when a tracker is dropped.
    pub log_peak_on_drop: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_memory_usage: 10 * 1024 * 1024 * 1024, // 10 GiB default
            max_memory_usage_for_user: 0,
            max_memory_usage_for_all_queries: 0,
            fault_probability: 0.0,
            worker_threads: 4,
            log_peak_on_drop: true,
        }
    }
}

impl TrackerConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `MEMTRACK_MAX_MEMORY_USAGE`: per-query limit in bytes
    /// - `MEMTRACK_MAX_MEMORY_USAGE_FOR_USER`: per-user limit in bytes
    /// - `MEMTRACK_MAX_MEMORY_USAGE_FOR_ALL_QUERIES`: global limit in bytes
    /// - `MEMTRACK_FAULT_PROBABILITY`: fault injection probability
    /// - `MEMTRACK_WORKER_THREADS`: max worker threads per query
    /// - `MEMTRACK_LOG_PEAK_ON_DROP`: `true`/`false`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`TrackerConfig::from_env`] but reads through `lookup`, so
    /// callers (and tests) can supply variables without touching the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(v) = parse(&lookup, "MEMTRACK_MAX_MEMORY_USAGE") {
            cfg.max_memory_usage = v;
        }

        if let Some(v) = parse(&lookup, "MEMTRACK_MAX_MEMORY_USAGE_FOR_USER") {
            cfg.max_memory_usage_for_user = v;
        }

        if let Some(v) = parse(&lookup, "MEMTRACK_MAX_MEMORY_USAGE_FOR_ALL_QUERIES") {
            cfg.max_memory_usage_for_all_queries = v;
        }

        if let Some(v) = parse(&lookup, "MEMTRACK_FAULT_PROBABILITY") {
            cfg.fault_probability = v;
        }

        if let Some(v) = parse(&lookup, "MEMTRACK_WORKER_THREADS") {
            cfg.worker_threads = v;
        }

        if let Some(v) = parse(&lookup, "MEMTRACK_LOG_PEAK_ON_DROP") {
            cfg.log_peak_on_drop = v;
        }

        cfg
    }

    /// Reject settings the trackers cannot honour.
    pub fn validate(&self) -> Result<()> {
        let limits = [
            ("max_memory_usage", self.max_memory_usage),
            ("max_memory_usage_for_user", self.max_memory_usage_for_user),
            (
                "max_memory_usage_for_all_queries",
                self.max_memory_usage_for_all_queries,
            ),
        ];
        for (name, value) in limits {
            if value < 0 {
                return Err(Error::Config(format!("{name} must be >= 0, got {value}")));
            }
        }

        if !(0.0..=1.0).contains(&self.fault_probability) {
            return Err(Error::Config(format!(
                "fault_probability must be within [0, 1], got {}",
                self.fault_probability
            )));
        }

        if self.worker_threads == 0 {
            return Err(Error::Config("worker_threads must be at least 1".into()));
        }

        Ok(())
    }

    /// Parse a JSON document, filling missing fields from defaults.
    pub fn from_json(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse::<T>().ok())
}
