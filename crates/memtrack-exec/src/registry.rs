//! Owner of the long-lived budgets and factory for per-query chains.
//!
//! Three nested budgets apply to every query: its own, its user's (shared by
//! all queries of that user) and the global one (shared by every query). The
//! registry owns the user and global trackers; a [`QueryScope`] owns the query
//! tracker and links it `query -> user -> global`.
//!
//! The maps here are only touched when a query starts or ends, never on the
//! allocation path, so a plain `Mutex` is enough. Bookkeeping runs under
//! [`pause_tracking`] so it is not charged to whatever query the caller's
//! thread is working for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use memtrack_core::config::TrackerConfig;
use memtrack_core::id::QueryId;
use memtrack_mem::{pause_tracking, Metric, TaskContext, Tracker};

use crate::error::ExecError;
use crate::metrics::emit_usage;

/// Point-in-time usage of one running query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryUsage {
    pub id: QueryId,
    pub user: String,
    pub amount: i64,
    pub peak: i64,
    pub limit: i64,
}

struct RunningQuery {
    user: String,
    tracker: Arc<Tracker>,
}

struct RegistryInner {
    config: TrackerConfig,
    global: Arc<Tracker>,
    users: Mutex<HashMap<String, Arc<Tracker>>>,
    running: Mutex<HashMap<QueryId, RunningQuery>>,
    next_query_id: AtomicU64,
}

/// Shared handle to the budget registry. Clones refer to the same registry.
#[derive(Clone)]
pub struct BudgetRegistry {
    inner: Arc<RegistryInner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BudgetRegistry {
    pub fn new(config: TrackerConfig) -> Result<Self, ExecError> {
        config.validate()?;

        let mut global = Tracker::with_limit(config.max_memory_usage_for_all_queries);
        global.set_description("(total)");
        global.set_metric(Some(Metric::MemoryTracking));
        global.set_log_peak_on_drop(config.log_peak_on_drop);

        Ok(Self {
            inner: Arc::new(RegistryInner {
                config,
                global: Arc::new(global),
                users: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                next_query_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    /// Budget shared by every query.
    pub fn global(&self) -> &Arc<Tracker> {
        &self.inner.global
    }

    /// Budget shared by every query of `user`, created on first use.
    ///
    /// The registry drops its handle once the user's last running query ends,
    /// so a user seen again later starts from a fresh tracker.
    pub fn user_tracker(&self, user: &str) -> Arc<Tracker> {
        pause_tracking(|| {
            let mut users = lock(&self.inner.users);
            let tracker = users.entry(user.to_string()).or_insert_with(|| {
                let cfg = &self.inner.config;
                let mut t = Tracker::with_limit(cfg.max_memory_usage_for_user);
                t.set_description("for user");
                t.set_log_peak_on_drop(cfg.log_peak_on_drop);
                t.set_next(Some(Arc::clone(&self.inner.global)));
                Arc::new(t)
            });
            Arc::clone(tracker)
        })
    }

    /// Users that currently hold a tracker in the registry, sorted.
    pub fn users(&self) -> Vec<String> {
        pause_tracking(|| {
            let mut out: Vec<String> = lock(&self.inner.users).keys().cloned().collect();
            out.sort();
            out
        })
    }

    /// Start tracking a query for `user`.
    pub fn start_query(&self, user: &str) -> QueryScope {
        let id = QueryId::new(self.inner.next_query_id.fetch_add(1, Ordering::Relaxed));

        pause_tracking(|| {
            // Lock order is `running` then `users`: holding `running` keeps a
            // finishing query from evicting the user tracker picked up here.
            let mut running = lock(&self.inner.running);
            let user_tracker = self.user_tracker(user);

            let cfg = &self.inner.config;
            let mut tracker = Tracker::with_limit(cfg.max_memory_usage);
            tracker.set_description("for query");
            tracker.set_fault_probability(cfg.fault_probability);
            tracker.set_log_peak_on_drop(cfg.log_peak_on_drop);
            tracker.set_next(Some(user_tracker));
            let tracker = Arc::new(tracker);

            running.insert(
                id,
                RunningQuery {
                    user: user.to_string(),
                    tracker: Arc::clone(&tracker),
                },
            );

            #[cfg(feature = "tracing")]
            tracing::trace!(query = %id, user, "query started");

            QueryScope {
                id,
                user: user.to_string(),
                tracker,
                registry: self.clone(),
            }
        })
    }

    /// Snapshot of all running queries, ordered by id.
    pub fn running_queries(&self) -> Vec<QueryUsage> {
        pause_tracking(|| {
            let running = lock(&self.inner.running);
            let mut out: Vec<QueryUsage> = running
                .iter()
                .map(|(id, q)| usage(*id, &q.user, &q.tracker))
                .collect();
            out.sort_by_key(|u| u.id);
            out
        })
    }

    /// Zero the user's counters if none of their queries is running.
    ///
    /// Memory allocated by one query may be released later by another thread
    /// or not at all (caches), so per-user counters drift; resetting once the
    /// user goes idle keeps the drift from accumulating. Returns whether the
    /// reset happened.
    pub fn reset_user(&self, user: &str) -> bool {
        pause_tracking(|| {
            let running = lock(&self.inner.running);
            if running.values().any(|q| q.user == user) {
                return false;
            }
            match lock(&self.inner.users).get(user) {
                Some(tracker) => {
                    tracker.reset();
                    true
                }
                None => false,
            }
        })
    }

    /// Unregister `id`; when it was the user's last query, zero the user's
    /// counters and forget the user.
    fn finish_query(&self, id: QueryId) {
        pause_tracking(|| {
            let mut running = lock(&self.inner.running);
            let Some(q) = running.remove(&id) else {
                return;
            };
            emit_usage("finished", &usage(id, &q.user, &q.tracker));

            if running.values().any(|r| r.user == q.user) {
                return;
            }
            if let Some(user_tracker) = lock(&self.inner.users).remove(&q.user) {
                user_tracker.reset();
            }
        })
    }
}

fn usage(id: QueryId, user: &str, tracker: &Tracker) -> QueryUsage {
    QueryUsage {
        id,
        user: user.to_string(),
        amount: tracker.get(),
        peak: tracker.peak(),
        limit: tracker.limit(),
    }
}

/// A running query. Dropping it unregisters the query.
pub struct QueryScope {
    id: QueryId,
    user: String,
    tracker: Arc<Tracker>,
    registry: BudgetRegistry,
}

impl QueryScope {
    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// Context to enter on every thread that works on this query.
    pub fn context(&self) -> TaskContext {
        TaskContext::new(Arc::clone(&self.tracker))
    }

    pub fn usage(&self) -> QueryUsage {
        usage(self.id, &self.user, &self.tracker)
    }
}

impl Drop for QueryScope {
    fn drop(&mut self) {
        self.registry.finish_query(self.id);
    }
}
