//! memtrack CLI: run tracked workloads under query/user/global budgets.

use std::alloc::System;
use std::thread;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use memtrack_core::config::TrackerConfig;
use memtrack_core::id::QueryId;
use memtrack_exec::{run_tracked, BudgetRegistry, ExecError, QueryScope};
use memtrack_mem::context::check_budget;
use memtrack_mem::{metrics, TrackingAllocator};

#[global_allocator]
static ALLOC: TrackingAllocator = TrackingAllocator::new(System);

#[derive(Parser)]
#[command(name = "memtrack")]
#[command(about = "Hierarchical memory budgets: per query, per user, global", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic workload that allocates real buffers under budgets
    Simulate {
        /// User the queries run as
        #[arg(long, default_value = "default")]
        user: String,

        /// Number of concurrent queries
        #[arg(long, default_value_t = 1)]
        queries: usize,

        /// Worker threads per query (overrides config)
        #[arg(long)]
        threads: Option<usize>,

        /// Size of each buffer a worker allocates and holds
        #[arg(long, default_value_t = 64 * 1024)]
        chunk_bytes: usize,

        /// Buffers each worker allocates
        #[arg(long, default_value_t = 16)]
        chunks: usize,

        #[command(flatten)]
        limits: LimitArgs,
    },

    /// Print the effective configuration (env + flags) as JSON
    Config {
        #[command(flatten)]
        limits: LimitArgs,
    },
}

#[derive(Args, Default)]
struct LimitArgs {
    /// Per-query limit in bytes (0 = unlimited)
    #[arg(long)]
    max_memory_usage: Option<i64>,

    /// Per-user limit in bytes (0 = unlimited)
    #[arg(long)]
    max_memory_usage_for_user: Option<i64>,

    /// Limit across all queries in bytes (0 = unlimited)
    #[arg(long)]
    max_memory_usage_for_all_queries: Option<i64>,

    /// Probability that a query allocation fails on purpose
    #[arg(long)]
    fault_probability: Option<f64>,
}

#[derive(Debug, Serialize)]
struct QueryReport {
    query: QueryId,
    user: String,
    ok: bool,
    bytes_held: usize,
    peak: i64,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    queries: Vec<QueryReport>,
    global_peak: i64,
    metrics: Vec<(String, i64)>,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Simulate {
            user,
            queries,
            threads,
            chunk_bytes,
            chunks,
            limits,
        } => simulate(&user, queries, threads, chunk_bytes, chunks, &limits),
        Commands::Config { limits } => print_config(&limits),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn effective_config(
    limits: &LimitArgs,
    threads: Option<usize>,
) -> Result<TrackerConfig, Box<dyn std::error::Error>> {
    let mut config = TrackerConfig::from_env();
    apply_limits(&mut config, limits);
    if let Some(threads) = threads {
        config.worker_threads = threads;
    }
    config.validate()?;
    Ok(config)
}

fn apply_limits(config: &mut TrackerConfig, limits: &LimitArgs) {
    if let Some(v) = limits.max_memory_usage {
        config.max_memory_usage = v;
    }
    if let Some(v) = limits.max_memory_usage_for_user {
        config.max_memory_usage_for_user = v;
    }
    if let Some(v) = limits.max_memory_usage_for_all_queries {
        config.max_memory_usage_for_all_queries = v;
    }
    if let Some(v) = limits.fault_probability {
        config.fault_probability = v;
    }
}

fn print_config(limits: &LimitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = effective_config(limits, None)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn simulate(
    user: &str,
    queries: usize,
    threads: Option<usize>,
    chunk_bytes: usize,
    chunks: usize,
    limits: &LimitArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = effective_config(limits, threads)?;
    let workers = config.worker_threads;
    let registry = BudgetRegistry::new(config)?;

    let scopes: Vec<QueryScope> = (0..queries).map(|_| registry.start_query(user)).collect();

    let reports: Vec<QueryReport> = thread::scope(|s| {
        let handles: Vec<_> = scopes
            .iter()
            .map(|scope| s.spawn(move || run_query(scope, workers, chunk_bytes, chunks)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| "query thread panicked"))
            .collect::<Result<_, _>>()
    })?;

    let report = SimulationReport {
        queries: reports,
        global_peak: registry.global().peak(),
        metrics: metrics::global()
            .snapshot()
            .into_iter()
            .map(|(m, v)| (m.name().to_string(), v))
            .collect(),
    };
    drop(scopes);

    let failed = report.queries.iter().filter(|q| !q.ok).count();
    tracing::info!(
        queries = report.queries.len(),
        failed,
        global_peak = report.global_peak,
        "simulation finished"
    );

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Every worker allocates `chunks` buffers of `chunk_bytes` and holds them
/// until it finishes, checking the budget after each allocation.
fn run_query(scope: &QueryScope, workers: usize, chunk_bytes: usize, chunks: usize) -> QueryReport {
    let tasks: Vec<_> = (0..workers)
        .map(|_| {
            move || -> Result<usize, ExecError> {
                let mut held: Vec<Vec<u8>> = Vec::with_capacity(chunks);
                for _ in 0..chunks {
                    held.push(vec![1u8; chunk_bytes]);
                    check_budget()?;
                }
                Ok(held.iter().map(Vec::len).sum())
            }
        })
        .collect();

    let result = run_tracked(&scope.context(), workers, tasks);
    let (ok, bytes_held, error) = match result {
        Ok(per_worker) => (true, per_worker.iter().sum(), None),
        Err(e) => (false, 0, Some(e.to_string())),
    };

    QueryReport {
        query: scope.id(),
        user: scope.user().to_string(),
        ok,
        bytes_held,
        peak: scope.tracker().peak(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::{apply_limits, LimitArgs, TrackerConfig};

    #[test]
    fn flags_override_config() {
        let mut config = TrackerConfig::default();
        let limits = LimitArgs {
            max_memory_usage: Some(1000),
            fault_probability: Some(0.5),
            ..Default::default()
        };
        apply_limits(&mut config, &limits);
        assert_eq!(config.max_memory_usage, 1000);
        assert_eq!(config.fault_probability, 0.5);
        assert_eq!(config.max_memory_usage_for_user, 0);
    }

    #[test]
    fn missing_flags_keep_config() {
        let mut config = TrackerConfig {
            max_memory_usage_for_user: 77,
            ..Default::default()
        };
        apply_limits(&mut config, &LimitArgs::default());
        assert_eq!(config.max_memory_usage_for_user, 77);
    }
}
