//! Upstream pool demo runner.
//!
//! Drives a concurrent workload through a [`ConnectionPool`] over a simulated
//! flaky, rate-limited upstream, then prints the pool status and exception
//! statistics as JSON.
//!
//! ```text
//!   workers ──▶ ConnectionPool::execute ──▶ lease ──▶ Connection ──▶ RetryManager ──▶ SimulatedUpstream
//!                      │                                   │
//!                      │                                   └─ terminal failure ──▶ ExceptionHandler ──▶ RecoveryManager
//!                      └─ health / cleanup / stats loops
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use futures_util::future::join_all;

use upstream_pool::config::{load_config, ServiceConfig};
use upstream_pool::lifecycle::signals::wait_for_signal;
use upstream_pool::load_balancer::LoadBalanceStrategy;
use upstream_pool::observability::{logging, metrics};
use upstream_pool::pool::ConnectionPool;
use upstream_pool::resilience::{ErrorClassifier, ExceptionHandler, RecoveryManager, RetryManager};
use upstream_pool::upstream::simulated::{SimulatedUpstream, SimulationConfig};

#[derive(Parser)]
#[command(name = "upstream-pool")]
#[command(about = "Run a workload through the resilient connection pool", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the load balancing strategy.
    #[arg(short, long, value_parser = parse_strategy)]
    strategy: Option<LoadBalanceStrategy>,

    /// Concurrent workers.
    #[arg(short, long, default_value_t = 8)]
    workers: usize,

    /// Requests issued by each worker.
    #[arg(short, long, default_value_t = 50)]
    requests: usize,

    /// Acquire timeout in milliseconds.
    #[arg(long, default_value_t = 2_000)]
    acquire_timeout_ms: u64,

    /// Probability that a simulated query fails.
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,

    /// Simulated upstream rate limit.
    #[arg(long, default_value_t = 200.0)]
    requests_per_second: f64,
}

fn parse_strategy(value: &str) -> Result<LoadBalanceStrategy, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unknown strategy '{value}'"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(strategy) = cli.strategy {
        config.pool.strategy = strategy;
    }

    logging::init_logging(&config.observability.log_level);
    tracing::info!("upstream-pool v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    tracing::info!(
        min_size = config.pool.min_size,
        max_size = config.pool.max_size,
        strategy = %config.pool.strategy,
        workers = cli.workers,
        requests = cli.requests,
        "Configuration loaded"
    );

    let upstream = Arc::new(SimulatedUpstream::new(SimulationConfig {
        failure_rate: cli.failure_rate,
        requests_per_second: cli.requests_per_second,
        ..SimulationConfig::default()
    }));

    let classifier = Arc::new(ErrorClassifier::new());
    let retry = Arc::new(RetryManager::new(Arc::clone(&classifier)));
    let recovery = Arc::new(RecoveryManager::with_defaults(&config.exceptions));
    let exceptions = Arc::new(ExceptionHandler::new(
        Arc::clone(&classifier),
        recovery,
        config.exceptions.clone(),
    ));

    let pool = ConnectionPool::new(Arc::clone(&upstream), config.pool.clone(), retry, Arc::clone(&exceptions));
    pool.initialize().await?;

    let started = Instant::now();
    let acquire_timeout = Duration::from_millis(cli.acquire_timeout_ms);
    let workload = run_workload(&pool, &upstream, cli.workers, cli.requests, acquire_timeout);

    let (succeeded, failed) = tokio::select! {
        counts = workload => counts,
        _ = wait_for_signal() => (0, 0),
    };

    tracing::info!(
        succeeded,
        failed,
        elapsed = ?started.elapsed(),
        upstream_queries = upstream.query_count(),
        "Workload finished"
    );

    let report = serde_json::json!({
        "workload": { "succeeded": succeeded, "failed": failed, "elapsed_ms": started.elapsed().as_millis() as u64 },
        "pool": pool.status(),
        "retry": pool.retry().stats(),
        "exceptions": exceptions.stats(Duration::from_secs(3600)),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    pool.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn run_workload(
    pool: &ConnectionPool<SimulatedUpstream>,
    upstream: &Arc<SimulatedUpstream>,
    workers: usize,
    requests: usize,
    acquire_timeout: Duration,
) -> (usize, usize) {
    let tasks = (0..workers).map(|worker| {
        let pool = pool.clone();
        let upstream = Arc::clone(upstream);
        tokio::spawn(async move {
            let mut ok = 0;
            for n in 0..requests {
                let key = format!("w{worker}-{n}");
                let result = pool
                    .execute(acquire_timeout, |handle| {
                        let upstream = Arc::clone(&upstream);
                        let key = key.clone();
                        async move { upstream.query(&handle, &key).await }
                    })
                    .await;
                match result {
                    Ok(_) => ok += 1,
                    Err(err) => tracing::debug!(worker, request = n, error = %err, "Request failed"),
                }
            }
            (ok, requests - ok)
        })
    });

    join_all(tasks)
        .await
        .into_iter()
        .filter_map(Result::ok)
        .fold((0, 0), |(ok, failed), (o, f)| (ok + o, failed + f))
}
