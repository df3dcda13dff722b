use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use windowkeeper::config::LimiterConfig;
use windowkeeper::ratelimit::{
    IdleSweeper, LimiterStats, ManualClock, MonotonicClock, RateLimiter, WindowConfig,
};

/// Sliding-window rate limiter playground.
#[derive(Debug, Parser)]
#[command(name = "windowkeeper", version, about)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a burst, wait past the window, then burst again on a manual clock
    Demo,
    /// Hammer a limiter from several threads with random keys
    Simulate {
        /// YAML configuration file (WINDOWKEEPER__* variables override it)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of worker threads
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Requests issued by each thread
        #[arg(long, default_value_t = 10_000)]
        requests: usize,
        /// Number of distinct keys requests are spread over
        #[arg(long, default_value_t = 16, value_parser = clap::value_parser!(u64).range(1..))]
        keys: u64,
    },
    /// Load and validate a configuration file
    CheckConfig {
        /// YAML configuration file
        path: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    threads: usize,
    requests_per_thread: usize,
    keys: u64,
    elapsed_ms: u128,
    interrupted: bool,
    stats: LimiterStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Demo => run_demo(),
        Command::Simulate {
            config,
            threads,
            requests,
            keys,
        } => run_simulation(config, threads, requests, keys).await,
        Command::CheckConfig { path } => check_config(path),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
    }
}

/// Five requests per ten seconds: ten rapid requests, then fifteen more once
/// the first burst has left the window.
fn run_demo() -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::new());
    let config = WindowConfig::new(5, Duration::from_secs(10))?;
    let limiter = RateLimiter::with_clock(config, Arc::clone(&clock));
    let key = "demo";

    for i in 1..=10 {
        let decision = limiter.check(key);
        info!(
            request = i,
            allowed = decision.allowed,
            remaining = decision.remaining,
            retry_after = ?decision.retry_after,
            "Initial burst"
        );
    }

    info!("Waiting for window to expire...");
    clock.advance(Duration::from_secs(11));

    for i in 1..=15 {
        let decision = limiter.check(key);
        info!(
            request = i,
            allowed = decision.allowed,
            remaining = decision.remaining,
            retry_after = ?decision.retry_after,
            "Request after window"
        );
    }

    println!("{}", serde_json::to_string_pretty(&limiter.stats())?);
    Ok(())
}

async fn run_simulation(
    config_path: Option<PathBuf>,
    threads: usize,
    requests: usize,
    keys: u64,
) -> anyhow::Result<()> {
    let config = LimiterConfig::load(config_path.as_deref())?;
    let limiter = Arc::new(RateLimiter::from_config(&config, MonotonicClock::new())?);

    let sweeper = config
        .idle_eviction
        .enabled
        .then(|| {
            IdleSweeper::spawn(
                Arc::clone(&limiter),
                config.idle_eviction.sweep_interval(),
                config.idle_eviction.ttl(),
            )
        })
        .transpose()?;

    info!(threads, requests, keys, "Starting simulation");
    let started = Instant::now();

    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::task::spawn_blocking(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..requests {
                    let key = format!("client:{}", rng.gen_range(0..keys));
                    limiter.try_acquire(&key);
                }
            })
        })
        .collect();

    let run = async {
        for worker in workers {
            worker.await?;
        }
        Ok::<(), anyhow::Error>(())
    };

    let interrupted = tokio::select! {
        result = run => {
            result?;
            false
        }
        _ = shutdown_signal() => {
            warn!("Simulation interrupted, reporting partial results");
            true
        }
    };

    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await?;
    }

    let report = SimulationReport {
        threads,
        requests_per_thread: requests,
        keys,
        elapsed_ms: started.elapsed().as_millis(),
        interrupted,
        stats: limiter.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    info!("Simulation finished");
    Ok(())
}

fn check_config(path: PathBuf) -> anyhow::Result<()> {
    let config = LimiterConfig::load(Some(&path))?;
    let window = config.window_config()?;

    info!(
        path = %path.display(),
        limit = window.max_requests(),
        window = ?window.window(),
        rules = config.rules.len(),
        idle_eviction = config.idle_eviction.enabled,
        "Configuration is valid"
    );
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
