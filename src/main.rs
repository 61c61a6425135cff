use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jobgate::config::JobgateConfig;
use jobgate::ratelimit::{Admission, DistributedLimiter};
use jobgate::store::{MemoryCounterStore, MemoryLock};

#[derive(Debug, Parser)]
#[command(name = "jobgate", version, about = "Distributed admission control for jobs")]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive the limiter with simulated jobs against in-memory counters
    Simulate {
        #[arg(long, default_value = "default")]
        namespace: String,

        #[arg(long, default_value = "default")]
        key: String,

        #[arg(long)]
        kind: Option<String>,

        /// Items carried by each job
        #[arg(long)]
        items: Option<u64>,

        /// Total number of jobs to attempt
        #[arg(long, default_value_t = 10)]
        jobs: usize,

        /// How long each admitted job runs, in milliseconds
        #[arg(long, default_value_t = 100)]
        job_duration_ms: u64,

        /// Jobs attempted at the same time
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => JobgateConfig::from_file(path)?,
        None => {
            warn!("No configuration file given, running without limits");
            JobgateConfig::default()
        }
    };
    info!(limiter = %config.limiter.id, "Configuration loaded");

    let store = Arc::new(MemoryCounterStore::new());
    let lock = Arc::new(MemoryLock::with_config(config.lock.clone()));
    let limiter = DistributedLimiter::new(config.limiter.clone(), config.rules.clone(), store, lock)?;

    match cli.command {
        Command::Simulate {
            namespace,
            key,
            kind,
            items,
            jobs,
            job_duration_ms,
            concurrency,
        } => {
            let run = simulate(
                &limiter,
                &namespace,
                &key,
                kind.as_deref(),
                items,
                jobs,
                Duration::from_millis(job_duration_ms),
                concurrency.max(1),
            );

            tokio::select! {
                result = run => result?,
                _ = shutdown_signal() => {}
            }
        }
    }

    info!("Jobgate stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Attempt `jobs` jobs in rounds of `concurrency`, printing each rejection
/// to stdout as one JSON line.
#[allow(clippy::too_many_arguments)]
async fn simulate(
    limiter: &DistributedLimiter,
    namespace: &str,
    key: &str,
    kind: Option<&str>,
    items: Option<u64>,
    jobs: usize,
    job_duration: Duration,
    concurrency: usize,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let mut admitted = 0usize;
    let mut rejected = 0usize;

    for round in (0..jobs).collect::<Vec<_>>().chunks(concurrency) {
        let attempts = round.iter().map(|&job| {
            limiter.attempt(namespace, key, kind, items, move || async move {
                tokio::time::sleep(job_duration).await;
                job
            })
        });

        for outcome in join_all(attempts).await {
            match outcome? {
                Admission::Admitted(job) => {
                    admitted += 1;
                    info!(job = job, "Job completed");
                }
                Admission::Rejected(rejection) => {
                    rejected += 1;
                    println!("{}", serde_json::to_string(&rejection)?);
                }
            }
        }
    }

    info!(
        admitted = admitted,
        rejected = rejected,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Simulation finished"
    );
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping simulation");
        }
    }
}
