use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hivemind_ratelimit::{AutoLimiter, RateLimiter, RegistryConfig, Strategy};

/// Drive a rate limiter with concurrent takers and report when each permit
/// was granted.
#[derive(Debug, Parser)]
#[command(name = "ratelimit-demo", version, about)]
struct Args {
    /// Permits granted per interval
    #[arg(long, default_value_t = 10)]
    max_count: u64,

    /// Refill interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    duration_ms: u64,

    /// Admission strategy: windowed or continuous
    #[arg(long, default_value_t = Strategy::Windowed)]
    strategy: Strategy,

    /// Total number of takes
    #[arg(long, default_value_t = 25)]
    tasks: u64,

    /// Number of concurrent takers
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Registry configuration file (YAML, or JSON by extension)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Registry key to take from when --config is given
    #[arg(long, default_value = "default")]
    key: String,
}

/// What the takers draw permits from.
enum Target {
    Single(RateLimiter),
    Keyed { registry: AutoLimiter, key: String },
}

impl Target {
    async fn take(&self) -> anyhow::Result<()> {
        match self {
            Target::Single(limiter) => limiter.take().await,
            Target::Keyed { registry, key } => registry.take(key).await?,
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let scope = CancellationToken::new();
    let target = Arc::new(build_target(&scope, &args)?);

    tokio::spawn(shutdown_signal(scope.clone()));

    let start = Instant::now();
    let next = Arc::new(AtomicU64::new(0));
    let mut workers = JoinSet::new();

    for worker in 0..args.concurrency.max(1) {
        workers.spawn(run_worker(
            worker,
            Arc::clone(&target),
            Arc::clone(&next),
            args.tasks,
            scope.clone(),
            start,
        ));
    }

    while let Some(joined) = workers.join_next().await {
        joined??;
    }

    if scope.is_cancelled() {
        warn!("Interrupted before all takes completed");
    }
    info!(elapsed = ?start.elapsed(), "Done");
    Ok(())
}

/// Take permits until `total` takes have been claimed across all workers or
/// `scope` is cancelled.
async fn run_worker(
    worker: usize,
    target: Arc<Target>,
    next: Arc<AtomicU64>,
    total: u64,
    scope: CancellationToken,
    start: Instant,
) -> anyhow::Result<()> {
    loop {
        let task = next.fetch_add(1, Ordering::SeqCst);
        if task >= total {
            return Ok(());
        }
        tokio::select! {
            _ = scope.cancelled() => return Ok(()),
            result = target.take() => result?,
        }
        println!(
            "task {:>4} worker {:>3} at {:>8.3}s",
            task,
            worker,
            start.elapsed().as_secs_f64()
        );
    }
}

fn build_target(scope: &CancellationToken, args: &Args) -> anyhow::Result<Target> {
    if let Some(path) = &args.config {
        let config = RegistryConfig::from_file(path)?;
        let registry = AutoLimiter::from_config(scope, &config)?;
        info!(key = %args.key, limit = registry.limit(&args.key), "Using keyed registry");
        return Ok(Target::Keyed {
            registry,
            key: args.key.clone(),
        });
    }

    let interval = Duration::from_millis(args.duration_ms);
    let limiter = match args.strategy {
        Strategy::Windowed => RateLimiter::new(scope, args.max_count, interval)?,
        Strategy::Continuous => RateLimiter::leaky_bucket(args.max_count, interval)?,
    };
    info!(
        max_count = args.max_count,
        interval = ?interval,
        strategy = %args.strategy,
        "Using single limiter"
    );
    Ok(Target::Single(limiter))
}

/// Cancel `scope` on Ctrl+C or SIGTERM.
async fn shutdown_signal(scope: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
            info!("Received Ctrl+C, cancelling");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling");
        }
        _ = scope.cancelled() => return,
    }
    scope.cancel();
}
