use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratekeeper::config::RatekeeperConfig;
use ratekeeper::context::Context;
use ratekeeper::ratelimit::Limiter;

/// Keyed rate limiting engine.
#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run `allow` for a key and print each result as JSON
    Check {
        /// The rate limited key
        key: String,

        /// Number of calls to make
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,

        /// Pause between calls in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Starting Ratekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => RatekeeperConfig::from_file(path)?,
        None => RatekeeperConfig::default(),
    };
    info!(
        backend = ?config.store.backend,
        algorithm = ?config.limiter.algorithm,
        "Configuration loaded"
    );

    // Governs the store's background sweep for the lifetime of the process
    let (ctx, cancel) = Context::background().with_cancel();
    let store = config.store.build(&ctx).await?;
    let limiter = config.limiter.build(store)?;

    match cli.command {
        Command::Check {
            key,
            count,
            interval_ms,
        } => {
            tokio::select! {
                res = run_check(&limiter, &ctx, &key, count, Duration::from_millis(interval_ms)) => res?,
                _ = shutdown_signal() => {}
            }
        }
    }

    cancel.cancel();
    info!("Ratekeeper stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_check(
    limiter: &dyn Limiter,
    ctx: &Context,
    key: &str,
    count: u32,
    interval: Duration,
) -> anyhow::Result<()> {
    for i in 0..count {
        let result = limiter.allow(ctx, key).await?;
        println!("{}", serde_json::to_string(&result)?);

        if !interval.is_zero() && i + 1 < count {
            tokio::time::sleep(interval).await;
        }
    }
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
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
