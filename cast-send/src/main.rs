//! cast-send - Background daemon for scheduled casts
//!
//! Sweeps the schedule at a fixed interval and publishes every cast that
//! has come due.

use chrono::Utc;
use clap::Parser;
use libcastline::events::spawn_logger;
use libcastline::logging::LoggingConfig;
use libcastline::{create_publisher, CastlineError, Config, Database, Result, SweepSummary, Sweeper};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "cast-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled casts")]
#[command(long_about = "\
cast-send - Background daemon for scheduled casts

DESCRIPTION:
    cast-send is a long-running daemon that publishes scheduled casts when
    they come due.

    Every poll interval it recovers casts left in 'publishing' by a crash,
    optionally requeues failed casts, and then publishes all due casts.
    Each cast is claimed before it is sent, so running two daemons against
    the same database never publishes a cast twice.

USAGE:
    # Run in foreground (logs to stderr)
    cast-send

    # Run a single sweep and print its summary as JSON
    cast-send --once

    # Show what is due without publishing or changing any cast
    cast-send --once --dry-run

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current sweep)

CONFIGURATION:
    Configuration file: ~/.config/castline/config.toml
    Override with CASTLINE_CONFIG and CASTLINE_DB_PATH.

    [sweep]
    poll_interval = 60      # seconds between sweeps
    publish_timeout = 30    # seconds per network call

    [retry]
    auto_requeue = false    # move failed casts back to scheduled

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or database error
")]
struct Cli {
    /// Seconds between sweeps (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Run one sweep, print its summary and exit
    #[arg(long)]
    once: bool,

    /// Log what would be published without contacting the network or
    /// changing any cast
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Arc::new(Database::new(&config.database.path).await?);
    let publisher = create_publisher(&config.publisher, cli.dry_run)?;

    let poll_interval = cli.poll_interval.unwrap_or(config.sweep.poll_interval).max(1);
    let sweeper = Sweeper::from_config(db, publisher, &config).with_dry_run(cli.dry_run);
    spawn_logger(sweeper.events())?;

    info!(
        publisher = sweeper.publisher_name(),
        poll_interval,
        auto_requeue = config.retry.auto_requeue,
        dry_run = cli.dry_run,
        "cast-send starting"
    );

    if cli.once {
        let summary = run_iteration(&sweeper).await;
        let json = serde_json::to_string(&summary)
            .map_err(|e| CastlineError::InvalidInput(format!("Failed to encode summary: {}", e)))?;
        println!("{}", json);
    } else {
        let shutdown = Arc::new(AtomicBool::new(false));
        setup_signal_handlers(shutdown.clone())?;
        run_daemon_loop(&sweeper, poll_interval, shutdown).await;
    }

    info!("cast-send stopped");
    Ok(())
}

/// Recover, requeue, then sweep. Errors in the first two steps are logged
/// and do not prevent the sweep.
async fn run_iteration(sweeper: &Sweeper) -> SweepSummary {
    match sweeper.reconcile_stale(Utc::now()).await {
        Ok(0) => {}
        Ok(n) => warn!(count = n, "Marked interrupted casts as failed"),
        Err(e) => error!(error = %e, "Reconciliation failed"),
    }

    match sweeper.requeue_failed(Utc::now()).await {
        Ok(0) => {}
        Ok(n) => info!(count = n, "Requeued failed casts"),
        Err(e) => error!(error = %e, "Requeue failed"),
    }

    sweeper.run_sweep(Utc::now()).await
}

async fn run_daemon_loop(sweeper: &Sweeper, poll_interval: u64, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping daemon loop");
            break;
        }

        // A sweep in progress always runs to completion so claimed rows resolve
        run_iteration(sweeper).await;

        // Sleep until next poll (check shutdown every second)
        for _ in 0..poll_interval {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}

#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| CastlineError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "Received shutdown signal, finishing current sweep");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(_shutdown: Arc<AtomicBool>) -> Result<()> {
    Ok(())
}
