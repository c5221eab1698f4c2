//! outbox-send - Background daemon for scheduled publishing
//!
//! Scans the scheduled post queue and publishes due posts on behalf of
//! each tenant, refreshing OAuth tokens as needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use liboutbox::config::Config;
use liboutbox::crypto::{CryptoMode, TokenCipher};
use liboutbox::error::ConfigError;
use liboutbox::publisher::linkedin::LinkedInAdapter;
use liboutbox::token::HttpOAuth;
use liboutbox::{OutboxError, Pipeline, Result};
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "outbox-send")]
#[command(version)]
#[command(about = "Background daemon that publishes scheduled posts")]
#[command(long_about = "\
outbox-send - Background daemon for scheduled publishing

DESCRIPTION:
    outbox-send is a long-running daemon that scans the Outbox queue and
    publishes due posts to the configured provider on behalf of each
    tenant.

    Every scan interval it enqueues due posts as tasks; a pool of
    workers claims tasks, resolves the tenant's OAuth credentials
    (refreshing access tokens shortly before expiry), publishes, and
    records the outcome. Transient publish failures are retried with
    exponential backoff; a post ends up either published or failed.

USAGE:
    # Run in foreground (logs to stderr)
    outbox-send

    # Run with a custom scan interval
    outbox-send --scan-interval 30

    # Enable verbose logging
    outbox-send --verbose

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-progress publishes finish)

CONFIGURATION:
    Configuration file: ~/.config/outbox/config.toml
    Database location: ~/.local/share/outbox/outbox.db

    [provider]
    client_id = \"...\"       # OAuth client credentials
    client_secret = \"...\"

    [broker]
    scan_interval_secs = 60
    task_expiry_secs = 55

    [dispatch]
    workers = 4
    max_retries = 3

    Credential encryption key comes from the OUTBOX_ENCRYPTION_KEY
    environment variable. With OUTBOX_ENV=production the daemon refuses
    to start without one.

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error

For more information, visit: https://github.com/outbox/outbox
")]
struct Cli {
    /// Scan interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    #[arg(help = "How often to scan for due posts (default: 60)")]
    scan_interval: Option<u64>,

    /// Worker count (overrides config)
    #[arg(long, value_name = "N")]
    #[arg(help = "Number of publish workers (default: 4)")]
    workers: Option<usize>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Run one scan-and-drain pass and exit (for testing)
    #[arg(long, hide = true)]
    #[arg(help = "Publish due posts once and exit (for testing)")]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("outbox-send: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match Config::load() {
        Ok(config) => config,
        Err(OutboxError::Config(ConfigError::ReadError(e)))
            if e.kind() == std::io::ErrorKind::NotFound =>
        {
            warn!("no config file found, using defaults");
            Config::default_config()
        }
        Err(e) => return Err(e),
    };

    if let Some(interval) = cli.scan_interval {
        config.broker.scan_interval_secs = interval;
        if config.broker.task_expiry_secs >= interval {
            config.broker.task_expiry_secs = interval.saturating_sub(5).max(1);
        }
    }
    if let Some(workers) = cli.workers {
        config.dispatch.workers = workers;
    }

    let mode = if config.encryption.mode == "strict" {
        CryptoMode::Strict
    } else {
        CryptoMode::from_env()
    };
    let key = std::env::var("OUTBOX_ENCRYPTION_KEY").ok();
    let cipher = Arc::new(TokenCipher::new(mode, key)?);

    // Collaborators are built up front; missing OAuth client settings
    // fail here, not mid-task.
    let adapter = Arc::new(LinkedInAdapter::new(&config.provider)?);
    let oauth = Arc::new(HttpOAuth::new(&config.provider)?);

    info!("outbox-send daemon starting");

    if cli.once {
        let executed = Pipeline::run_once(&config, cipher, adapter, oauth).await?;
        info!(executed, "processed due posts once, exiting");
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let pipeline = Pipeline::start(&config, cipher, adapter, oauth).await?;

    while !shutdown.load(Ordering::Relaxed) {
        sleep(Duration::from_secs(1)).await;
    }

    pipeline.shutdown().await;
    info!("outbox-send daemon stopped");
    Ok(())
}

/// Initialize logging based on verbosity level and the OUTBOX_LOG_*
/// environment variables
fn init_logging(verbose: bool) {
    use liboutbox::logging::{LogFormat, LoggingConfig};

    let format = std::env::var("OUTBOX_LOG_FORMAT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LogFormat::Text);
    let level = std::env::var("OUTBOX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    LoggingConfig::new(format, level, verbose).init();
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| OutboxError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    let shutdown_clone = shutdown.clone();
    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGTERM | SIGINT => {
                    info!("Received shutdown signal, stopping gracefully...");
                    shutdown_clone.store(true, Ordering::Relaxed);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}

/// Non-Unix builds only get Ctrl-C; signal-hook's iterator is
/// Unix-only.
#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}
