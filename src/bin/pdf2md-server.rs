//! Server binary for pdf2md-safeguards.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `SafeguardConfig`, installs logging, and serves until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use pdf2md_safeguards::{server, SafeguardConfig, Safeguards};
use std::io;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const AFTER_HELP: &str = r#"ENDPOINTS:
  GET /ws/logs[?client_id=ID]   live log stream (WebSocket)
  GET /status                   liveness
  GET /status/safeguards        safeguard state (unless --no-status-endpoint)
  GET /config                   effective configuration

EXAMPLES:
  pdf2md-server
  pdf2md-server --host 0.0.0.0 --port 9000
  pdf2md-server --batch-interval 1.0 --max-lag-ms 80
  RUST_LOG=pdf2md_safeguards=debug pdf2md-server --log-format json
"#;

/// Serve the pdf2md log stream with operational safeguards.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2md-server",
    version,
    about = "Serve the pdf2md log stream with operational safeguards",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Interface to bind.
    #[arg(long, env = "PDF2MD_HOST", default_value = "127.0.0.1")]
    host: String,

    /// TCP port.
    #[arg(short, long, env = "PDF2MD_PORT", default_value_t = 8000)]
    port: u16,

    /// Seconds between batched broadcasts (0.1–5.0).
    #[arg(long, env = "PDF2MD_BATCH_INTERVAL", default_value_t = 0.5)]
    batch_interval: f64,

    /// Pending messages that force an immediate flush (10–500).
    #[arg(long, env = "PDF2MD_MAX_BATCH_SIZE", default_value_t = 100)]
    max_batch_size: usize,

    /// Messages per second that trip the circuit breaker (10–200).
    #[arg(long, env = "PDF2MD_CIRCUIT_BREAKER_THRESHOLD", default_value_t = 50.0)]
    circuit_breaker_threshold: f64,

    /// Retained log records (100–5000).
    #[arg(long, env = "PDF2MD_MAX_LOG_ENTRIES", default_value_t = 1000)]
    max_log_entries: usize,

    /// Maximum log record age in seconds (300–86400).
    #[arg(long, env = "PDF2MD_MAX_LOG_AGE", default_value_t = 3600)]
    max_log_age: u64,

    /// Seconds between log cleanup passes (60–1800).
    #[arg(long, env = "PDF2MD_CLEANUP_INTERVAL", default_value_t = 300)]
    cleanup_interval: u64,

    /// Scheduler lag in ms that counts as a breach (10–200).
    #[arg(long, env = "PDF2MD_MAX_LAG_MS", default_value_t = 40.0)]
    max_lag_ms: f64,

    /// Seconds between lag checks (0.5–10).
    #[arg(long, env = "PDF2MD_LAG_CHECK_INTERVAL", default_value_t = 1.0)]
    lag_check_interval: f64,

    /// Broadcast every message immediately instead of batching.
    #[arg(long, env = "PDF2MD_NO_THROTTLING")]
    no_throttling: bool,

    /// Disable periodic age-based log cleanup.
    #[arg(long, env = "PDF2MD_NO_MEMORY_MANAGEMENT")]
    no_memory_management: bool,

    /// Disable the lag monitor.
    #[arg(long, env = "PDF2MD_NO_PERFORMANCE_MONITORING")]
    no_performance_monitoring: bool,

    /// Do not expose GET /status/safeguards.
    #[arg(long, env = "PDF2MD_NO_STATUS_ENDPOINT")]
    no_status_endpoint: bool,

    /// Do not stream this server's own logs to clients.
    #[arg(long, env = "PDF2MD_NO_LOG_CAPTURE")]
    no_log_capture: bool,

    /// Console log format.
    #[arg(long, env = "PDF2MD_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Enable DEBUG-level console logs.
    #[arg(short, long, env = "PDF2MD_VERBOSE")]
    verbose: bool,

    /// Only print errors to the console.
    #[arg(short, long, env = "PDF2MD_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LogFormat {
    Text,
    Json,
}

impl Cli {
    fn to_config(&self) -> Result<SafeguardConfig> {
        SafeguardConfig::builder()
            .host(self.host.clone())
            .port(self.port)
            .batch_interval_secs(self.batch_interval)
            .max_batch_size(self.max_batch_size)
            .circuit_breaker_threshold(self.circuit_breaker_threshold)
            .max_log_entries(self.max_log_entries)
            .max_log_age_secs(self.max_log_age)
            .cleanup_interval_secs(self.cleanup_interval)
            .max_lag_ms(self.max_lag_ms)
            .check_interval_secs(self.lag_check_interval)
            .message_throttling(!self.no_throttling)
            .memory_management(!self.no_memory_management)
            .performance_monitoring(!self.no_performance_monitoring)
            .status_endpoint(!self.no_status_endpoint)
            .log_capture(!self.no_log_capture)
            .build()
            .context("Invalid safeguard configuration")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.to_config()?;
    let safeguards = Arc::new(Safeguards::new(config));

    // ── Logging setup ────────────────────────────────────────────────────
    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console = match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_filter(console_filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_filter(console_filter)
            .boxed(),
    };
    // Clients see INFO and above regardless of the console verbosity.
    let capture = safeguards
        .capture_layer()
        .map(|layer| layer.with_filter(LevelFilter::INFO));

    tracing_subscriber::registry()
        .with(console)
        .with(capture)
        .init();

    // ── Serve ────────────────────────────────────────────────────────────
    safeguards.start();
    info!(
        addr = %safeguards.config().server.addr(),
        version = env!("CARGO_PKG_VERSION"),
        "pdf2md-server starting"
    );

    let result = server::serve(Arc::clone(&safeguards), async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
    })
    .await;

    safeguards.shutdown().await;
    result.context("Server stopped with an error")
}
