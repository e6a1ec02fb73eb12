//! # pdf2md-safeguards
//!
//! Operational safeguards for the pdf2md web service: the pieces that keep a
//! live log stream from taking the server down with it.
//!
//! ## Why this crate?
//!
//! A conversion server streams its logs to browser clients over WebSockets.
//! Left alone, that stream grows memory without bound, floods clients during
//! bursts, and keeps pushing at full speed while the runtime is already
//! falling behind. Each safeguard here addresses one of those failure modes,
//! and each can be switched off independently.
//!
//! ## Components
//!
//! ```text
//!  tracing events
//!       │
//!       ▼
//!  LogCaptureLayer ──► LogStore (bounded ring, dedup, age cleanup)
//!                          │ forwards
//!                          ▼
//!                     StreamManager ──► ThrottledBroadcaster ──► ConnectionRegistry ──► clients
//!                          ▲              (batches, breaker)
//!                          │ degradation events
//!                     LagMonitor (scheduler lag sampling)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf2md_safeguards::{server, SafeguardConfig, Safeguards};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SafeguardConfig::builder().port(8000).build()?;
//!     let safeguards = Arc::new(Safeguards::new(config));
//!     safeguards.start();
//!     server::serve(Arc::clone(&safeguards), async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     safeguards.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2md-server` binary (clap + anyhow) |
//!
//! Disable `cli` when embedding the safeguards in another server:
//! ```toml
//! pdf2md-safeguards = { version = "0.5", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod broadcaster;
pub mod capture;
pub mod config;
pub mod error;
pub mod log_store;
pub mod manager;
pub mod monitor;
pub mod protocol;
pub mod registry;
pub mod ring;
pub mod safeguards;
pub mod server;
pub mod status;
mod task;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use broadcaster::{BroadcasterStats, QueueOutcome, ThrottledBroadcaster};
pub use capture::LogCaptureLayer;
pub use config::{
    FeatureFlags, LagMonitorConfig, LogStoreConfig, SafeguardConfig, SafeguardConfigBuilder,
    ServerConfig, ThrottleConfig,
};
pub use error::{ObserverError, SafeguardError, SendError};
pub use log_store::{EntryOutcome, LogForwarder, LogStore, LogSubmission, MemoryStats, StorePolicy};
pub use manager::{IntegratedStats, StreamManager, ThrottlingStats};
pub use monitor::{
    DegradationLevel, DegradationObserver, DegradationState, LagMeasurement, LagMonitor, LagStats,
    ObserverId,
};
pub use protocol::{ClientRequest, LogLevel, LogRecord, StreamMessage};
pub use registry::{BroadcastSink, ConnectionRegistry, DeliveryReport, Session, SessionId, Transport};
pub use ring::BoundedRing;
pub use safeguards::Safeguards;
pub use status::SafeguardsStatus;
