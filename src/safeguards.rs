//! Construction and lifecycle of the whole safeguards subsystem.
//!
//! [`Safeguards`] builds every component from one [`SafeguardConfig`] and
//! wires them together. Nothing runs in the background until
//! [`Safeguards::start`] is called, and [`Safeguards::shutdown`] stops every
//! task it started and flushes whatever is still pending.
//!
//! ```rust,no_run
//! use pdf2md_safeguards::{Safeguards, SafeguardConfig};
//!
//! # async fn run() {
//! let safeguards = Safeguards::new(SafeguardConfig::default());
//! safeguards.start();
//! // ... serve traffic ...
//! safeguards.shutdown().await;
//! # }
//! ```

use crate::capture::LogCaptureLayer;
use crate::config::SafeguardConfig;
use crate::log_store::LogStore;
use crate::manager::StreamManager;
use crate::monitor::LagMonitor;
use crate::status::SafeguardsStatus;
use std::sync::Arc;
use tracing::info;

pub struct Safeguards {
    config: SafeguardConfig,
    store: Arc<LogStore>,
    monitor: Option<Arc<LagMonitor>>,
    manager: Arc<StreamManager>,
}

impl Safeguards {
    pub fn new(config: SafeguardConfig) -> Self {
        let store = Arc::new(LogStore::new(config.log_store.clone()));
        let monitor = config
            .flags
            .performance_monitoring
            .then(|| Arc::new(LagMonitor::new(config.lag_monitor.clone())));
        let manager = StreamManager::new(&config, Arc::clone(&store), monitor.clone());

        Self {
            config,
            store,
            monitor,
            manager,
        }
    }

    pub fn config(&self) -> &SafeguardConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    /// The lag monitor, present only when performance monitoring is enabled.
    pub fn monitor(&self) -> Option<&Arc<LagMonitor>> {
        self.monitor.as_ref()
    }

    pub fn manager(&self) -> &Arc<StreamManager> {
        &self.manager
    }

    /// A tracing layer feeding this instance's log store, unless log capture
    /// is switched off.
    pub fn capture_layer(&self) -> Option<LogCaptureLayer> {
        self.config
            .flags
            .log_capture
            .then(|| LogCaptureLayer::new(Arc::clone(&self.store)))
    }

    /// Start the background tasks enabled by the feature flags.
    ///
    /// Must be called from within a Tokio runtime. Calling it again while the
    /// tasks are running has no effect.
    pub fn start(&self) {
        let flags = &self.config.flags;
        if let Some(monitor) = &self.monitor {
            monitor.start();
        }
        if flags.memory_management {
            self.store.start_cleanup();
        }
        info!(
            throttling_enabled = flags.message_throttling,
            memory_management_enabled = flags.memory_management,
            performance_monitoring_enabled = flags.performance_monitoring,
            "Operational safeguards started"
        );
    }

    /// Flush pending broadcasts and stop every background task.
    pub async fn shutdown(&self) {
        info!("Shutting down operational safeguards");
        self.manager.shutdown().await;
        if let Some(monitor) = &self.monitor {
            monitor.stop().await;
        }
        self.store.stop_cleanup().await;
        info!("Operational safeguards shut down");
    }

    pub fn status(&self) -> SafeguardsStatus {
        SafeguardsStatus::collect(&self.config.flags, &self.manager, &self.store)
    }
}
