//! Connection lifecycle, broadcast routing and degradation handling.
//!
//! The [`StreamManager`] owns the [`ConnectionRegistry`] and, when message
//! throttling is on, the [`ThrottledBroadcaster`]. It plugs itself into the
//! other components through a weak link so nothing forms an `Arc` cycle:
//!
//! * as the broadcaster's [`BroadcastSink`]: batches go to the registry, and
//!   sessions that fail are also unsubscribed from the log store;
//! * as the log store's [`LogForwarder`]: accepted records are routed through
//!   [`StreamManager::broadcast_log`] instead of one send per subscriber;
//! * as a [`DegradationObserver`] on the lag monitor: batching is widened
//!   under load and restored on recovery.

use crate::broadcaster::{BroadcasterStats, ThrottledBroadcaster};
use crate::config::{FeatureFlags, SafeguardConfig};
use crate::error::ObserverError;
use crate::log_store::{LogForwarder, LogStore};
use crate::monitor::{round2, DegradationLevel, DegradationObserver, LagMonitor, LagStats, ObserverId};
use crate::protocol::{now_timestamp, ClientRequest, LogRecord, StreamMessage};
use crate::registry::{BroadcastSink, ConnectionRegistry, DeliveryReport, Session, SessionId, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Records replayed to a newly connected client.
const HISTORY_ON_CONNECT: usize = 50;
/// Ceiling for the batch interval under standard degradation.
const MAX_DEGRADED_INTERVAL: Duration = Duration::from_secs(2);
/// Growth factor applied to the batch interval per standard degradation event.
const DEGRADED_INTERVAL_FACTOR: f64 = 1.5;
/// Batch size forced during emergency degradation.
const EMERGENCY_BATCH_SIZE: usize = 50;

/// Broadcaster statistics as reported by the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottlingStats {
    pub throttling_enabled: bool,
    pub active_connections: usize,
    /// All zero when throttling is disabled.
    #[serde(flatten)]
    pub broadcaster: BroadcasterStats,
}

/// Combined view of the broadcaster and the lag monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegratedStats {
    pub websocket: ThrottlingStats,
    /// `None` when no lag monitor is attached.
    pub event_loop: Option<LagStats>,
    /// Monitor healthy and circuit breaker closed.
    pub integrated_health: bool,
}

pub struct StreamManager {
    registry: ConnectionRegistry,
    store: Arc<LogStore>,
    monitor: Option<Arc<LagMonitor>>,
    broadcaster: Option<Arc<ThrottledBroadcaster>>,
    observer: Mutex<Option<ObserverId>>,
    flags: FeatureFlags,
}

impl StreamManager {
    /// Build a manager wired to `store` and, if performance monitoring is
    /// enabled, to `monitor`.
    pub fn new(
        config: &SafeguardConfig,
        store: Arc<LogStore>,
        monitor: Option<Arc<LagMonitor>>,
    ) -> Arc<Self> {
        let flags = config.flags.clone();
        let throttle = config.throttle.clone();

        Arc::new_cyclic(|weak: &Weak<StreamManager>| {
            let link = Arc::new(ManagerLink(weak.clone()));

            let broadcaster = flags.message_throttling.then(|| {
                Arc::new(ThrottledBroadcaster::new(
                    throttle,
                    Arc::clone(&link) as Arc<dyn BroadcastSink>,
                ))
            });

            store.set_forwarder(Arc::clone(&link) as Arc<dyn LogForwarder>);

            let observer = match &monitor {
                Some(m) if flags.performance_monitoring => {
                    Some(m.add_observer(Arc::clone(&link) as Arc<dyn DegradationObserver>))
                }
                _ => None,
            };

            StreamManager {
                registry: ConnectionRegistry::new(),
                store,
                monitor,
                broadcaster,
                observer: Mutex::new(observer),
                flags,
            }
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn broadcaster(&self) -> Option<&Arc<ThrottledBroadcaster>> {
        self.broadcaster.as_ref()
    }

    // ── Connections ───────────────────────────────────────────────────────

    /// Register a new subscriber and replay recent history to it.
    ///
    /// Every connection gets a fresh server-assigned id; `client_id` is kept
    /// as the session label only, so two clients using the same name stay
    /// independent. History is only sent when there is some. If that first
    /// send fails the session is disconnected straight away; the returned
    /// session is then already unregistered.
    pub async fn connect(&self, transport: Arc<dyn Transport>, client_id: Option<String>) -> Session {
        let mut session = Session::new(self.registry.next_client_id(), transport);
        if let Some(label) = client_id.filter(|c| !c.trim().is_empty()) {
            session = session.with_label(label);
        }

        self.registry.register(session.clone());
        self.store.add_subscriber(session.clone());

        info!(
            session_id = %session.id(),
            client_id = session.label(),
            total_connections = self.registry.len(),
            "Log stream client connected"
        );

        let logs = self.store.recent_entries(HISTORY_ON_CONNECT);
        if !logs.is_empty() {
            if let Err(e) = session.send(&StreamMessage::LogHistory { logs }).await {
                error!(client_id = session.label(), error = %e, "Failed to send log history to new client");
                self.disconnect(session.id());
            }
        }
        session
    }

    /// Drop a subscriber from the registry and the log store.
    pub fn disconnect(&self, id: &SessionId) -> bool {
        let in_registry = self.registry.unregister(id).is_some();
        let in_store = self.store.remove_subscriber(id);
        if in_registry || in_store {
            info!(
                client_id = %id,
                total_connections = self.registry.len(),
                "Log stream client disconnected"
            );
        }
        in_registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    // ── Broadcasting ──────────────────────────────────────────────────────

    /// Send `message` to every live session now, bypassing batching.
    ///
    /// Failed sessions are removed from both the registry and the log store.
    pub async fn direct_broadcast(&self, message: &StreamMessage) -> DeliveryReport {
        let report = self.registry.deliver(message).await;
        for id in &report.failed {
            self.store.remove_subscriber(id);
        }
        report
    }

    async fn route(&self, message: StreamMessage) {
        match &self.broadcaster {
            Some(b) => {
                b.queue_message(message).await;
            }
            None => {
                self.direct_broadcast(&message).await;
            }
        }
    }

    /// Broadcast a log record, batched when throttling is on.
    pub async fn broadcast_log(&self, record: LogRecord) {
        if self.registry.is_empty() {
            return;
        }
        self.route(StreamMessage::LogEntry { log: record }).await;
    }

    /// Broadcast a status update, batched when throttling is on.
    pub async fn send_status_update(&self, status: Value) {
        if self.registry.is_empty() {
            return;
        }
        self.route(StreamMessage::StatusUpdate { status }).await;
    }

    pub async fn broadcast_log_immediate(&self, record: LogRecord) -> DeliveryReport {
        self.direct_broadcast(&StreamMessage::LogEntry { log: record })
            .await
    }

    pub async fn send_status_immediate(&self, status: Value) -> DeliveryReport {
        self.direct_broadcast(&StreamMessage::StatusUpdate { status })
            .await
    }

    // ── Client requests ───────────────────────────────────────────────────

    /// React to a text frame received from `session`.
    pub async fn handle_client_message(&self, session: &Session, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let request: ClientRequest = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                warn!(client_id = session.label(), error = %e, "Received invalid JSON from client");
                return;
            }
        };

        match request {
            ClientRequest::Ping => {
                if let Err(e) = session.send(&StreamMessage::Pong).await {
                    warn!(client_id = session.label(), error = %e, "Failed to answer ping");
                    self.disconnect(session.id());
                }
            }
            ClientRequest::GetStatus => {
                let status = json!({
                    "active_connections": self.connection_count(),
                    "server_status": "running",
                });
                self.send_status_update(status).await;
            }
            ClientRequest::Unknown => {
                debug!(client_id = session.label(), "Ignoring unknown client request");
            }
        }
    }

    // ── Degradation ───────────────────────────────────────────────────────

    /// Retune broadcasting for a degradation event from the lag monitor.
    pub async fn handle_degradation(&self, level: DegradationLevel, lag_ms: f64) {
        match level {
            DegradationLevel::Standard => {
                if let Some(b) = &self.broadcaster {
                    let widened = b
                        .batch_interval()
                        .mul_f64(DEGRADED_INTERVAL_FACTOR)
                        .min(MAX_DEGRADED_INTERVAL);
                    b.set_batch_interval(widened);
                    warn!(
                        lag_ms = round2(lag_ms),
                        batch_interval_secs = widened.as_secs_f64(),
                        "Standard degradation: widened batch interval"
                    );
                }
            }
            DegradationLevel::Emergency => {
                if let Some(b) = &self.broadcaster {
                    b.set_batch_interval(MAX_DEGRADED_INTERVAL);
                    b.set_max_batch_size(EMERGENCY_BATCH_SIZE);
                }
                error!(
                    lag_ms = round2(lag_ms),
                    "Emergency degradation: broadcasting reduced"
                );
                self.send_status_immediate(json!({
                    "performance_mode": "degraded",
                    "reason": "severe_scheduler_lag",
                    "lag_ms": round2(lag_ms),
                    "timestamp": now_timestamp(),
                }))
                .await;
            }
            DegradationLevel::Recovery => {
                if let Some(b) = &self.broadcaster {
                    b.restore_defaults();
                }
                info!("Recovered from degradation: broadcasting restored");
                self.send_status_immediate(json!({
                    "performance_mode": "normal",
                    "timestamp": now_timestamp(),
                }))
                .await;
            }
        }
    }

    // ── Stats ─────────────────────────────────────────────────────────────

    pub fn throttling_stats(&self) -> ThrottlingStats {
        ThrottlingStats {
            throttling_enabled: self.broadcaster.is_some(),
            active_connections: self.connection_count(),
            broadcaster: self
                .broadcaster
                .as_ref()
                .map(|b| b.stats())
                .unwrap_or_default(),
        }
    }

    pub fn performance_integrated_stats(&self) -> IntegratedStats {
        let websocket = self.throttling_stats();
        let monitored = self
            .monitor
            .as_ref()
            .filter(|_| self.flags.performance_monitoring);
        let event_loop_healthy = monitored.is_none_or(|m| m.is_healthy());

        IntegratedStats {
            integrated_health: event_loop_healthy && !websocket.broadcaster.circuit_breaker_active,
            event_loop: monitored.map(|m| m.stats()),
            websocket,
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────

    /// Flush pending batches and detach from the store and the monitor.
    pub async fn shutdown(&self) {
        if let Some(b) = &self.broadcaster {
            let flushed = b.flush_batch().await;
            debug!(flushed, "Flushed pending broadcast batch on shutdown");
        }
        self.store.clear_forwarder();
        let observer = self.observer.lock().take();
        if let (Some(id), Some(monitor)) = (observer, &self.monitor) {
            monitor.remove_observer(id);
        }
        info!(
            active_connections = self.connection_count(),
            "Stream manager shut down"
        );
    }
}

/// Weak handle through which the other components call back into the manager.
struct ManagerLink(Weak<StreamManager>);

#[async_trait]
impl BroadcastSink for ManagerLink {
    async fn deliver(&self, message: &StreamMessage) -> DeliveryReport {
        match self.0.upgrade() {
            Some(manager) => manager.direct_broadcast(message).await,
            None => DeliveryReport::default(),
        }
    }
}

#[async_trait]
impl LogForwarder for ManagerLink {
    async fn forward(&self, record: LogRecord) {
        if let Some(manager) = self.0.upgrade() {
            manager.broadcast_log(record).await;
        }
    }
}

#[async_trait]
impl DegradationObserver for ManagerLink {
    async fn on_degradation_event(
        &self,
        level: DegradationLevel,
        lag_ms: f64,
    ) -> Result<(), ObserverError> {
        let manager = self
            .0
            .upgrade()
            .ok_or_else(|| ObserverError::new("stream manager has been dropped"))?;
        manager.handle_degradation(level, lag_ms).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LagMonitorConfig, LogStoreConfig};
    use crate::log_store::LogSubmission;
    use crate::registry::mock::RecordingTransport;

    fn config(throttling: bool) -> SafeguardConfig {
        SafeguardConfig::builder()
            .message_throttling(throttling)
            .build()
            .unwrap()
    }

    fn parts(throttling: bool) -> (Arc<StreamManager>, Arc<LogStore>, Arc<LagMonitor>) {
        let store = Arc::new(LogStore::new(LogStoreConfig::default()));
        let monitor = Arc::new(LagMonitor::new(LagMonitorConfig::default()));
        let manager = StreamManager::new(&config(throttling), store.clone(), Some(monitor.clone()));
        (manager, store, monitor)
    }

    fn status_modes(t: &RecordingTransport) -> Vec<String> {
        t.sent()
            .iter()
            .filter_map(|m| match m {
                StreamMessage::StatusUpdate { status } => status["performance_mode"]
                    .as_str()
                    .map(str::to_string),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn connect_sends_history_only_when_present() {
        let (manager, store, _) = parts(true);

        let empty = RecordingTransport::new();
        let first = manager.connect(empty.clone(), Some("first".into())).await;
        assert_eq!(first.label(), "first");
        assert!(first.id().as_str().starts_with("client_"));
        assert!(empty.sent().is_empty());

        store.add_entry(LogSubmission::always(LogRecord::event("earlier")));
        let later = RecordingTransport::new();
        manager.connect(later.clone(), None).await;
        assert_eq!(later.sent_kinds(), vec!["log_history"]);
        assert_eq!(manager.connection_count(), 2);
        assert_eq!(store.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn same_client_id_connections_stay_independent() {
        let (manager, store, _) = parts(false);
        let a = RecordingTransport::new();
        let b = RecordingTransport::new();
        let first = manager.connect(a.clone(), Some("tab".into())).await;
        let second = manager.connect(b.clone(), Some("tab".into())).await;

        assert_ne!(first.id(), second.id());
        assert_eq!(manager.connection_count(), 2);
        assert_eq!(store.subscriber_count(), 2);

        manager.broadcast_log(LogRecord::event("hello")).await;
        assert_eq!(a.sent_kinds(), vec!["log_entry"]);
        assert_eq!(b.sent_kinds(), vec!["log_entry"]);

        assert!(manager.disconnect(first.id()));
        manager.broadcast_log(LogRecord::event("again")).await;

        assert_eq!(manager.connection_count(), 1);
        assert_eq!(a.sent().len(), 1);
        assert_eq!(b.sent_kinds(), vec!["log_entry", "log_entry"]);
    }

    #[tokio::test]
    async fn failed_history_send_disconnects() {
        let (manager, store, _) = parts(true);
        store.add_entry(LogSubmission::always(LogRecord::event("earlier")));

        let broken = RecordingTransport::failing();
        let session = manager.connect(broken, None).await;

        assert!(!manager.registry().contains(session.id()));
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_removes_from_registry_and_store() {
        let (manager, store, _) = parts(true);
        let t = RecordingTransport::new();
        let session = manager.connect(t, None).await;

        assert!(manager.disconnect(session.id()));
        assert!(!manager.disconnect(session.id()));
        assert_eq!(manager.connection_count(), 0);
        assert!(!store.has_subscribers());
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_logs_arrive_batched() {
        let (manager, _, _) = parts(true);
        let t = RecordingTransport::new();
        manager.connect(t.clone(), None).await;

        manager.broadcast_log(LogRecord::event("a")).await;
        manager.broadcast_log(LogRecord::event("b")).await;
        assert!(t.sent().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(t.sent_kinds(), vec!["batch_update"]);
    }

    #[tokio::test]
    async fn unthrottled_logs_go_direct() {
        let (manager, _, _) = parts(false);
        let t = RecordingTransport::new();
        manager.connect(t.clone(), None).await;

        manager.broadcast_log(LogRecord::event("a")).await;
        assert_eq!(t.sent_kinds(), vec!["log_entry"]);

        let stats = manager.throttling_stats();
        assert!(!stats.throttling_enabled);
        assert_eq!(stats.broadcaster.total_messages, 0);
    }

    #[tokio::test]
    async fn failed_direct_send_unsubscribes_from_store() {
        let (manager, store, _) = parts(false);
        let t = RecordingTransport::new();
        let session = manager.connect(t.clone(), None).await;
        t.set_failing(true);

        let report = manager.broadcast_log_immediate(LogRecord::event("x")).await;

        assert_eq!(report.failed, vec![session.id().clone()]);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn standard_degradation_widens_interval_up_to_cap() {
        let (manager, _, _) = parts(true);
        let b = manager.broadcaster().unwrap().clone();

        manager.handle_degradation(DegradationLevel::Standard, 50.0).await;
        assert_eq!(b.batch_interval(), Duration::from_millis(750));

        for _ in 0..5 {
            manager.handle_degradation(DegradationLevel::Standard, 50.0).await;
        }
        assert_eq!(b.batch_interval(), MAX_DEGRADED_INTERVAL);
    }

    #[tokio::test]
    async fn emergency_and_recovery_announce_mode_once_each() {
        let (manager, _, _) = parts(true);
        let t = RecordingTransport::new();
        manager.connect(t.clone(), None).await;
        let b = manager.broadcaster().unwrap().clone();

        manager.handle_degradation(DegradationLevel::Emergency, 200.0).await;
        assert_eq!(b.batch_interval(), Duration::from_secs(2));
        assert_eq!(b.max_batch_size(), EMERGENCY_BATCH_SIZE);

        manager.handle_degradation(DegradationLevel::Recovery, 0.0).await;
        assert_eq!(b.batch_interval(), Duration::from_millis(500));
        assert_eq!(b.max_batch_size(), 100);

        assert_eq!(status_modes(&t), vec!["degraded", "normal"]);
    }

    #[tokio::test]
    async fn monitor_events_reach_the_manager() {
        let (manager, _, monitor) = parts(true);
        assert_eq!(monitor.observer_count(), 1);

        monitor.trigger_degradation(50.0).await;
        let b = manager.broadcaster().unwrap();
        assert_eq!(b.batch_interval(), Duration::from_millis(750));

        manager.shutdown().await;
        assert_eq!(monitor.observer_count(), 0);
    }

    #[tokio::test]
    async fn ping_gets_pong_and_garbage_is_ignored() {
        let (manager, _, _) = parts(false);
        let t = RecordingTransport::new();
        let session = manager.connect(t.clone(), None).await;

        manager.handle_client_message(&session, r#"{"type":"ping"}"#).await;
        manager.handle_client_message(&session, "not json").await;
        manager.handle_client_message(&session, r#"{"type":"subscribe"}"#).await;

        assert_eq!(t.sent_kinds(), vec!["pong"]);
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn get_status_broadcasts_connection_count() {
        let (manager, _, _) = parts(false);
        let t = RecordingTransport::new();
        let session = manager.connect(t.clone(), None).await;

        manager
            .handle_client_message(&session, r#"{"type":"get_status"}"#)
            .await;

        let sent = t.sent();
        let StreamMessage::StatusUpdate { status } = &sent[0] else {
            panic!("expected status_update, got {:?}", sent[0]);
        };
        assert_eq!(status["active_connections"], 1);
        assert_eq!(status["server_status"], "running");
    }

    #[tokio::test]
    async fn integrated_health_tracks_monitor() {
        let (manager, _, monitor) = parts(true);
        assert!(manager.performance_integrated_stats().integrated_health);

        monitor.record_lag(200.0).await;
        let stats = manager.performance_integrated_stats();
        assert!(!stats.integrated_health);
        assert!(stats.event_loop.is_some());
    }
}
