//! Live subscriber sessions and the direct-send path.
//!
//! A [`Session`] pairs an id with an `Arc<dyn Transport>`: the only thing the
//! safeguards ever do with a transport is call [`Transport::send_json`].
//! The [`ConnectionRegistry`] keeps sessions in registration order and is the
//! default [`BroadcastSink`]: it sends to a snapshot of the live set, collects
//! failures, and only removes the failed sessions once the pass is over.

use crate::error::SendError;
use crate::protocol::StreamMessage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Capability to push one frame to one connected client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `message` as a JSON text frame. An `Err` means the session is
    /// unusable and will be dropped.
    async fn send_json(&self, message: &StreamMessage) -> Result<(), SendError>;
}

/// Something that can fan a frame out to every live session.
#[async_trait]
pub trait BroadcastSink: Send + Sync {
    async fn deliver(&self, message: &StreamMessage) -> DeliveryReport;
}

/// Outcome of one fan-out pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Sessions that accepted the frame.
    pub delivered: usize,
    /// Sessions whose send failed, in the order they were attempted.
    pub failed: Vec<SessionId>,
}

// ── Sessions ─────────────────────────────────────────────────────────────

/// Opaque identifier of a subscriber session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A connected subscriber: an id plus a send capability.
///
/// The id identifies the connection and is unique per registry. A
/// client-chosen name, if any, is only a label and never used as a key.
#[derive(Clone)]
pub struct Session {
    id: SessionId,
    label: Option<String>,
    transport: Arc<dyn Transport>,
    connected_at: Instant,
}

impl Session {
    pub fn new(id: impl Into<SessionId>, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: id.into(),
            label: None,
            transport,
            connected_at: Instant::now(),
        }
    }

    /// Attach the name the client asked for.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// The client-supplied name, falling back to the id.
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(self.id.as_str())
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub async fn send(&self, message: &StreamMessage) -> Result<(), SendError> {
        self.transport.send_json(message).await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("transport", &"<dyn Transport>")
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

/// Send `message` to each session in order, one at a time.
///
/// A slow or failing session never prevents delivery to the ones after it.
/// The caller owns removal of the sessions listed in `failed`.
pub async fn deliver_to(sessions: &[Session], message: &StreamMessage) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    for session in sessions {
        match session.send(message).await {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!(
                    session_id = %session.id(),
                    message_type = message.kind(),
                    error = %e,
                    "Send to session failed"
                );
                report.failed.push(session.id().clone());
            }
        }
    }
    report
}

// ── Registry ─────────────────────────────────────────────────────────────

/// Registration-ordered set of live sessions.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<Vec<Session>>,
    next_client: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh `client_N` id, unique within this registry.
    pub fn next_client_id(&self) -> SessionId {
        let n = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        SessionId(format!("client_{n}"))
    }

    /// Add `session`. A session already registered under the same id is
    /// replaced in place (keeping its position) and returned.
    pub fn register(&self, session: Session) -> Option<Session> {
        let mut sessions = self.sessions.lock();
        match sessions.iter().position(|s| s.id == session.id) {
            Some(idx) => Some(std::mem::replace(&mut sessions[idx], session)),
            None => {
                sessions.push(session);
                None
            }
        }
    }

    pub fn unregister(&self, id: &SessionId) -> Option<Session> {
        let mut sessions = self.sessions.lock();
        let idx = sessions.iter().position(|s| &s.id == id)?;
        Some(sessions.remove(idx))
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.lock().iter().find(|s| &s.id == id).cloned()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.lock().iter().any(|s| &s.id == id)
    }

    /// Clone of the live set, in registration order.
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[async_trait]
impl BroadcastSink for ConnectionRegistry {
    async fn deliver(&self, message: &StreamMessage) -> DeliveryReport {
        let sessions = self.snapshot();
        if sessions.is_empty() {
            return DeliveryReport::default();
        }

        let report = deliver_to(&sessions, message).await;

        for id in &report.failed {
            self.unregister(id);
        }
        if !report.failed.is_empty() {
            debug!(
                removed = report.failed.len(),
                remaining = self.len(),
                "Dropped failed sessions after broadcast"
            );
        }
        report
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// Transport double that records every frame it accepts.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        sent: Mutex<Vec<StreamMessage>>,
        failing: AtomicBool,
    }

    impl RecordingTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn failing() -> Arc<Self> {
            let t = Self::default();
            t.failing.store(true, Ordering::SeqCst);
            Arc::new(t)
        }

        pub(crate) fn set_failing(&self, v: bool) {
            self.failing.store(v, Ordering::SeqCst);
        }

        pub(crate) fn sent(&self) -> Vec<StreamMessage> {
            self.sent.lock().clone()
        }

        pub(crate) fn sent_kinds(&self) -> Vec<&'static str> {
            self.sent.lock().iter().map(StreamMessage::kind).collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_json(&self, message: &StreamMessage) -> Result<(), SendError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SendError::Closed);
            }
            self.sent.lock().push(message.clone());
            Ok(())
        }
    }

    pub(crate) fn session(id: &str, transport: &Arc<RecordingTransport>) -> Session {
        Session::new(id, Arc::clone(transport) as Arc<dyn Transport>)
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{session, RecordingTransport};
    use super::*;

    #[tokio::test]
    async fn register_preserves_order_and_replaces_duplicates() {
        let registry = ConnectionRegistry::new();
        let a = RecordingTransport::new();
        let b = RecordingTransport::new();

        assert!(registry.register(session("a", &a)).is_none());
        assert!(registry.register(session("b", &b)).is_none());
        assert!(registry.register(session("a", &b)).is_some());

        let ids: Vec<_> = registry.snapshot().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn deliver_removes_failed_sessions_after_pass() {
        let registry = ConnectionRegistry::new();
        let ok1 = RecordingTransport::new();
        let bad = RecordingTransport::failing();
        let ok2 = RecordingTransport::new();
        registry.register(session("ok1", &ok1));
        registry.register(session("bad", &bad));
        registry.register(session("ok2", &ok2));

        let report = registry.deliver(&StreamMessage::Pong).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, vec![SessionId::from("bad")]);
        assert_eq!(ok1.sent_kinds(), vec!["pong"]);
        assert_eq!(ok2.sent_kinds(), vec!["pong"]);
        assert!(!registry.contains(&SessionId::from("bad")));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn deliver_to_empty_registry_is_noop() {
        let registry = ConnectionRegistry::new();
        let report = registry.deliver(&StreamMessage::Pong).await;
        assert_eq!(report, DeliveryReport::default());
    }

    #[test]
    fn generated_ids_are_unique() {
        let registry = ConnectionRegistry::new();
        let a = registry.next_client_id();
        let b = registry.next_client_id();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("client_"));
    }
}
