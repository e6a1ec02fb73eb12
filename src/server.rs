//! HTTP and WebSocket surface.
//!
//! | Route | Method | Purpose |
//! |-------|--------|---------|
//! | `/ws/logs` | GET (upgrade) | live log stream; `?client_id=` optional |
//! | `/status` | GET | liveness |
//! | `/status/safeguards` | GET | [`SafeguardsStatus`](crate::SafeguardsStatus), when enabled |
//! | `/config` | GET | effective [`SafeguardConfig`](crate::SafeguardConfig) |
//!
//! Each socket gets a writer task fed by a bounded channel; the
//! [`Transport`] handed to the stream manager only pushes into that channel.
//! Sends never wait on the socket: a full channel fails the send the same
//! way a closed one does, and either failure removes the session.

use crate::error::{SafeguardError, SendError};
use crate::protocol::StreamMessage;
use crate::registry::Transport;
use crate::safeguards::Safeguards;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Frames buffered per socket. A client that falls this far behind is dropped.
const OUTBOUND_BUFFER: usize = 256;

/// [`Transport`] backed by a socket writer task.
#[derive(Debug, Clone)]
pub struct WsTransport {
    tx: mpsc::Sender<String>,
}

impl WsTransport {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_json(&self, message: &StreamMessage) -> Result<(), SendError> {
        let text =
            serde_json::to_string(message).map_err(|e| SendError::Serialization(e.to_string()))?;
        self.tx.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Transport("outbound buffer full".into()),
            TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

/// Build the router for `safeguards`.
pub fn router(safeguards: Arc<Safeguards>) -> Router {
    let mut router = Router::new()
        .route("/ws/logs", get(ws_logs))
        .route("/status", get(status))
        .route("/config", get(config));
    if safeguards.config().flags.status_endpoint {
        router = router.route("/status/safeguards", get(safeguards_status));
    }
    router.with_state(safeguards)
}

/// Bind the configured address and serve until `shutdown` resolves.
pub async fn serve<F>(safeguards: Arc<Safeguards>, shutdown: F) -> Result<(), SafeguardError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = safeguards.config().server.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| SafeguardError::Bind {
            addr: addr.clone(),
            source,
        })?;
    serve_on(listener, safeguards, shutdown).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_on<F>(
    listener: TcpListener,
    safeguards: Arc<Safeguards>,
    shutdown: F,
) -> Result<(), SafeguardError>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(local) = listener.local_addr() {
        info!(addr = %local, "Safeguards server listening");
    }
    axum::serve(listener, router(safeguards))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(SafeguardError::Serve)
}

// ── Handlers ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WsParams {
    client_id: Option<String>,
}

async fn ws_logs(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(safeguards): State<Arc<Safeguards>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, safeguards, params.client_id))
}

async fn handle_socket(socket: WebSocket, safeguards: Arc<Safeguards>, client_id: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let manager = safeguards.manager();
    let session = manager
        .connect(Arc::new(WsTransport::new(tx)), client_id)
        .await;

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                manager.handle_client_message(&session, text.as_str()).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(client_id = session.label(), error = %e, "WebSocket error");
                break;
            }
        }
    }

    manager.disconnect(session.id());
    writer.abort();
    debug!(client_id = session.label(), "WebSocket handler finished");
}

async fn status(State(safeguards): State<Arc<Safeguards>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "active_connections": safeguards.manager().connection_count(),
    }))
}

async fn safeguards_status(State(safeguards): State<Arc<Safeguards>>) -> Json<crate::SafeguardsStatus> {
    info!("Safeguards status requested");
    Json(safeguards.status())
}

async fn config(State(safeguards): State<Arc<Safeguards>>) -> Json<crate::SafeguardConfig> {
    Json(safeguards.config().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ws_transport_writes_json_text() {
        let (tx, mut rx) = mpsc::channel(4);
        let transport = WsTransport::new(tx);

        transport.send_json(&StreamMessage::Pong).await.unwrap();

        let text = rx.recv().await.unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "pong");
    }

    #[tokio::test]
    async fn ws_transport_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let transport = WsTransport::new(tx);
        assert_eq!(
            transport.send_json(&StreamMessage::Pong).await,
            Err(SendError::Closed)
        );
    }

    #[tokio::test]
    async fn ws_transport_fails_fast_when_buffer_is_full() {
        let (tx, _rx) = mpsc::channel(1);
        let transport = WsTransport::new(tx);

        transport.send_json(&StreamMessage::Pong).await.unwrap();
        let second = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            transport.send_json(&StreamMessage::Pong),
        )
        .await
        .expect("send must not wait for the reader");
        assert!(matches!(second, Err(SendError::Transport(_))), "got: {second:?}");
    }

    #[tokio::test]
    async fn stalled_socket_does_not_hold_up_other_sessions() {
        use crate::registry::{BroadcastSink, ConnectionRegistry, Session, SessionId};

        let (stalled_tx, _stalled_rx) = mpsc::channel(1);
        let (healthy_tx, mut healthy_rx) = mpsc::channel(16);
        let stalled = Session::new("stalled", Arc::new(WsTransport::new(stalled_tx)));
        let healthy = Session::new("healthy", Arc::new(WsTransport::new(healthy_tx)));

        let registry = ConnectionRegistry::new();
        registry.register(stalled);
        registry.register(healthy);

        for _ in 0..2 {
            tokio::time::timeout(
                std::time::Duration::from_secs(1),
                registry.deliver(&StreamMessage::Pong),
            )
            .await
            .expect("delivery must not block on a stalled socket");
        }

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&SessionId::from("healthy")));
        assert!(!registry.contains(&SessionId::from("stalled")));
        for _ in 0..2 {
            assert!(healthy_rx.try_recv().is_ok());
        }
    }
}
