//! Error types for the pdf2md-safeguards library.
//!
//! Two distinct error families reflect two distinct failure modes:
//!
//! * [`SafeguardError`]: **Fatal**, the service cannot start or keep serving
//!   (invalid configuration, listener bind failure). Returned from
//!   configuration builders and the server entry points.
//!
//! * [`SendError`] / [`ObserverError`]: **Local**, a single subscriber
//!   session or a single degradation observer failed. These never reach the
//!   producer of a log event; the safeguards remove the failing session or log
//!   the failing observer and carry on.

use thiserror::Error;

/// Fatal errors returned by the pdf2md-safeguards library.
#[derive(Debug, Error)]
pub enum SafeguardError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Server errors ─────────────────────────────────────────────────────
    /// The HTTP listener could not bind to the configured address.
    #[error("Failed to bind '{addr}': {source}\nIs another process already listening on it?")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The HTTP server stopped with an I/O error.
    #[error("HTTP server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// A failed send to one subscriber session.
///
/// The session that produced it is removed from the registry after the
/// current delivery pass; the error itself is only logged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// The peer has gone away.
    #[error("session closed")]
    Closed,

    /// The message could not be encoded for the wire.
    #[error("serialisation failed: {0}")]
    Serialization(String),

    /// The transport refused the frame, e.g. its outbound buffer is full.
    #[error("transport error: {0}")]
    Transport(String),
}

/// A degradation observer rejected an event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("degradation observer failed: {0}")]
pub struct ObserverError(pub String);

impl ObserverError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_display() {
        let e = SafeguardError::InvalidConfig("batch interval must be 0.1–5.0s".into());
        assert!(e.to_string().contains("batch interval"), "got: {e}");
    }

    #[test]
    fn bind_display_mentions_addr() {
        let e = SafeguardError::Bind {
            addr: "127.0.0.1:8000".into(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        let msg = e.to_string();
        assert!(msg.contains("127.0.0.1:8000"), "got: {msg}");
        assert!(msg.contains("in use"), "got: {msg}");
    }

    #[test]
    fn send_error_display() {
        assert_eq!(SendError::Closed.to_string(), "session closed");
        assert!(SendError::Transport("reset by peer".into())
            .to_string()
            .contains("reset by peer"));
        assert_eq!(
            SendError::Transport("outbound buffer full".into()).to_string(),
            "transport error: outbound buffer full"
        );
    }

    #[test]
    fn fatal_errors_are_config_or_server() {
        let e = SafeguardError::Serve(std::io::Error::other("accept failed"));
        assert!(e.to_string().contains("accept failed"), "got: {e}");
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn observer_error_display() {
        let e = ObserverError::new("boom");
        assert_eq!(e.to_string(), "degradation observer failed: boom");
    }
}
