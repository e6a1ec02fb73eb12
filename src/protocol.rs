//! Wire types for the log-streaming channel.
//!
//! Every frame sent to a subscriber is one JSON object tagged by `type`:
//!
//! | `type` | Payload | When |
//! |--------|---------|------|
//! | `log_history`  | `logs: [record…]` | once, right after connect |
//! | `log_entry`    | `log: record` | single record (throttling off or bypassed) |
//! | `batch_update` | `messages, timestamp, batch_size` | batched delivery |
//! | `status_update`| `status: {…}` | server / degradation status |
//! | `pong`         | — | reply to a client `ping` |

use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current UTC time as an RFC 3339 string with microsecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ── Log records ──────────────────────────────────────────────────────────

/// Severity attached to every stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warning,
            tracing::Level::INFO => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

/// A structured log record: field name → JSON scalar.
///
/// `timestamp` and `level` are always present once the record has been
/// accepted by the [`crate::log_store::LogStore`]; producers may omit them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogRecord(Map<String, Value>);

impl LogRecord {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// A record whose `event` field is `message`.
    pub fn event(message: impl Into<String>) -> Self {
        let mut record = Self::new();
        record.insert("event", message.into());
        record
    }

    /// Builder-style field insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The field as a string slice, if it is a JSON string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &Value) -> bool) {
        self.0.retain(|k, v| keep(k, v));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Parsed `timestamp`. RFC 3339 is preferred; an ISO 8601 stamp without
    /// an offset is read as UTC. `None` when absent or unparseable.
    pub fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
        let ts = self.get_str("timestamp")?;
        DateTime::parse_from_rfc3339(ts).ok().or_else(|| {
            NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc().fixed_offset())
        })
    }

    /// Render a field for dedup hashing: strings verbatim, everything else as JSON.
    pub(crate) fn field_text(&self, key: &str) -> String {
        match self.0.get(key) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

impl From<Map<String, Value>> for LogRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ── Outbound frames ──────────────────────────────────────────────────────

/// A frame pushed to a subscriber session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    LogHistory {
        logs: Vec<LogRecord>,
    },
    LogEntry {
        log: LogRecord,
    },
    BatchUpdate {
        messages: Vec<StreamMessage>,
        timestamp: String,
        batch_size: usize,
    },
    StatusUpdate {
        status: Value,
    },
    Pong,
}

impl StreamMessage {
    /// Wrap pending messages in a `batch_update` envelope stamped with now.
    pub fn batch(messages: Vec<StreamMessage>) -> Self {
        let batch_size = messages.len();
        StreamMessage::BatchUpdate {
            messages,
            timestamp: now_timestamp(),
            batch_size,
        }
    }

    /// The `type` tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::LogHistory { .. } => "log_history",
            StreamMessage::LogEntry { .. } => "log_entry",
            StreamMessage::BatchUpdate { .. } => "batch_update",
            StreamMessage::StatusUpdate { .. } => "status_update",
            StreamMessage::Pong => "pong",
        }
    }
}

// ── Inbound frames ───────────────────────────────────────────────────────

/// A request sent by a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Ping,
    GetStatus,
    #[serde(other)]
    Unknown,
}
