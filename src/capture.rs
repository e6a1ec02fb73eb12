//! `tracing` layer that feeds events into the [`LogStore`].
//!
//! Each event becomes a [`LogRecord`]: the message as `event`, the level,
//! an RFC 3339 `timestamp`, the target as `logger`, the `app` name and crate
//! `version`, every recorded field, and `request_id` / `session_id` taken from
//! the nearest enclosing span that carries them. Records are submitted as
//! [`StorePolicy::SubscribersOnly`](crate::log_store::StorePolicy), so the
//! layer costs next to nothing while nobody is watching the stream.
//!
//! Install it next to the usual fmt layer; it never changes what is printed:
//!
//! ```rust,no_run
//! use pdf2md_safeguards::{LogCaptureLayer, LogStore};
//! use std::sync::Arc;
//! use tracing_subscriber::layer::SubscriberExt;
//! use tracing_subscriber::util::SubscriberInitExt;
//!
//! let store = Arc::new(LogStore::default());
//! tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer())
//!     .with(LogCaptureLayer::new(store))
//!     .init();
//! ```

use crate::log_store::{LogStore, LogSubmission};
use crate::protocol::{now_timestamp, LogLevel, LogRecord};
use serde_json::Value;
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const APP_NAME: &str = "pdf2md";

/// Targets on the delivery path. Capturing their events would feed every
/// send failure straight back into another send.
const DELIVERY_PATH_TARGETS: &[&str] = &[
    concat!(env!("CARGO_CRATE_NAME"), "::log_store"),
    concat!(env!("CARGO_CRATE_NAME"), "::broadcaster"),
    concat!(env!("CARGO_CRATE_NAME"), "::registry"),
];

const CONTEXT_FIELDS: [&str; 2] = ["request_id", "session_id"];

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside a capture until dropped.
struct CaptureGuard;

impl CaptureGuard {
    /// `None` when this thread is already capturing.
    fn enter() -> Option<Self> {
        CAPTURING.with(|c| {
            if c.get() {
                None
            } else {
                c.set(true);
                Some(CaptureGuard)
            }
        })
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        CAPTURING.with(|c| c.set(false));
    }
}

/// Correlation ids recorded on a span.
#[derive(Debug, Default, Clone)]
struct SpanContext {
    request_id: Option<String>,
    session_id: Option<String>,
}

impl SpanContext {
    fn is_empty(&self) -> bool {
        self.request_id.is_none() && self.session_id.is_none()
    }

    fn slot(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            "request_id" => Some(&mut self.request_id),
            "session_id" => Some(&mut self.session_id),
            _ => None,
        }
    }
}

impl Visit for SpanContext {
    fn record_str(&mut self, field: &Field, value: &str) {
        if let Some(slot) = self.slot(field.name()) {
            *slot = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if let Some(slot) = self.slot(field.name()) {
            *slot = Some(format!("{value:?}"));
        }
    }
}

/// Collects event fields into a [`LogRecord`].
struct RecordVisitor<'a>(&'a mut LogRecord);

impl RecordVisitor<'_> {
    fn put(&mut self, field: &Field, value: impl Into<Value>) {
        let name = match field.name() {
            "message" => "event",
            other => other,
        };
        self.0.insert(name, value);
    }
}

impl Visit for RecordVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value);
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value);
    }
}

/// Layer that submits every event it sees to a [`LogStore`].
pub struct LogCaptureLayer {
    store: Arc<LogStore>,
}

impl LogCaptureLayer {
    pub fn new(store: Arc<LogStore>) -> Self {
        Self { store }
    }
}

impl<S> Layer<S> for LogCaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut context = SpanContext::default();
        attrs.record(&mut context);
        if context.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(context);
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<SpanContext>() {
            Some(context) => values.record(context),
            None => {
                let mut context = SpanContext::default();
                values.record(&mut context);
                if !context.is_empty() {
                    extensions.insert(context);
                }
            }
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        let target = meta.target();
        if DELIVERY_PATH_TARGETS.iter().any(|t| target.starts_with(t)) {
            return;
        }
        let Some(_guard) = CaptureGuard::enter() else {
            return;
        };

        let mut record = LogRecord::new();
        event.record(&mut RecordVisitor(&mut record));

        if let Some(scope) = ctx.event_scope(event) {
            let mut context = SpanContext::default();
            for span in scope.from_root() {
                if let Some(ids) = span.extensions().get::<SpanContext>() {
                    if ids.request_id.is_some() {
                        context.request_id.clone_from(&ids.request_id);
                    }
                    if ids.session_id.is_some() {
                        context.session_id.clone_from(&ids.session_id);
                    }
                }
            }
            for (name, value) in CONTEXT_FIELDS.into_iter().zip([context.request_id, context.session_id]) {
                if let Some(value) = value {
                    if !record.contains_key(name) {
                        record.insert(name, value);
                    }
                }
            }
        }

        record.insert("level", LogLevel::from(meta.level()).as_str());
        record.insert("timestamp", now_timestamp());
        record.insert("logger", target);
        for (name, value) in [("app", APP_NAME), ("version", env!("CARGO_PKG_VERSION"))] {
            if !record.contains_key(name) {
                record.insert(name, value);
            }
        }

        self.store.add_entry(LogSubmission::new(record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::mock::{session, RecordingTransport};
    use tracing_subscriber::layer::SubscriberExt;

    fn watched_store() -> Arc<LogStore> {
        let store = Arc::new(LogStore::default());
        store.add_subscriber(session("viewer", &RecordingTransport::new()));
        store
    }

    fn capture<F: FnOnce()>(store: &Arc<LogStore>, f: F) {
        let subscriber =
            tracing_subscriber::registry().with(LogCaptureLayer::new(Arc::clone(store)));
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn events_become_records_with_span_context() {
        let store = watched_store();
        capture(&store, || {
            let span = tracing::info_span!("request", request_id = "req-7");
            let _entered = span.enter();
            tracing::warn!(page = 3, ratio = 0.5, ok = true, "page converted");
        });

        let records = store.recent_entries(10);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.get_str("event"), Some("page converted"));
        assert_eq!(r.get_str("level"), Some("warning"));
        assert_eq!(r.get_str("request_id"), Some("req-7"));
        assert_eq!(r.get("page"), Some(&serde_json::json!(3)));
        assert_eq!(r.get("ok"), Some(&serde_json::json!(true)));
        assert!(r.get_str("logger").unwrap().ends_with("capture::tests"));
        assert!(r.timestamp().is_some());
        assert_eq!(r.get_str("app"), Some("pdf2md"));
        assert_eq!(r.get_str("version"), Some(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn innermost_span_wins_and_late_records_count() {
        let store = watched_store();
        capture(&store, || {
            let outer = tracing::info_span!("outer", request_id = "outer", session_id = "s-1");
            let _o = outer.enter();
            let inner = tracing::info_span!("inner", request_id = tracing::field::Empty);
            inner.record("request_id", "inner");
            let _i = inner.enter();
            tracing::info!("nested");
        });

        let r = &store.recent_entries(1)[0];
        assert_eq!(r.get_str("request_id"), Some("inner"));
        assert_eq!(r.get_str("session_id"), Some("s-1"));
    }

    #[test]
    fn nothing_is_kept_without_subscribers() {
        let store = Arc::new(LogStore::default());
        capture(&store, || tracing::info!("unwatched"));
        assert!(store.is_empty());
    }

    #[test]
    fn delivery_path_targets_are_skipped() {
        let store = watched_store();
        capture(&store, || {
            tracing::warn!(target: concat!(env!("CARGO_CRATE_NAME"), "::registry"), "send failed");
            tracing::info!(target: concat!(env!("CARGO_CRATE_NAME"), "::log_store"), "stored");
            tracing::info!("kept");
        });
        let records = store.recent_entries(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get_str("event"), Some("kept"));
    }

    #[test]
    fn capture_guard_blocks_reentry() {
        let outer = CaptureGuard::enter();
        assert!(outer.is_some());
        assert!(CaptureGuard::enter().is_none());
        drop(outer);
        assert!(CaptureGuard::enter().is_some());
    }
}
