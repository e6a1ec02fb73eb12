//! Bounded, de-duplicated log history with live fan-out to subscribers.
//!
//! Records enter through [`LogStore::add_entry`] wrapped in a
//! [`LogSubmission`]. The store keeps at most `max_entries` of them (oldest
//! evicted first) and a periodic cleanup pass trims records older than
//! `max_age`. When nobody is subscribed, ordinary submissions are dropped
//! outright.
//!
//! Accepted records are pushed to subscribers on a spawned task, so the
//! producer never waits on a socket. If a [`LogForwarder`] is installed the
//! record is handed to it once instead (the stream manager uses this to route
//! records through the throttled broadcaster).

use crate::config::LogStoreConfig;
use crate::monitor::round2;
use crate::protocol::{now_timestamp, LogRecord, StreamMessage};
use crate::registry::{deliver_to, Session, SessionId};
use crate::ring::BoundedRing;
use crate::task::{run_guarded, TaskSlot};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Dedup keys retained before the cache is compacted.
const DEDUP_CAPACITY: usize = 100;
/// Dedup keys kept after compaction.
const DEDUP_RETAIN: usize = 50;
/// Memory samples retained for trend calculation.
const MAX_MEMORY_SAMPLES: usize = 100;

/// Whether a record may be stored when no subscriber is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorePolicy {
    /// Drop the record unless at least one subscriber exists.
    #[default]
    SubscribersOnly,
    /// Store the record regardless of subscribers.
    AlwaysStore,
}

/// A record offered to the store together with its storage policy.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSubmission {
    pub record: LogRecord,
    pub policy: StorePolicy,
}

impl LogSubmission {
    pub fn new(record: LogRecord) -> Self {
        Self {
            record,
            policy: StorePolicy::SubscribersOnly,
        }
    }

    /// A submission that is stored even with nobody listening.
    pub fn always(record: LogRecord) -> Self {
        Self {
            record,
            policy: StorePolicy::AlwaysStore,
        }
    }
}

impl From<LogRecord> for LogSubmission {
    fn from(record: LogRecord) -> Self {
        Self::new(record)
    }
}

/// What happened to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Stored,
    /// Suppressed because nobody is subscribed. Not an error.
    NoSubscribers,
    /// Same `(event, timestamp, request_id, level)` seen recently.
    Duplicate,
}

/// Receiver for accepted records that replaces direct per-subscriber sends.
#[async_trait]
pub trait LogForwarder: Send + Sync {
    async fn forward(&self, record: LogRecord);
}

/// Snapshot returned by [`LogStore::memory_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub entries_count: usize,
    pub max_entries: usize,
    pub max_age_seconds: u64,
    pub session_age_seconds: f64,
    pub time_since_cleanup_seconds: f64,
    pub subscriber_count: usize,
    pub dedup_cache_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_memory_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_trend_mb_per_minute: Option<f64>,
}

// ── Internals ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct DedupCache {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
}

impl DedupCache {
    /// Record `key`; `false` if it was already present.
    fn insert(&mut self, key: u64) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > DEDUP_CAPACITY {
            while self.order.len() > DEDUP_RETAIN {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

fn dedup_key(record: &LogRecord) -> u64 {
    let mut hasher = DefaultHasher::new();
    for field in ["event", "timestamp", "request_id", "level"] {
        record.field_text(field).hash(&mut hasher);
    }
    hasher.finish()
}

#[derive(Debug, Clone, Copy)]
struct MemorySample {
    at: Instant,
    memory_mb: f64,
}

struct StoreState {
    entries: BoundedRing<LogRecord>,
    subscribers: Vec<Session>,
    dedup: DedupCache,
    memory_samples: BoundedRing<MemorySample>,
    last_cleanup: Instant,
}

// ── Store ────────────────────────────────────────────────────────────────

pub struct LogStore {
    config: LogStoreConfig,
    created_at: Instant,
    state: Mutex<StoreState>,
    forwarder: Mutex<Option<Arc<dyn LogForwarder>>>,
    cleanup_task: TaskSlot,
}

impl LogStore {
    pub fn new(config: LogStoreConfig) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(StoreState {
                entries: BoundedRing::new(config.max_entries),
                subscribers: Vec::new(),
                dedup: DedupCache::default(),
                memory_samples: BoundedRing::new(MAX_MEMORY_SAMPLES),
                last_cleanup: now,
            }),
            config,
            created_at: now,
            forwarder: Mutex::new(None),
            cleanup_task: TaskSlot::new("log_cleanup"),
        }
    }

    pub fn config(&self) -> &LogStoreConfig {
        &self.config
    }

    /// Offer a record to the store.
    ///
    /// Never blocks on subscribers: delivery happens on a spawned task, and
    /// only when a Tokio runtime is available on the calling thread.
    pub fn add_entry(self: &Arc<Self>, submission: impl Into<LogSubmission>) -> EntryOutcome {
        let LogSubmission { mut record, policy } = submission.into();

        let subscribers = {
            let mut s = self.state.lock();
            if policy == StorePolicy::SubscribersOnly && s.subscribers.is_empty() {
                return EntryOutcome::NoSubscribers;
            }
            if !s.dedup.insert(dedup_key(&record)) {
                return EntryOutcome::Duplicate;
            }

            if !record.contains_key("timestamp") {
                record.insert("timestamp", now_timestamp());
            }
            if !record.contains_key("level") {
                record.insert("level", "info");
            }
            record.insert(
                "session_age",
                round2(self.created_at.elapsed().as_secs_f64()),
            );
            record.retain(|key, _| !key.starts_with('_'));

            s.entries.push(record.clone());
            s.subscribers.clone()
        };

        if !subscribers.is_empty() {
            self.spawn_fan_out(record, subscribers);
        }
        EntryOutcome::Stored
    }

    fn spawn_fan_out(self: &Arc<Self>, record: LogRecord, subscribers: Vec<Session>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let forwarder = self.forwarder.lock().clone();
        let store = Arc::downgrade(self);

        handle.spawn(async move {
            if let Some(forwarder) = forwarder {
                forwarder.forward(record).await;
                return;
            }
            let message = StreamMessage::LogEntry { log: record };
            let report = deliver_to(&subscribers, &message).await;
            if let Some(store) = Weak::upgrade(&store) {
                for id in &report.failed {
                    store.remove_subscriber(id);
                }
            }
        });
    }

    /// The newest `limit` records, oldest first.
    pub fn recent_entries(&self, limit: usize) -> Vec<LogRecord> {
        self.state.lock().entries.newest_n(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    // ── Subscribers ───────────────────────────────────────────────────────

    /// Add a subscriber. A subscriber with the same id is replaced.
    pub fn add_subscriber(&self, session: Session) {
        let count = {
            let mut s = self.state.lock();
            match s.subscribers.iter().position(|x| x.id() == session.id()) {
                Some(idx) => s.subscribers[idx] = session,
                None => s.subscribers.push(session),
            }
            s.subscribers.len()
        };
        debug!(subscribers = count, "Log subscriber added");
    }

    pub fn remove_subscriber(&self, id: &SessionId) -> bool {
        let (removed, count) = {
            let mut s = self.state.lock();
            let before = s.subscribers.len();
            s.subscribers.retain(|x| x.id() != id);
            (s.subscribers.len() != before, s.subscribers.len())
        };
        if removed {
            debug!(session_id = %id, subscribers = count, "Log subscriber removed");
        }
        removed
    }

    pub fn has_subscribers(&self) -> bool {
        !self.state.lock().subscribers.is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn set_forwarder(&self, forwarder: Arc<dyn LogForwarder>) {
        *self.forwarder.lock() = Some(forwarder);
    }

    pub fn clear_forwarder(&self) {
        *self.forwarder.lock() = None;
    }

    // ── Cleanup ───────────────────────────────────────────────────────────

    /// Spawn the periodic age-based cleanup loop. Returns `false` if it was
    /// already running.
    pub fn start_cleanup(self: &Arc<Self>) -> bool {
        let weak = Arc::downgrade(self);
        let interval = self.config.cleanup_interval();
        let started = self.cleanup_task.start(|mut shutdown| async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(store) = Weak::upgrade(&weak) else {
                    break;
                };
                run_guarded("log_cleanup", async {
                    store.perform_cleanup();
                })
                .await;
            }
        });
        if started {
            info!(
                max_entries = self.config.max_entries,
                max_age_secs = self.config.max_age_secs,
                cleanup_interval_secs = self.config.cleanup_interval_secs,
                "Log cleanup started"
            );
        }
        started
    }

    pub async fn stop_cleanup(&self) -> bool {
        let stopped = self.cleanup_task.stop().await;
        if stopped {
            info!("Log cleanup stopped");
        }
        stopped
    }

    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup_task.is_running()
    }

    /// One cleanup pass. Returns the number of records removed.
    ///
    /// Trims from the oldest end and stops at the first record still inside
    /// the age window; records with a missing or unparsable timestamp count
    /// as expired.
    pub fn perform_cleanup(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.max_age_secs as i64);
        let memory_mb = process_memory_mb();

        let (removed, remaining) = {
            let mut s = self.state.lock();
            let mut removed = 0;
            while let Some(oldest) = s.entries.oldest() {
                let expired = oldest
                    .timestamp()
                    .is_none_or(|ts| ts.with_timezone(&Utc) < cutoff);
                if !expired {
                    break;
                }
                s.entries.pop_oldest();
                removed += 1;
            }
            let now = Instant::now();
            s.last_cleanup = now;
            if let Some(memory_mb) = memory_mb {
                s.memory_samples.push(MemorySample { at: now, memory_mb });
            }
            (removed, s.entries.len())
        };

        if removed > 0 {
            info!(removed, remaining, "Removed expired log entries");
        } else {
            trace!(remaining, "Log cleanup found nothing to remove");
        }
        removed
    }

    /// Run a cleanup pass now and report the resulting statistics.
    pub fn cleanup_now(&self) -> MemoryStats {
        self.perform_cleanup();
        self.memory_stats()
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let s = self.state.lock();
        let (current_memory_mb, memory_trend_mb_per_minute) =
            match (s.memory_samples.oldest(), s.memory_samples.newest()) {
                (Some(first), Some(last)) => {
                    let minutes = last.at.duration_since(first.at).as_secs_f64() / 60.0;
                    let trend = if minutes > 0.0 {
                        (last.memory_mb - first.memory_mb) / minutes
                    } else {
                        0.0
                    };
                    (Some(round2(last.memory_mb)), Some(round2(trend)))
                }
                _ => (None, None),
            };

        MemoryStats {
            entries_count: s.entries.len(),
            max_entries: self.config.max_entries,
            max_age_seconds: self.config.max_age_secs,
            session_age_seconds: round2(self.created_at.elapsed().as_secs_f64()),
            time_since_cleanup_seconds: round2(s.last_cleanup.elapsed().as_secs_f64()),
            subscriber_count: s.subscribers.len(),
            dedup_cache_size: s.dedup.len(),
            current_memory_mb,
            memory_trend_mb_per_minute,
        }
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(LogStoreConfig::default())
    }
}

/// Resident set size of this process in MiB, where the platform exposes it.
#[cfg(target_os = "linux")]
fn process_memory_mb() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let kb = status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse::<u64>().ok())?;
    Some(kb as f64 / 1024.0)
}

#[cfg(not(target_os = "linux"))]
fn process_memory_mb() -> Option<f64> {
    None
}
