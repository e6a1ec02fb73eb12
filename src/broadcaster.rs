//! Batching broadcaster with a coarse circuit breaker.
//!
//! Messages are queued and delivered to the [`BroadcastSink`] as one
//! `batch_update` envelope, either when `batch_interval` has elapsed since
//! the first queued message or as soon as `max_batch_size` messages are
//! pending, whichever comes first.
//!
//! The circuit breaker estimates the inbound rate as
//! `message_count / clamp(time since last flush, 1 s, window)`. Above the
//! threshold every message is dropped until `recovery` has passed without a
//! flush, at which point the counter restarts from zero. This is a load-shedding
//! valve, not an accurate rate meter: bursts that straddle a flush are
//! under-counted.
//!
//! Batching parameters are live: the degradation handler widens
//! `batch_interval` and shrinks `max_batch_size` under load, and
//! [`ThrottledBroadcaster::restore_defaults`] puts the configured values back.

use crate::config::ThrottleConfig;
use crate::monitor::round2;
use crate::protocol::StreamMessage;
use crate::registry::BroadcastSink;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// What [`ThrottledBroadcaster::queue_message`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Pending until the next timer or size-triggered flush.
    Queued,
    /// Queued and flushed immediately because the batch was full.
    Flushed,
    /// Discarded by the open circuit breaker.
    Dropped,
}

/// Snapshot returned by [`ThrottledBroadcaster::stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BroadcasterStats {
    pub pending_messages: usize,
    /// Messages accepted since creation.
    pub total_messages: u64,
    /// Messages counted by the circuit breaker since its last reset.
    pub window_messages: u64,
    pub dropped_messages: u64,
    /// Estimated messages per second, as the circuit breaker sees it.
    pub current_rate: f64,
    pub circuit_breaker_active: bool,
    /// Seconds since the last flush.
    pub time_since_last_flush: f64,
    pub batch_interval_secs: f64,
    pub max_batch_size: usize,
}

struct FlushTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct BroadcastState {
    pending: Vec<StreamMessage>,
    timer: Option<FlushTimer>,
    timer_generation: u64,
    message_count: u64,
    total_messages: u64,
    dropped_messages: u64,
    last_flush: Instant,
    tripped: bool,
    batch_interval: Duration,
    max_batch_size: usize,
}

/// Circuit breaker transitions observed by one `queue_message` call.
enum Breaker {
    Tripped { rate: f64 },
    Recovered,
}

pub struct ThrottledBroadcaster {
    config: ThrottleConfig,
    sink: Arc<dyn BroadcastSink>,
    state: Mutex<BroadcastState>,
}

impl ThrottledBroadcaster {
    pub fn new(config: ThrottleConfig, sink: Arc<dyn BroadcastSink>) -> Self {
        Self {
            state: Mutex::new(BroadcastState {
                pending: Vec::new(),
                timer: None,
                timer_generation: 0,
                message_count: 0,
                total_messages: 0,
                dropped_messages: 0,
                last_flush: Instant::now(),
                tripped: false,
                batch_interval: config.batch_interval(),
                max_batch_size: config.max_batch_size.max(1),
            }),
            config,
            sink,
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Queue `message` for batched delivery.
    ///
    /// Only awaits delivery when this message fills the batch.
    pub async fn queue_message(self: &Arc<Self>, message: StreamMessage) -> QueueOutcome {
        let threshold = self.config.circuit_breaker_threshold;

        let (transition, outcome) = {
            let mut s = self.state.lock();
            let since_flush = s.last_flush.elapsed();
            let mut transition = None;

            if s.tripped {
                if since_flush > self.config.circuit_breaker_recovery() {
                    s.tripped = false;
                    s.message_count = 0;
                    transition = Some(Breaker::Recovered);
                }
            } else {
                let rate = estimate_rate(
                    s.message_count,
                    since_flush,
                    self.config.circuit_breaker_window(),
                );
                if rate > threshold {
                    s.tripped = true;
                    transition = Some(Breaker::Tripped { rate });
                }
            }

            let outcome = if s.tripped {
                s.dropped_messages += 1;
                QueueOutcome::Dropped
            } else {
                s.pending.push(message);
                s.message_count += 1;
                s.total_messages += 1;
                if s.pending.len() >= s.max_batch_size {
                    QueueOutcome::Flushed
                } else {
                    if s.timer.is_none() {
                        self.schedule_timer(&mut s);
                    }
                    QueueOutcome::Queued
                }
            };
            (transition, outcome)
        };

        match transition {
            Some(Breaker::Tripped { rate }) => warn!(
                rate = round2(rate),
                threshold,
                "Broadcast circuit breaker tripped; dropping messages"
            ),
            Some(Breaker::Recovered) => info!("Broadcast circuit breaker reset"),
            None => {}
        }

        match outcome {
            QueueOutcome::Dropped => trace!("Dropped message while circuit breaker is open"),
            QueueOutcome::Flushed => {
                self.flush(None).await;
            }
            QueueOutcome::Queued => {}
        }
        outcome
    }

    fn schedule_timer(self: &Arc<Self>, s: &mut BroadcastState) {
        s.timer_generation += 1;
        let generation = s.timer_generation;
        let delay = s.batch_interval;
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(broadcaster) = weak.upgrade() {
                broadcaster.flush(Some(generation)).await;
            }
        });
        s.timer = Some(FlushTimer { generation, handle });
    }

    /// Deliver everything pending now. Returns the number of messages sent
    /// in the batch (0 when nothing was pending).
    pub async fn flush_batch(&self) -> usize {
        self.flush(None).await
    }

    /// `timer` is the generation of the timer doing the flush, if any. A timer
    /// only clears its own slot and never aborts itself; a stale timer does
    /// nothing.
    async fn flush(&self, timer: Option<u64>) -> usize {
        let batch = {
            let mut s = self.state.lock();
            match timer {
                Some(generation) => {
                    if s.timer.as_ref().map(|t| t.generation) != Some(generation) {
                        return 0;
                    }
                    s.timer = None;
                }
                None => {
                    if let Some(t) = s.timer.take() {
                        t.handle.abort();
                    }
                }
            }
            if s.pending.is_empty() {
                return 0;
            }
            s.last_flush = Instant::now();
            std::mem::take(&mut s.pending)
        };

        let batch_size = batch.len();
        let report = self.sink.deliver(&StreamMessage::batch(batch)).await;
        debug!(
            batch_size,
            delivered = report.delivered,
            failed = report.failed.len(),
            "Flushed broadcast batch"
        );
        batch_size
    }

    // ── Live tuning ───────────────────────────────────────────────────────

    pub fn batch_interval(&self) -> Duration {
        self.state.lock().batch_interval
    }

    /// Takes effect from the next scheduled flush.
    pub fn set_batch_interval(&self, interval: Duration) {
        self.state.lock().batch_interval = interval;
    }

    pub fn max_batch_size(&self) -> usize {
        self.state.lock().max_batch_size
    }

    pub fn set_max_batch_size(&self, size: usize) {
        self.state.lock().max_batch_size = size.max(1);
    }

    /// Put the configured batching parameters back.
    pub fn restore_defaults(&self) {
        let mut s = self.state.lock();
        s.batch_interval = self.config.batch_interval();
        s.max_batch_size = self.config.max_batch_size.max(1);
    }

    pub fn is_circuit_open(&self) -> bool {
        self.state.lock().tripped
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn stats(&self) -> BroadcasterStats {
        let s = self.state.lock();
        let since_flush = s.last_flush.elapsed();
        BroadcasterStats {
            pending_messages: s.pending.len(),
            total_messages: s.total_messages,
            window_messages: s.message_count,
            dropped_messages: s.dropped_messages,
            current_rate: round2(estimate_rate(
                s.message_count,
                since_flush,
                self.config.circuit_breaker_window(),
            )),
            circuit_breaker_active: s.tripped,
            time_since_last_flush: round2(since_flush.as_secs_f64()),
            batch_interval_secs: s.batch_interval.as_secs_f64(),
            max_batch_size: s.max_batch_size,
        }
    }
}

impl Drop for ThrottledBroadcaster {
    fn drop(&mut self) {
        if let Some(t) = self.state.get_mut().timer.take() {
            t.handle.abort();
        }
    }
}

/// Messages per second over `min(elapsed, window)`, with one second standing
/// in for a zero `elapsed`.
fn estimate_rate(count: u64, elapsed: Duration, window: Duration) -> f64 {
    let elapsed = if elapsed.is_zero() {
        1.0
    } else {
        elapsed.as_secs_f64()
    };
    count as f64 / elapsed.min(window.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeliveryReport;
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<StreamMessage>>,
    }

    impl RecordingSink {
        fn batch_sizes(&self) -> Vec<usize> {
            self.batches
                .lock()
                .iter()
                .map(|m| match m {
                    StreamMessage::BatchUpdate { batch_size, .. } => *batch_size,
                    _ => 0,
                })
                .collect()
        }
    }

    #[async_trait]
    impl BroadcastSink for RecordingSink {
        async fn deliver(&self, message: &StreamMessage) -> DeliveryReport {
            self.batches.lock().push(message.clone());
            DeliveryReport {
                delivered: 1,
                failed: Vec::new(),
            }
        }
    }

    fn status(n: u64) -> StreamMessage {
        StreamMessage::StatusUpdate {
            status: json!({ "n": n }),
        }
    }

    fn broadcaster(config: ThrottleConfig) -> (Arc<ThrottledBroadcaster>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let b = Arc::new(ThrottledBroadcaster::new(config, sink.clone()));
        (b, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_once_in_order() {
        let (b, sink) = broadcaster(ThrottleConfig {
            max_batch_size: 3,
            ..Default::default()
        });

        assert_eq!(b.queue_message(status(1)).await, QueueOutcome::Queued);
        assert_eq!(b.queue_message(status(2)).await, QueueOutcome::Queued);
        assert_eq!(b.queue_message(status(3)).await, QueueOutcome::Flushed);

        // The size-triggered flush cancelled the timer.
        tokio::time::sleep(Duration::from_secs(2)).await;

        let batches = sink.batches.lock().clone();
        assert_eq!(batches.len(), 1);
        let StreamMessage::BatchUpdate { messages, .. } = &batches[0] else {
            panic!("expected batch_update, got {:?}", batches[0]);
        };
        assert_eq!(messages, &vec![status(1), status(2), status(3)]);
        assert_eq!(b.stats().pending_messages, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_after_interval() {
        let (b, sink) = broadcaster(ThrottleConfig::default());

        b.queue_message(status(1)).await;
        b.queue_message(status(2)).await;
        assert!(sink.batches.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(sink.batch_sizes(), vec![2]);
        assert_eq!(b.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_flush_cancels_timer() {
        let (b, sink) = broadcaster(ThrottleConfig::default());

        b.queue_message(status(1)).await;
        assert_eq!(b.flush_batch().await, 1);
        b.queue_message(status(2)).await;

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(sink.batch_sizes(), vec![1, 1]);
    }

    #[tokio::test]
    async fn flushing_nothing_is_a_noop() {
        let (b, sink) = broadcaster(ThrottleConfig::default());
        assert_eq!(b.flush_batch().await, 0);
        assert!(sink.batches.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_breaker_trips_and_recovers() {
        let (b, _sink) = broadcaster(ThrottleConfig {
            max_batch_size: 500,
            circuit_breaker_threshold: 10.0,
            ..Default::default()
        });

        for n in 0..11 {
            assert_eq!(b.queue_message(status(n)).await, QueueOutcome::Queued);
        }
        assert_eq!(b.queue_message(status(99)).await, QueueOutcome::Dropped);
        let stats = b.stats();
        assert!(stats.circuit_breaker_active);
        assert_eq!(stats.dropped_messages, 1);
        assert_eq!(stats.total_messages, 11);

        // Still open before the recovery time has passed since the last flush.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(b.queue_message(status(100)).await, QueueOutcome::Dropped);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(b.queue_message(status(101)).await, QueueOutcome::Queued);
        let stats = b.stats();
        assert!(!stats.circuit_breaker_active);
        assert_eq!(stats.window_messages, 1);
        assert_eq!(stats.total_messages, 12);
    }

    #[tokio::test]
    async fn live_parameters_can_be_restored() {
        let (b, _sink) = broadcaster(ThrottleConfig::default());
        b.set_batch_interval(Duration::from_secs(2));
        b.set_max_batch_size(50);
        assert_eq!(b.stats().batch_interval_secs, 2.0);
        assert_eq!(b.max_batch_size(), 50);

        b.restore_defaults();
        assert_eq!(b.batch_interval(), Duration::from_millis(500));
        assert_eq!(b.max_batch_size(), 100);
    }

    #[test]
    fn rate_denominator_is_clamped() {
        let window = Duration::from_secs(10);
        assert_eq!(estimate_rate(20, Duration::ZERO, window), 20.0);
        assert_eq!(estimate_rate(20, Duration::from_millis(500), window), 40.0);
        assert_eq!(estimate_rate(20, Duration::from_secs(4), window), 5.0);
        assert_eq!(estimate_rate(20, Duration::from_secs(100), window), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_uses_time_since_last_flush() {
        let (b, _sink) = broadcaster(ThrottleConfig {
            max_batch_size: 500,
            circuit_breaker_threshold: 10.0,
            ..Default::default()
        });

        for n in 0..6 {
            assert_eq!(b.queue_message(status(n)).await, QueueOutcome::Queued);
        }
        assert_eq!(b.flush_batch().await, 6);

        // Six messages half a second after the flush is 12/s.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(b.queue_message(status(6)).await, QueueOutcome::Dropped);
        assert!(b.stats().circuit_breaker_active);
    }
}
