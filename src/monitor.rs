//! Scheduler lag detection and degradation signalling.
//!
//! The [`LagMonitor`] wakes every `check_interval` and measures how late the
//! wake-up was. Late wake-ups mean the runtime is saturated; the monitor then
//! tells every registered [`DegradationObserver`] to shed load, and tells them
//! again once the runtime has calmed down.
//!
//! ```text
//!             lag > max                    severe count ≥ limit
//!   Normal ──────────────▶ StandardDegraded ─────────────────▶ EmergencyDegraded
//!     ▲                          │                                    │
//!     └──── lag < max / 2 ◀──────┴────────────────────────────────────┘
//! ```
//!
//! Observers are called in registration order. A failing or panicking
//! observer is logged and skipped; it never stops the ones after it, nor the
//! monitoring loop.

use crate::config::LagMonitorConfig;
use crate::error::ObserverError;
use crate::ring::BoundedRing;
use crate::task::{run_guarded, TaskSlot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Number of lag samples retained.
const MAX_MEASUREMENTS: usize = 100;
/// Samples summarised by [`LagStats::recent_stats`].
const RECENT_WINDOW: usize = 20;
/// Samples averaged by [`LagMonitor::is_healthy`].
const HEALTH_WINDOW: usize = 5;

/// Severity of a degradation event handed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    Standard,
    Emergency,
    Recovery,
}

impl DegradationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            DegradationLevel::Standard => "standard",
            DegradationLevel::Emergency => "emergency",
            DegradationLevel::Recovery => "recovery",
        }
    }
}

/// Where the monitor currently sits in the degradation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DegradationState {
    #[default]
    Normal,
    StandardDegraded,
    EmergencyDegraded,
}

/// Receiver of degradation events.
///
/// Implemented by the stream manager to retune its broadcaster, and by test
/// doubles. Returning `Err` only produces a log line.
#[async_trait]
pub trait DegradationObserver: Send + Sync {
    async fn on_degradation_event(
        &self,
        level: DegradationLevel,
        lag_ms: f64,
    ) -> Result<(), ObserverError>;
}

/// Handle returned by [`LagMonitor::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// One lag sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LagMeasurement {
    pub timestamp: DateTime<Utc>,
    pub lag_ms: f64,
    /// The configured check interval, in seconds.
    pub expected_interval: f64,
}

/// Whether any samples have been taken yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    NoMeasurements,
    Active,
}

/// Summary of the most recent samples, rounded to two decimals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentLagStats {
    pub avg_lag_ms: f64,
    pub max_lag_ms: f64,
    pub min_lag_ms: f64,
    pub p95_lag_ms: f64,
    pub measurements: usize,
}

/// Snapshot returned by [`LagMonitor::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LagStats {
    pub status: MonitorStatus,
    pub monitoring_active: bool,
    pub degradation_active: bool,
    pub degradation_state: DegradationState,
    pub severe_lag_count: u32,
    pub max_lag_threshold_ms: f64,
    pub severe_lag_threshold_ms: f64,
    pub measurements_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_stats: Option<RecentLagStats>,
    pub observer_count: usize,
}

struct MonitorState {
    measurements: BoundedRing<LagMeasurement>,
    last_check: Instant,
    severe_lag_count: u32,
    degradation: DegradationState,
}

/// What a single measurement asks the monitor to do once the lock is released.
#[derive(Clone, Copy)]
enum Step {
    Clean,
    Breach,
    Severe { count: u32 },
    Emergency { count: u32 },
    Recover,
}

pub struct LagMonitor {
    config: LagMonitorConfig,
    state: Mutex<MonitorState>,
    observers: Mutex<Vec<(ObserverId, Arc<dyn DegradationObserver>)>>,
    next_observer: AtomicU64,
    task: TaskSlot,
}

impl LagMonitor {
    pub fn new(config: LagMonitorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState {
                measurements: BoundedRing::new(MAX_MEASUREMENTS),
                last_check: Instant::now(),
                severe_lag_count: 0,
                degradation: DegradationState::Normal,
            }),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(0),
            task: TaskSlot::new("lag_monitor"),
        }
    }

    pub fn config(&self) -> &LagMonitorConfig {
        &self.config
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Spawn the periodic check loop. Calling `start` on a running monitor
    /// does nothing and returns `false`.
    ///
    /// The loop only holds a weak reference, so dropping the last `Arc`
    /// ends it at the next tick.
    pub fn start(self: &Arc<Self>) -> bool {
        let weak = Arc::downgrade(self);
        let interval = self.config.check_interval();
        let started = self.task.start(|mut shutdown| {
            self.state.lock().last_check = Instant::now();
            async move {
                loop {
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    let Some(monitor) = Weak::upgrade(&weak) else {
                        break;
                    };
                    run_guarded("lag_monitor", monitor.check()).await;
                }
            }
        });
        if started {
            info!(
                check_interval_secs = self.config.check_interval_secs,
                max_lag_ms = self.config.max_lag_ms,
                "Lag monitor started"
            );
        }
        started
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(&self) -> bool {
        let stopped = self.task.stop().await;
        if stopped {
            info!("Lag monitor stopped");
        }
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// One tick: measure drift since the previous tick and process it.
    async fn check(&self) {
        let now = Instant::now();
        let last_check = self.state.lock().last_check;
        let elapsed_ms = now.saturating_duration_since(last_check).as_secs_f64() * 1000.0;
        let lag_ms = elapsed_ms - self.config.check_interval_secs * 1000.0;

        self.record_lag(lag_ms).await;

        self.state.lock().last_check = now;
    }

    // ── Observers ─────────────────────────────────────────────────────────

    pub fn add_observer(&self, observer: Arc<dyn DegradationObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, observer));
        debug!("Added degradation observer");
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let removed = {
            let mut observers = self.observers.lock();
            let before = observers.len();
            observers.retain(|(oid, _)| *oid != id);
            observers.len() != before
        };
        if removed {
            debug!("Removed degradation observer");
        }
        removed
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    async fn notify(&self, level: DegradationLevel, lag_ms: f64) {
        let observers: Vec<_> = self
            .observers
            .lock()
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();

        for observer in observers {
            let call = AssertUnwindSafe(observer.on_degradation_event(level, lag_ms));
            match call.catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(level = level.as_str(), error = %e, "Degradation observer failed")
                }
                Err(_) => error!(level = level.as_str(), "Degradation observer panicked"),
            }
        }
    }

    // ── Measurements ──────────────────────────────────────────────────────

    /// Process one lag measurement exactly as the check loop would.
    pub async fn record_lag(&self, lag_ms: f64) {
        let max_lag = self.config.max_lag_ms;
        let severe_threshold = self.config.severe_lag_threshold_ms();

        let step = {
            let mut s = self.state.lock();
            s.measurements.push(LagMeasurement {
                timestamp: Utc::now(),
                lag_ms,
                expected_interval: self.config.check_interval_secs,
            });

            if lag_ms > max_lag {
                if lag_ms > severe_threshold {
                    s.severe_lag_count += 1;
                    if s.severe_lag_count >= self.config.max_severe_lag_count {
                        Step::Emergency {
                            count: s.severe_lag_count,
                        }
                    } else {
                        Step::Severe {
                            count: s.severe_lag_count,
                        }
                    }
                } else {
                    Step::Breach
                }
            } else {
                s.severe_lag_count = s.severe_lag_count.saturating_sub(1);
                if s.degradation != DegradationState::Normal && lag_ms < max_lag / 2.0 {
                    Step::Recover
                } else {
                    Step::Clean
                }
            }
        };

        if !matches!(step, Step::Clean | Step::Recover) {
            warn!(
                lag_ms = round2(lag_ms),
                threshold_ms = max_lag,
                "Scheduler lag detected"
            );
        }

        match step {
            Step::Clean => {}
            Step::Breach => self.trigger_degradation(lag_ms).await,
            Step::Severe { count } | Step::Emergency { count } => {
                error!(
                    lag_ms = round2(lag_ms),
                    severe_lag_count = count,
                    threshold_ms = severe_threshold,
                    "Severe scheduler lag detected"
                );
                if matches!(step, Step::Emergency { .. }) {
                    self.trigger_emergency(lag_ms).await;
                }
            }
            Step::Recover => self.recover_from_degradation().await,
        }
    }

    /// Enter standard degradation. Observers are only told on the transition
    /// out of `Normal`.
    pub async fn trigger_degradation(&self, lag_ms: f64) {
        let entered = {
            let mut s = self.state.lock();
            if s.degradation == DegradationState::Normal {
                s.degradation = DegradationState::StandardDegraded;
                true
            } else {
                false
            }
        };
        if !entered {
            return;
        }
        warn!(
            lag_ms = round2(lag_ms),
            degradation_level = "standard",
            "Triggering performance degradation"
        );
        self.notify(DegradationLevel::Standard, lag_ms).await;
    }

    /// Escalate to emergency degradation, then reset the severe counter.
    ///
    /// Fires on every call; the counter reset is what keeps the check loop
    /// from re-escalating on the next severe sample.
    pub async fn trigger_emergency(&self, lag_ms: f64) {
        let count = {
            let mut s = self.state.lock();
            s.degradation = DegradationState::EmergencyDegraded;
            s.severe_lag_count
        };
        error!(
            lag_ms = round2(lag_ms),
            severe_lag_count = count,
            degradation_level = "emergency",
            "Triggering emergency performance degradation"
        );
        self.notify(DegradationLevel::Emergency, lag_ms).await;
        self.state.lock().severe_lag_count = 0;
    }

    /// Leave any degraded state. No-op when already normal.
    pub async fn recover_from_degradation(&self) {
        let left = {
            let mut s = self.state.lock();
            let was = s.degradation;
            s.degradation = DegradationState::Normal;
            was != DegradationState::Normal
        };
        if !left {
            return;
        }
        info!("Recovering from performance degradation");
        self.notify(DegradationLevel::Recovery, 0.0).await;
    }

    // ── Introspection ─────────────────────────────────────────────────────

    pub fn degradation_state(&self) -> DegradationState {
        self.state.lock().degradation
    }

    pub fn degradation_active(&self) -> bool {
        self.degradation_state() != DegradationState::Normal
    }

    pub fn severe_lag_count(&self) -> u32 {
        self.state.lock().severe_lag_count
    }

    #[cfg(test)]
    pub(crate) fn set_severe_lag_count(&self, count: u32) {
        self.state.lock().severe_lag_count = count;
    }

    /// Healthy when nothing has been measured yet, or the last few samples
    /// average within bounds and nothing is degraded.
    pub fn is_healthy(&self) -> bool {
        let s = self.state.lock();
        if s.measurements.is_empty() {
            return true;
        }
        let recent: Vec<f64> = s
            .measurements
            .newest_n(HEALTH_WINDOW)
            .map(|m| m.lag_ms)
            .collect();
        let avg = recent.iter().sum::<f64>() / recent.len() as f64;
        avg <= self.config.max_lag_ms
            && s.degradation == DegradationState::Normal
            && s.severe_lag_count == 0
    }

    pub fn stats(&self) -> LagStats {
        let monitoring_active = self.is_running();
        let observer_count = self.observer_count();
        let s = self.state.lock();

        let recent: Vec<f64> = s
            .measurements
            .newest_n(RECENT_WINDOW)
            .map(|m| m.lag_ms)
            .collect();

        LagStats {
            status: if s.measurements.is_empty() {
                MonitorStatus::NoMeasurements
            } else {
                MonitorStatus::Active
            },
            monitoring_active,
            degradation_active: s.degradation != DegradationState::Normal,
            degradation_state: s.degradation,
            severe_lag_count: s.severe_lag_count,
            max_lag_threshold_ms: self.config.max_lag_ms,
            severe_lag_threshold_ms: self.config.severe_lag_threshold_ms(),
            measurements_count: s.measurements.len(),
            recent_stats: summarize(&recent),
            observer_count,
        }
    }

    /// Copies of the retained samples, oldest first.
    pub fn measurements(&self) -> Vec<LagMeasurement> {
        self.state.lock().measurements.iter().cloned().collect()
    }
}

impl Default for LagMonitor {
    fn default() -> Self {
        Self::new(LagMonitorConfig::default())
    }
}

fn summarize(lags: &[f64]) -> Option<RecentLagStats> {
    if lags.is_empty() {
        return None;
    }
    let mut sorted = lags.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let min = sorted[0];
    let max = sorted[n - 1];
    let avg = sorted.iter().sum::<f64>() / n as f64;
    let p95 = sorted.get((n as f64 * 0.95) as usize).copied().unwrap_or(max);

    Some(RecentLagStats {
        avg_lag_ms: round2(avg),
        max_lag_ms: round2(max),
        min_lag_ms: round2(min),
        p95_lag_ms: round2(p95),
        measurements: n,
    })
}

pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
