//! Configuration types for the operational safeguards.
//!
//! Every safeguard knob lives in [`SafeguardConfig`], built via its
//! [`SafeguardConfigBuilder`]. The builder is the only place values are
//! range-checked: once a `SafeguardConfig` exists, the lag monitor, log store
//! and broadcaster assume their parameters are sane and never re-validate.
//!
//! The per-component sections ([`ThrottleConfig`], [`LogStoreConfig`],
//! [`LagMonitorConfig`]) are plain data and can be constructed directly, which
//! is what unit tests do when they need out-of-band values such as a
//! one-second max age.

use crate::error::SafeguardError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;

/// Complete configuration for the safeguards subsystem.
///
/// # Example
/// ```rust
/// use pdf2md_safeguards::SafeguardConfig;
///
/// let config = SafeguardConfig::builder()
///     .batch_interval_secs(1.0)
///     .max_batch_size(50)
///     .max_lag_ms(60.0)
///     .build()
///     .unwrap();
/// assert_eq!(config.throttle.max_batch_size, 50);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SafeguardConfig {
    /// HTTP listener settings.
    pub server: ServerConfig,
    /// Message batching and circuit breaker.
    pub throttle: ThrottleConfig,
    /// Retained log history bounds.
    pub log_store: LogStoreConfig,
    /// Scheduler lag detection.
    pub lag_monitor: LagMonitorConfig,
    /// Independent on/off switches for each safeguard.
    pub flags: FeatureFlags,
}

impl SafeguardConfig {
    /// Create a new builder for `SafeguardConfig`.
    pub fn builder() -> SafeguardConfigBuilder {
        SafeguardConfigBuilder {
            config: Self::default(),
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind. Default: `127.0.0.1`.
    pub host: String,
    /// TCP port. Default: 8000.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Batching and circuit-breaker parameters for the throttled broadcaster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Seconds between timer-driven flushes. Range: 0.1–5.0. Default: 0.5.
    pub batch_interval_secs: f64,

    /// Pending messages that force an immediate flush. Range: 10–500. Default: 100.
    pub max_batch_size: usize,

    /// Messages per second above which the breaker trips. Range: 10–200. Default: 50.
    pub circuit_breaker_threshold: f64,

    /// Upper bound on the rate denominator, in seconds. Range: 5–60. Default: 10.
    pub circuit_breaker_window_secs: f64,

    /// Seconds without a flush before a tripped breaker resets. Range: 10–300. Default: 30.
    pub circuit_breaker_recovery_secs: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            batch_interval_secs: 0.5,
            max_batch_size: 100,
            circuit_breaker_threshold: 50.0,
            circuit_breaker_window_secs: 10.0,
            circuit_breaker_recovery_secs: 30.0,
        }
    }
}

impl ThrottleConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs_f64(self.batch_interval_secs)
    }

    pub fn circuit_breaker_window(&self) -> Duration {
        Duration::from_secs_f64(self.circuit_breaker_window_secs)
    }

    pub fn circuit_breaker_recovery(&self) -> Duration {
        Duration::from_secs_f64(self.circuit_breaker_recovery_secs)
    }
}

/// Retention bounds for the log store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogStoreConfig {
    /// Maximum retained records. Range: 100–5000. Default: 1000.
    pub max_entries: usize,

    /// Maximum record age in seconds. Range: 300–86400. Default: 3600.
    pub max_age_secs: u64,

    /// Seconds between age-based cleanup passes. Range: 60–1800. Default: 300.
    ///
    /// Records may outlive `max_age_secs` by up to this long; the count bound
    /// is enforced on every insert regardless.
    pub cleanup_interval_secs: u64,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_age_secs: 3600,
            cleanup_interval_secs: 300,
        }
    }
}

impl LogStoreConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Scheduler lag detection thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagMonitorConfig {
    /// Lag above which a check counts as a breach. Range: 10–200 ms. Default: 40.
    pub max_lag_ms: f64,

    /// Seconds between checks. Range: 0.5–10. Default: 1.0.
    pub check_interval_secs: f64,

    /// `max_lag_ms × severity_multiplier` is the severe threshold. Range: 2–10. Default: 3.
    pub severity_multiplier: f64,

    /// Severe breaches that escalate to emergency. Range: 1–20. Default: 5.
    pub max_severe_lag_count: u32,
}

impl Default for LagMonitorConfig {
    fn default() -> Self {
        Self {
            max_lag_ms: 40.0,
            check_interval_secs: 1.0,
            severity_multiplier: 3.0,
            max_severe_lag_count: 5,
        }
    }
}

impl LagMonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_secs)
    }

    /// Lag in milliseconds that counts as severe.
    pub fn severe_lag_threshold_ms(&self) -> f64 {
        self.max_lag_ms * self.severity_multiplier
    }
}

/// Independent switches for each safeguard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Route broadcasts through the batching broadcaster. Default: true.
    pub message_throttling: bool,
    /// Run the periodic age-based cleanup of the log store. Default: true.
    pub memory_management: bool,
    /// Run the lag monitor and wire it to the broadcaster. Default: true.
    pub performance_monitoring: bool,
    /// Expose `GET /status/safeguards`. Default: true.
    pub status_endpoint: bool,
    /// Feed tracing events into the log store. Default: true.
    pub log_capture: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            message_throttling: true,
            memory_management: true,
            performance_monitoring: true,
            status_endpoint: true,
            log_capture: true,
        }
    }
}

/// Builder for [`SafeguardConfig`].
#[derive(Debug)]
pub struct SafeguardConfigBuilder {
    config: SafeguardConfig,
}

impl SafeguardConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.server.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    pub fn batch_interval_secs(mut self, secs: f64) -> Self {
        self.config.throttle.batch_interval_secs = secs;
        self
    }

    pub fn max_batch_size(mut self, n: usize) -> Self {
        self.config.throttle.max_batch_size = n;
        self
    }

    pub fn circuit_breaker_threshold(mut self, msgs_per_sec: f64) -> Self {
        self.config.throttle.circuit_breaker_threshold = msgs_per_sec;
        self
    }

    pub fn circuit_breaker_window_secs(mut self, secs: f64) -> Self {
        self.config.throttle.circuit_breaker_window_secs = secs;
        self
    }

    pub fn circuit_breaker_recovery_secs(mut self, secs: f64) -> Self {
        self.config.throttle.circuit_breaker_recovery_secs = secs;
        self
    }

    pub fn max_log_entries(mut self, n: usize) -> Self {
        self.config.log_store.max_entries = n;
        self
    }

    pub fn max_log_age_secs(mut self, secs: u64) -> Self {
        self.config.log_store.max_age_secs = secs;
        self
    }

    pub fn cleanup_interval_secs(mut self, secs: u64) -> Self {
        self.config.log_store.cleanup_interval_secs = secs;
        self
    }

    pub fn max_lag_ms(mut self, ms: f64) -> Self {
        self.config.lag_monitor.max_lag_ms = ms;
        self
    }

    pub fn check_interval_secs(mut self, secs: f64) -> Self {
        self.config.lag_monitor.check_interval_secs = secs;
        self
    }

    pub fn severity_multiplier(mut self, m: f64) -> Self {
        self.config.lag_monitor.severity_multiplier = m;
        self
    }

    pub fn max_severe_lag_count(mut self, n: u32) -> Self {
        self.config.lag_monitor.max_severe_lag_count = n;
        self
    }

    pub fn message_throttling(mut self, v: bool) -> Self {
        self.config.flags.message_throttling = v;
        self
    }

    pub fn memory_management(mut self, v: bool) -> Self {
        self.config.flags.memory_management = v;
        self
    }

    pub fn performance_monitoring(mut self, v: bool) -> Self {
        self.config.flags.performance_monitoring = v;
        self
    }

    pub fn status_endpoint(mut self, v: bool) -> Self {
        self.config.flags.status_endpoint = v;
        self
    }

    pub fn log_capture(mut self, v: bool) -> Self {
        self.config.flags.log_capture = v;
        self
    }

    /// Build the configuration, validating every range.
    pub fn build(self) -> Result<SafeguardConfig, SafeguardError> {
        let c = &self.config;

        if c.server.host.trim().is_empty() {
            return Err(SafeguardError::InvalidConfig(
                "server host must not be empty".into(),
            ));
        }

        let t = &c.throttle;
        check_range("batch interval (s)", t.batch_interval_secs, 0.1, 5.0)?;
        check_range("max batch size", t.max_batch_size, 10, 500)?;
        check_range(
            "circuit breaker threshold (msg/s)",
            t.circuit_breaker_threshold,
            10.0,
            200.0,
        )?;
        check_range(
            "circuit breaker window (s)",
            t.circuit_breaker_window_secs,
            5.0,
            60.0,
        )?;
        check_range(
            "circuit breaker recovery (s)",
            t.circuit_breaker_recovery_secs,
            10.0,
            300.0,
        )?;

        let s = &c.log_store;
        check_range("max log entries", s.max_entries, 100, 5000)?;
        check_range("max log age (s)", s.max_age_secs, 300, 86_400)?;
        check_range("cleanup interval (s)", s.cleanup_interval_secs, 60, 1800)?;

        let l = &c.lag_monitor;
        check_range("max lag (ms)", l.max_lag_ms, 10.0, 200.0)?;
        check_range("lag check interval (s)", l.check_interval_secs, 0.5, 10.0)?;
        check_range("severity multiplier", l.severity_multiplier, 2.0, 10.0)?;
        check_range("max severe lag count", l.max_severe_lag_count, 1, 20)?;

        Ok(self.config)
    }
}

/// Reject `value` unless `min ≤ value ≤ max`. NaN is always rejected.
fn check_range<T>(name: &str, value: T, min: T, max: T) -> Result<(), SafeguardError>
where
    T: PartialOrd + Display + Copy,
{
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(SafeguardError::InvalidConfig(format!(
            "{name} must be {min}–{max}, got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = SafeguardConfig::builder().build().unwrap();
        assert_eq!(config, SafeguardConfig::default());
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = SafeguardConfig::default();
        assert_eq!(c.throttle.batch_interval_secs, 0.5);
        assert_eq!(c.throttle.max_batch_size, 100);
        assert_eq!(c.throttle.circuit_breaker_threshold, 50.0);
        assert_eq!(c.log_store.max_entries, 1000);
        assert_eq!(c.log_store.max_age_secs, 3600);
        assert_eq!(c.log_store.cleanup_interval_secs, 300);
        assert_eq!(c.lag_monitor.max_lag_ms, 40.0);
        assert_eq!(c.lag_monitor.max_severe_lag_count, 5);
        assert!(c.flags.message_throttling);
        assert!(c.flags.memory_management);
        assert!(c.flags.performance_monitoring);
        assert!(c.flags.status_endpoint);
    }

    #[test]
    fn severe_threshold_is_multiplied() {
        let l = LagMonitorConfig {
            max_lag_ms: 40.0,
            severity_multiplier: 3.0,
            ..Default::default()
        };
        assert_eq!(l.severe_lag_threshold_ms(), 120.0);
    }

    #[test]
    fn rejects_out_of_range_batch_interval() {
        let err = SafeguardConfig::builder()
            .batch_interval_secs(0.0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("batch interval"), "got: {err}");
    }

    #[test]
    fn rejects_nan_lag_threshold() {
        let err = SafeguardConfig::builder()
            .max_lag_ms(f64::NAN)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max lag"), "got: {err}");
    }

    #[test]
    fn rejects_tiny_log_store() {
        assert!(SafeguardConfig::builder().max_log_entries(5).build().is_err());
        assert!(SafeguardConfig::builder().cleanup_interval_secs(10).build().is_err());
    }

    #[test]
    fn rejects_empty_host() {
        assert!(SafeguardConfig::builder().host("  ").build().is_err());
    }

    #[test]
    fn builder_sets_flags() {
        let c = SafeguardConfig::builder()
            .message_throttling(false)
            .performance_monitoring(false)
            .build()
            .unwrap();
        assert!(!c.flags.message_throttling);
        assert!(!c.flags.performance_monitoring);
        assert!(c.flags.memory_management);
    }

    #[test]
    fn durations_convert() {
        let t = ThrottleConfig::default();
        assert_eq!(t.batch_interval(), Duration::from_millis(500));
        assert_eq!(LogStoreConfig::default().max_age(), Duration::from_secs(3600));
    }

    #[test]
    fn server_addr() {
        assert_eq!(ServerConfig::default().addr(), "127.0.0.1:8000");
    }
}
