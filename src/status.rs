//! The safeguards status document served at `GET /status/safeguards`.

use crate::config::FeatureFlags;
use crate::log_store::{LogStore, MemoryStats};
use crate::manager::StreamManager;
use crate::monitor::LagStats;
use serde::Serialize;

/// Per-safeguard state as shown in the status document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Active,
    /// Enabled but its background task is not running.
    Inactive,
    /// Switched off by its feature flag.
    Disabled,
}

impl ComponentStatus {
    fn from_flag(enabled: bool) -> Self {
        if enabled {
            ComponentStatus::Active
        } else {
            ComponentStatus::Disabled
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlagSummary {
    pub message_throttling: bool,
    pub memory_management: bool,
    pub performance_monitoring: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottlingSection {
    pub status: ComponentStatus,
    pub circuit_breaker_active: bool,
    pub current_rate: f64,
    pub pending_messages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySection {
    pub status: ComponentStatus,
    #[serde(flatten)]
    pub stats: MemoryStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringSection {
    pub status: ComponentStatus,
    /// Lag monitor statistics, nested because they carry their own `status`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<LagStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafeguardSections {
    pub message_throttling: ThrottlingSection,
    pub memory_management: MemorySection,
    pub performance_monitoring: MonitoringSection,
}

/// Snapshot of every safeguard, suitable for serving as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafeguardsStatus {
    pub phase_status: &'static str,
    pub version: &'static str,
    pub feature_flags: FlagSummary,
    pub safeguards: SafeguardSections,
    pub overall_health: bool,
    pub active_connections: usize,
}

impl SafeguardsStatus {
    pub fn collect(flags: &FeatureFlags, manager: &StreamManager, store: &LogStore) -> Self {
        let integrated = manager.performance_integrated_stats();
        let ws = &integrated.websocket;

        let monitoring_status = if !flags.performance_monitoring {
            ComponentStatus::Disabled
        } else if integrated
            .event_loop
            .as_ref()
            .is_some_and(|s| s.monitoring_active)
        {
            ComponentStatus::Active
        } else {
            ComponentStatus::Inactive
        };

        SafeguardsStatus {
            phase_status: "active",
            version: env!("CARGO_PKG_VERSION"),
            feature_flags: FlagSummary {
                message_throttling: flags.message_throttling,
                memory_management: flags.memory_management,
                performance_monitoring: flags.performance_monitoring,
            },
            safeguards: SafeguardSections {
                message_throttling: ThrottlingSection {
                    status: ComponentStatus::from_flag(flags.message_throttling),
                    circuit_breaker_active: ws.broadcaster.circuit_breaker_active,
                    current_rate: ws.broadcaster.current_rate,
                    pending_messages: ws.broadcaster.pending_messages,
                },
                memory_management: MemorySection {
                    status: ComponentStatus::from_flag(flags.memory_management),
                    stats: store.memory_stats(),
                },
                performance_monitoring: MonitoringSection {
                    status: monitoring_status,
                    details: integrated.event_loop.clone(),
                },
            },
            overall_health: integrated.integrated_health,
            active_connections: ws.active_connections,
        }
    }
}
