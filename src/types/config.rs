//! Configuration structures.
//!
//! Configuration is loaded from environment variables and config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Scheduling tick configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Lifecycle tick configuration.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Fair-share tick configuration.
    #[serde(default)]
    pub fair_share: FairShareConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Scheduling tick configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between scheduling ticks.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Slot comparison order for agent selection. Agents are compared
    /// slot-by-slot in this device order; the first differing slot decides.
    pub agent_selection_resource_priority: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            agent_selection_resource_priority: ["cuda", "rocm", "tpu", "cpu", "mem"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Lifecycle tick configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Interval between lifecycle ticks (start/terminate/sweep).
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Deadline applied to each agent RPC.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,

    /// Maximum concurrent destroy RPCs per manager.
    pub destroy_concurrency: usize,

    /// How long an agent may stay LOST before the sweep force-terminates the
    /// kernels bound to it and frees their slots.
    #[serde(with = "humantime_serde")]
    pub lost_agent_grace: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            destroy_concurrency: 16,
            lost_agent_grace: Duration::from_secs(300),
        }
    }
}

/// Fair-share tick configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FairShareConfig {
    /// Interval between usage-aggregation ticks.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for FairShareConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Pluggable pending-queue ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionPickerKind {
    #[default]
    Fifo,
    Lifo,
    /// Dominant-resource fairness within each priority bucket.
    Drf,
}

/// Agent placement strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentSelectionStrategy {
    /// Pack onto the fullest agent that still fits.
    #[default]
    Concentrated,
    /// Stateful rotation over the candidate list.
    RoundRobin,
    /// Pick the agent with the largest free capacity.
    Dispersed,
    /// First fitting candidate. Retained for compatibility; deprecated.
    Legacy,
}

/// Per-resource-group scheduling options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceGroupOpts {
    /// Pending-queue ordering for this group.
    #[serde(default)]
    pub session_picker: SessionPickerKind,

    /// Agent placement strategy for this group.
    #[serde(default)]
    pub agent_selection_strategy: AgentSelectionStrategy,

    /// For inference sessions, prefer the agent with the fewest kernels
    /// already serving the same endpoint. Only valid with CONCENTRATED.
    #[serde(default)]
    pub enforce_spreading_endpoint_replica: bool,

    /// Cancel sessions that stay PENDING longer than this.
    #[serde(default, with = "humantime_serde::option")]
    pub pending_timeout: Option<Duration>,
}
