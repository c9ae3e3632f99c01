//! Core types for the scheduling kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (SessionId, KernelId, AgentId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the manager, ticks, and resource groups

mod config;
mod errors;
mod ids;

pub use config::{
    AgentSelectionStrategy, Config, FairShareConfig, LifecycleConfig, ObservabilityConfig,
    ResourceGroupOpts, SchedulerConfig, SessionPickerKind,
};
pub use errors::{Error, Result};
pub use ids::{AccessKey, AgentId, EndpointId, KernelId, SessionId};
