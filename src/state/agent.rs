//! Agent state: a node that hosts kernels and is driven by RPC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::ResourceSlot;
use crate::types::AgentId;

/// Agent liveness as observed by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Alive,
    Lost,
    Terminated,
}

/// An agent row.
///
/// Occupancy lives in the resource ledger; this record carries identity,
/// liveness, and reported capacity only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub scaling_group: String,
    pub addr: String,
    pub architecture: String,
    pub status: AgentStatus,
    pub schedulable: bool,
    pub available_slots: ResourceSlot,
    /// When the agent was last seen to go LOST; drives the sweep dwell.
    pub lost_at: Option<DateTime<Utc>>,
}

impl AgentRecord {
    /// Whether the scheduler may place kernels on this agent.
    pub fn is_schedulable(&self) -> bool {
        self.status == AgentStatus::Alive && self.schedulable
    }
}
