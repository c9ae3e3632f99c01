//! Agent registry: liveness, capacity, and schedulability of known agents.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;

use crate::state::{AgentRecord, AgentStatus};
use crate::types::{AgentId, Error, Result};

/// Registry of agents, keyed by id.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<AgentId, AgentRecord>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an agent row (heartbeat path).
    pub async fn upsert(&self, agent: AgentRecord) {
        self.agents.write().await.insert(agent.id.clone(), agent);
    }

    pub async fn get(&self, agent_id: &AgentId) -> Result<AgentRecord> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("unknown agent: {agent_id}")))
    }

    /// Mark an agent LOST, stamping the dwell clock for the sweep.
    pub async fn mark_lost(&self, agent_id: &AgentId) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::not_found(format!("unknown agent: {agent_id}")))?;
        if agent.status != AgentStatus::Lost {
            info!(agent = %agent_id, "agent lost");
            agent.status = AgentStatus::Lost;
            agent.lost_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Mark an agent ALIVE again. Kernels force-terminated during the outage
    /// stay terminated; only new work lands here.
    pub async fn mark_alive(&self, agent_id: &AgentId) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::not_found(format!("unknown agent: {agent_id}")))?;
        if agent.status != AgentStatus::Alive {
            info!(agent = %agent_id, "agent alive");
            agent.status = AgentStatus::Alive;
            agent.lost_at = None;
        }
        Ok(())
    }

    pub async fn set_schedulable(&self, agent_id: &AgentId, schedulable: bool) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::not_found(format!("unknown agent: {agent_id}")))?;
        agent.schedulable = schedulable;
        Ok(())
    }

    /// Agents eligible to receive kernels for a resource group, optionally
    /// narrowed to one architecture. Ordered by id for deterministic
    /// selection.
    pub async fn schedulable_agents(
        &self,
        scaling_group: &str,
        architecture: Option<&str>,
    ) -> Vec<AgentRecord> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| {
                a.is_schedulable()
                    && a.scaling_group == scaling_group
                    && architecture.map_or(true, |arch| a.architecture == arch)
            })
            .cloned()
            .collect()
    }

    pub async fn lost_agents(&self) -> Vec<AgentRecord> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.status == AgentStatus::Lost)
            .cloned()
            .collect()
    }

    /// Every scaling group with at least one registered agent.
    pub async fn scaling_groups(&self) -> BTreeSet<String> {
        self.agents
            .read()
            .await
            .values()
            .map(|a| a.scaling_group.clone())
            .collect()
    }
}
