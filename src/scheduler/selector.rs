//! Strategy-driven agent placement.
//!
//! A selector is a pure function of the candidate list and the workload; the
//! only mutable state (the round-robin cursor) lives in an injected
//! per-resource-group key-value store so picks survive restarts.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::resource::{ResourceSlot, SlotName};
use crate::state::SessionType;
use crate::types::{AgentId, AgentSelectionStrategy, Error, Result, SessionId};

const ROUNDROBIN_CURSOR_KEY: &str = "roundrobin_cursor";

/// An agent as seen by the selector: registry row plus ledger occupancy.
#[derive(Debug, Clone)]
pub struct AgentCandidate {
    pub id: AgentId,
    pub addr: String,
    pub architecture: String,
    pub available_slots: ResourceSlot,
    pub occupied_slots: ResourceSlot,
}

impl AgentCandidate {
    pub fn free_slots(&self) -> ResourceSlot {
        self.available_slots.clone() - self.occupied_slots.clone()
    }

    /// Whether the remaining capacity covers every requested slot.
    pub fn fits(&self, requested: &ResourceSlot) -> bool {
        requested.eq_contained(&self.free_slots())
    }
}

/// The unit of placement: a whole session (single-node) or one kernel
/// (multi-node).
#[derive(Debug, Clone)]
pub struct SessionWorkload {
    pub session_id: SessionId,
    pub scaling_group: String,
    pub session_type: SessionType,
    pub requested_slots: ResourceSlot,
    /// Live kernel counts per agent for the session's endpoint, when replica
    /// spreading applies.
    pub endpoint_kernel_counts: Option<BTreeMap<AgentId, usize>>,
}

/// Per-resource-group key-value store for selector state.
#[async_trait]
pub trait ResourceGroupStateStore: Send + Sync + fmt::Debug {
    async fn get(&self, scaling_group: &str, key: &str) -> Result<Option<String>>;
    async fn put(&self, scaling_group: &str, key: &str, value: String) -> Result<()>;
}

/// In-memory state store. Loses state on restart, which is acceptable for
/// tests and single-process deployments; production injects a durable one.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entries: RwLock<BTreeMap<(String, String), String>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceGroupStateStore for InMemoryStateStore {
    async fn get(&self, scaling_group: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(scaling_group.to_string(), key.to_string()))
            .cloned())
    }

    async fn put(&self, scaling_group: &str, key: &str, value: String) -> Result<()> {
        self.entries
            .write()
            .await
            .insert((scaling_group.to_string(), key.to_string()), value);
        Ok(())
    }
}

/// Picks one agent for a workload, or `None` when nothing fits.
#[async_trait]
pub trait AgentSelector: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    async fn select_agent(
        &self,
        candidates: &[AgentCandidate],
        workload: &SessionWorkload,
    ) -> Result<Option<AgentId>>;
}

/// Compare free capacity slot-by-slot in resource priority order; the first
/// differing slot decides.
fn compare_free_capacity(a: &ResourceSlot, b: &ResourceSlot, priority: &[String]) -> Ordering {
    let device_rank = |name: &SlotName| -> (usize, String) {
        let rank = priority
            .iter()
            .position(|device| device == name.device())
            .unwrap_or(priority.len());
        (rank, name.to_string())
    };
    let mut names: Vec<&SlotName> = a.names().chain(b.names()).collect();
    names.sort_by_key(|name| device_rank(name));
    names.dedup();
    for name in names {
        let ordering = a.get(name).cmp(&b.get(name));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn fitting<'a>(
    candidates: &'a [AgentCandidate],
    requested: &ResourceSlot,
) -> Vec<&'a AgentCandidate> {
    candidates.iter().filter(|c| c.fits(requested)).collect()
}

/// CONCENTRATED: pack onto the agent with the least free capacity that still
/// fits, leaving the large agents whole for large jobs.
#[derive(Debug)]
pub struct ConcentratedAgentSelector {
    resource_priority: Vec<String>,
    enforce_spreading_endpoint_replica: bool,
}

impl ConcentratedAgentSelector {
    pub fn new(resource_priority: Vec<String>, enforce_spreading_endpoint_replica: bool) -> Self {
        Self {
            resource_priority,
            enforce_spreading_endpoint_replica,
        }
    }
}

#[async_trait]
impl AgentSelector for ConcentratedAgentSelector {
    fn name(&self) -> &'static str {
        "concentrated"
    }

    async fn select_agent(
        &self,
        candidates: &[AgentCandidate],
        workload: &SessionWorkload,
    ) -> Result<Option<AgentId>> {
        let fitting = fitting(candidates, &workload.requested_slots);
        let spread_counts = match (&workload.endpoint_kernel_counts, workload.session_type) {
            (Some(counts), SessionType::Inference) if self.enforce_spreading_endpoint_replica => {
                Some(counts)
            }
            _ => None,
        };
        let picked = fitting.into_iter().min_by(|a, b| {
            if let Some(counts) = spread_counts {
                let replicas_a = counts.get(&a.id).copied().unwrap_or(0);
                let replicas_b = counts.get(&b.id).copied().unwrap_or(0);
                // Fewest replicas of the same endpoint first; ties fall back
                // to the concentrated rule.
                let ordering = replicas_a.cmp(&replicas_b);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            compare_free_capacity(&a.free_slots(), &b.free_slots(), &self.resource_priority)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(picked.map(|c| c.id.clone()))
    }
}

/// DISPERSED: pick the agent with the largest free capacity.
#[derive(Debug)]
pub struct DispersedAgentSelector {
    resource_priority: Vec<String>,
}

impl DispersedAgentSelector {
    pub fn new(resource_priority: Vec<String>) -> Self {
        Self { resource_priority }
    }
}

#[async_trait]
impl AgentSelector for DispersedAgentSelector {
    fn name(&self) -> &'static str {
        "dispersed"
    }

    async fn select_agent(
        &self,
        candidates: &[AgentCandidate],
        workload: &SessionWorkload,
    ) -> Result<Option<AgentId>> {
        let picked = fitting(candidates, &workload.requested_slots)
            .into_iter()
            .max_by(|a, b| {
                compare_free_capacity(&a.free_slots(), &b.free_slots(), &self.resource_priority)
                    .then_with(|| b.id.cmp(&a.id))
            });
        Ok(picked.map(|c| c.id.clone()))
    }
}

/// ROUNDROBIN: rotate over the candidate list, skipping agents that cannot
/// fit. The cursor is persisted per resource group.
#[derive(Debug)]
pub struct RoundRobinAgentSelector {
    state_store: Arc<dyn ResourceGroupStateStore>,
}

impl RoundRobinAgentSelector {
    pub fn new(state_store: Arc<dyn ResourceGroupStateStore>) -> Self {
        Self { state_store }
    }
}

#[async_trait]
impl AgentSelector for RoundRobinAgentSelector {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    async fn select_agent(
        &self,
        candidates: &[AgentCandidate],
        workload: &SessionWorkload,
    ) -> Result<Option<AgentId>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let cursor = self
            .state_store
            .get(&workload.scaling_group, ROUNDROBIN_CURSOR_KEY)
            .await?
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0)
            % candidates.len();
        for offset in 0..candidates.len() {
            let idx = (cursor + offset) % candidates.len();
            if candidates[idx].fits(&workload.requested_slots) {
                self.state_store
                    .put(
                        &workload.scaling_group,
                        ROUNDROBIN_CURSOR_KEY,
                        ((idx + 1) % candidates.len()).to_string(),
                    )
                    .await?;
                return Ok(Some(candidates[idx].id.clone()));
            }
        }
        Ok(None)
    }
}

/// LEGACY: first fitting candidate in input order. Deprecated; kept so old
/// resource-group configurations keep scheduling.
#[derive(Debug)]
pub struct LegacyAgentSelector;

#[async_trait]
impl AgentSelector for LegacyAgentSelector {
    fn name(&self) -> &'static str {
        "legacy"
    }

    async fn select_agent(
        &self,
        candidates: &[AgentCandidate],
        workload: &SessionWorkload,
    ) -> Result<Option<AgentId>> {
        Ok(candidates
            .iter()
            .find(|c| c.fits(&workload.requested_slots))
            .map(|c| c.id.clone()))
    }
}

/// Build a selector from resource-group options.
///
/// Replica spreading is only defined for CONCENTRATED; combining it with any
/// other strategy is a configuration error.
pub fn create_agent_selector(
    strategy: AgentSelectionStrategy,
    enforce_spreading_endpoint_replica: bool,
    resource_priority: Vec<String>,
    state_store: Arc<dyn ResourceGroupStateStore>,
) -> Result<Arc<dyn AgentSelector>> {
    if enforce_spreading_endpoint_replica && strategy != AgentSelectionStrategy::Concentrated {
        return Err(Error::config(format!(
            "enforce_spreading_endpoint_replica requires the concentrated strategy, got {strategy:?}"
        )));
    }
    Ok(match strategy {
        AgentSelectionStrategy::Concentrated => Arc::new(ConcentratedAgentSelector::new(
            resource_priority,
            enforce_spreading_endpoint_replica,
        )),
        AgentSelectionStrategy::RoundRobin => Arc::new(RoundRobinAgentSelector::new(state_store)),
        AgentSelectionStrategy::Dispersed => {
            Arc::new(DispersedAgentSelector::new(resource_priority))
        }
        AgentSelectionStrategy::Legacy => Arc::new(LegacyAgentSelector),
    })
}
