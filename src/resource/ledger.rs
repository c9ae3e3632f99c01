//! The resource-slot ledger.
//!
//! Tracks per-agent capacity/usage and per-kernel allocation rows. Allocation
//! rows are an audit trail: inserted on request, stamped on allocate, and
//! stamped again on free, never deleted. All mutation goes through one lock,
//! which serialises allocation attempts per agent; `allocate_resources`
//! validates every guard before touching state, so a failed call leaves the
//! ledger exactly as it found it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::types::{AgentId, Error, KernelId, Result};

use super::catalog::SlotTypeCatalog;
use super::slot::{ResourceSlot, SlotName, SlotType};

/// Per-(agent, slot) capacity row. Invariant: `0 <= used <= capacity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResource {
    pub capacity: Decimal,
    pub used: Decimal,
}

/// Per-(kernel, slot) allocation row.
///
/// `used`/`used_at` are set when the allocation lands on an agent; `free_at`
/// is set when it is released. A row with `free_at` set is historical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAllocation {
    pub agent_id: Option<AgentId>,
    pub requested: Decimal,
    pub used: Option<Decimal>,
    pub used_at: Option<DateTime<Utc>>,
    pub free_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct LedgerState {
    catalog: SlotTypeCatalog,
    agents: BTreeMap<AgentId, BTreeMap<SlotName, AgentResource>>,
    allocations: BTreeMap<KernelId, BTreeMap<SlotName, ResourceAllocation>>,
}

/// Single source of truth for slot occupancy.
#[derive(Debug)]
pub struct ResourceLedger {
    state: Mutex<LedgerState>,
}

impl ResourceLedger {
    pub fn new(catalog: SlotTypeCatalog) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                catalog,
                ..LedgerState::default()
            }),
        }
    }

    /// Register (or replace) a slot type in the catalog.
    pub async fn register_slot_type(&self, slot_type: SlotType) {
        self.state.lock().await.catalog.register(slot_type);
    }

    pub async fn all_slot_types(&self) -> Vec<SlotType> {
        self.state.lock().await.catalog.all_slot_types()
    }

    pub async fn get_slot_type(&self, name: &SlotName) -> Result<SlotType> {
        self.state.lock().await.catalog.get_slot_type(name)
    }

    pub async fn catalog(&self) -> SlotTypeCatalog {
        self.state.lock().await.catalog.clone()
    }

    /// Bulk-upsert an agent's capacity rows. Existing `used` values are
    /// preserved; new rows start at zero.
    pub async fn upsert_agent_capacity(
        &self,
        agent_id: &AgentId,
        capacity: &ResourceSlot,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.catalog.validate_names(capacity.names())?;
        let rows = state.agents.entry(agent_id.clone()).or_default();
        for (name, quantity) in capacity.iter() {
            rows.entry(name.clone())
                .and_modify(|row| row.capacity = *quantity)
                .or_insert_with(|| AgentResource {
                    capacity: *quantity,
                    used: Decimal::ZERO,
                });
        }
        Ok(())
    }

    /// Insert one allocation row per requested slot, with `used` unset.
    ///
    /// A row that was already allocated (or freed) means the kernel is being
    /// requested twice and fails the whole call. A leftover row with `used`
    /// unset comes from a placement attempt that rolled back; it is
    /// overwritten so the next tick can retry.
    pub async fn request_resources(
        &self,
        kernel_id: &KernelId,
        slots: &ResourceSlot,
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.catalog.validate_names(slots.names())?;
        let rows = state.allocations.entry(kernel_id.clone()).or_default();
        for name in slots.names() {
            if let Some(row) = rows.get(name) {
                if row.used.is_some() || row.free_at.is_some() {
                    return Err(Error::validation(format!(
                        "allocation row already exists for kernel {kernel_id} slot {name}"
                    )));
                }
            }
        }
        for (name, quantity) in slots.iter() {
            rows.insert(
                name.clone(),
                ResourceAllocation {
                    agent_id: None,
                    requested: *quantity,
                    used: None,
                    used_at: None,
                    free_at: None,
                },
            );
        }
        Ok(slots.len())
    }

    /// Land a kernel's requested slots on an agent.
    ///
    /// Every guard is checked before any row changes; a failure rolls the
    /// whole call back by never applying it.
    pub async fn allocate_resources(
        &self,
        kernel_id: &KernelId,
        agent_id: &AgentId,
        slots: &ResourceSlot,
    ) -> Result<usize> {
        let mut state = self.state.lock().await;

        // Validation phase: nothing is mutated until every guard passes.
        {
            let allocation_rows = state.allocations.get(kernel_id).ok_or_else(|| {
                Error::not_found(format!("no allocation rows for kernel {kernel_id}"))
            })?;
            let agent_rows = state
                .agents
                .get(agent_id)
                .ok_or_else(|| Error::not_found(format!("unknown agent: {agent_id}")))?;

            for (name, quantity) in slots.iter() {
                let row = allocation_rows.get(name).ok_or_else(|| {
                    Error::not_found(format!(
                        "kernel {kernel_id} has no requested row for slot {name}"
                    ))
                })?;
                if row.used.is_some() {
                    return Err(Error::validation(format!(
                        "kernel {kernel_id} slot {name} is already allocated"
                    )));
                }
                if *quantity > row.requested {
                    return Err(Error::validation(format!(
                        "kernel {kernel_id} slot {name}: allocating {quantity} above requested {}",
                        row.requested
                    )));
                }
                let free = match agent_rows.get(name) {
                    Some(agent_row) => agent_row.capacity - agent_row.used,
                    None => Decimal::ZERO,
                };
                if *quantity > free {
                    return Err(Error::capacity_exceeded(format!(
                        "agent {agent_id} slot {name}: requested {quantity}, free {free}"
                    )));
                }
            }
        }

        // Apply phase: guards held, safe to mutate.
        let now = Utc::now();
        if let Some(rows) = state.allocations.get_mut(kernel_id) {
            for (name, quantity) in slots.iter() {
                if let Some(row) = rows.get_mut(name) {
                    row.agent_id = Some(agent_id.clone());
                    row.used = Some(*quantity);
                    row.used_at = Some(now);
                }
            }
        }
        if let Some(rows) = state.agents.get_mut(agent_id) {
            for (name, quantity) in slots.iter() {
                if let Some(row) = rows.get_mut(name) {
                    row.used += *quantity;
                }
            }
        }
        Ok(slots.len())
    }

    /// Undo a placement attempt: live allocations of `kernel_id` on
    /// `agent_id` are reversed and the rows return to the requested-only
    /// state, exactly as a transaction rollback would leave them. Rows
    /// already freed are untouched.
    pub async fn rollback_resources(
        &self,
        kernel_id: &KernelId,
        agent_id: &AgentId,
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut reversed: Vec<(SlotName, Decimal)> = Vec::new();

        if let Some(rows) = state.allocations.get_mut(kernel_id) {
            for (name, row) in rows.iter_mut() {
                if row.agent_id.as_ref() != Some(agent_id) || row.free_at.is_some() {
                    continue;
                }
                if let Some(used) = row.used {
                    reversed.push((name.clone(), used));
                }
                row.agent_id = None;
                row.used = None;
                row.used_at = None;
            }
        }

        if let Some(agent_rows) = state.agents.get_mut(agent_id) {
            for (name, used) in &reversed {
                if let Some(row) = agent_rows.get_mut(name) {
                    row.used -= *used;
                    if row.used < Decimal::ZERO {
                        warn!(
                            agent = %agent_id, slot = %name,
                            "agent usage went negative on rollback; clamping to zero"
                        );
                        row.used = Decimal::ZERO;
                    }
                }
            }
        }
        Ok(reversed.len())
    }

    /// Release every live allocation of `kernel_id` on `agent_id`.
    ///
    /// Idempotent: rows already freed (or never allocated) are skipped, so a
    /// second call returns zero and changes nothing.
    pub async fn free_resources(&self, kernel_id: &KernelId, agent_id: &AgentId) -> Result<usize> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut freed: Vec<(SlotName, Decimal)> = Vec::new();

        if let Some(rows) = state.allocations.get_mut(kernel_id) {
            for (name, row) in rows.iter_mut() {
                if row.agent_id.as_ref() != Some(agent_id) {
                    continue;
                }
                if let (Some(used), None) = (row.used, row.free_at) {
                    row.free_at = Some(now);
                    freed.push((name.clone(), used));
                }
            }
        }

        if let Some(agent_rows) = state.agents.get_mut(agent_id) {
            for (name, used) in &freed {
                match agent_rows.get_mut(name) {
                    Some(row) => {
                        row.used -= *used;
                        if row.used < Decimal::ZERO {
                            warn!(
                                agent = %agent_id, slot = %name,
                                "agent usage went negative on free; clamping to zero"
                            );
                            row.used = Decimal::ZERO;
                        }
                    }
                    None => {
                        warn!(
                            agent = %agent_id, slot = %name,
                            "freeing allocation for a slot the agent no longer reports"
                        );
                    }
                }
            }
        }
        Ok(freed.len())
    }

    /// Currently-used capacity per agent, from the ledger's own rows.
    pub async fn get_agent_occupancy(
        &self,
        agent_ids: &[AgentId],
    ) -> BTreeMap<AgentId, ResourceSlot> {
        let state = self.state.lock().await;
        agent_ids
            .iter()
            .map(|agent_id| {
                let occupancy = state
                    .agents
                    .get(agent_id)
                    .map(|rows| {
                        rows.iter()
                            .map(|(name, row)| (name.clone(), row.used))
                            .collect()
                    })
                    .unwrap_or_default();
                (agent_id.clone(), occupancy)
            })
            .collect()
    }

    /// Snapshot of an agent's capacity rows, if known.
    pub async fn agent_resources(
        &self,
        agent_id: &AgentId,
    ) -> Option<BTreeMap<SlotName, AgentResource>> {
        self.state.lock().await.agents.get(agent_id).cloned()
    }

    /// Snapshot of a kernel's allocation rows.
    pub async fn kernel_allocations(
        &self,
        kernel_id: &KernelId,
    ) -> BTreeMap<SlotName, ResourceAllocation> {
        self.state
            .lock()
            .await
            .allocations
            .get(kernel_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Post-hoc invariant check. Violations are logged and returned, never
    /// repaired here: an inconsistent ledger is a bug upstream.
    pub async fn audit(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut violations = Vec::new();
        for (agent_id, rows) in &state.agents {
            for (name, row) in rows {
                if row.used < Decimal::ZERO || row.used > row.capacity {
                    violations.push(format!(
                        "agent {agent_id} slot {name}: used {} outside [0, {}]",
                        row.used, row.capacity
                    ));
                }
            }
        }
        for (kernel_id, rows) in &state.allocations {
            for (name, row) in rows {
                if let Some(used) = row.used {
                    if used > row.requested {
                        violations.push(format!(
                            "kernel {kernel_id} slot {name}: used {used} above requested {}",
                            row.requested
                        ));
                    }
                }
            }
        }
        for violation in &violations {
            error!(%violation, "resource ledger invariant violated");
        }
        violations
    }
}
