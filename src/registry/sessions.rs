//! Session/kernel registry.
//!
//! Owns the session and kernel rows and every status write. Status writes are
//! validated against the state machine; the aggregate session status is
//! recomputed from kernel statuses after each kernel transition.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::resource::ResourceSlot;
use crate::state::{
    derive_session_status, KernelRecord, KernelStatus, SessionRecord, SessionResult,
    SessionStatus, SessionType, SessionWithKernels,
};
use crate::types::{AccessKey, AgentId, EndpointId, Error, KernelId, Result, SessionId};

/// Outcome of a kernel status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelStatusUpdate {
    /// False when the write was a duplicate notification (no-op).
    pub kernel_changed: bool,
    pub old_session_status: SessionStatus,
    pub new_session_status: SessionStatus,
}

impl KernelStatusUpdate {
    pub fn session_changed(&self) -> bool {
        self.old_session_status != self.new_session_status
    }
}

/// How a termination request was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationDisposition {
    /// The session never left the queue; cancelled outright.
    Cancelled,
    /// Marked TERMINATING; the terminator will fan out destroy RPCs.
    Terminating,
    /// Already in a terminal state; nothing to do.
    AlreadyTerminal,
}

/// Dependency gate verdict for one pending session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyVerdict {
    Satisfied,
    /// Still waiting on this dependency.
    Waiting(SessionId),
    /// This dependency can never succeed; the dependent must be cancelled.
    Failed(SessionId),
}

#[derive(Debug, Default)]
struct RegistryState {
    sessions: BTreeMap<SessionId, SessionRecord>,
    kernels: BTreeMap<KernelId, KernelRecord>,
    by_session: BTreeMap<SessionId, Vec<KernelId>>,
}

impl RegistryState {
    fn with_kernels(&self, session: &SessionRecord) -> SessionWithKernels {
        let kernels = self
            .by_session
            .get(&session.id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.kernels.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        SessionWithKernels {
            session: session.clone(),
            kernels,
        }
    }

    fn kernel_statuses(&self, session_id: &SessionId) -> Vec<KernelStatus> {
        self.by_session
            .get(session_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.kernels.get(id).map(|k| k.status))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Recompute and store the aggregate session status; stamps termination
    /// bookkeeping when the session finishes.
    fn refresh_session_status(&mut self, session_id: &SessionId, now: DateTime<Utc>) -> SessionStatus {
        let statuses = self.kernel_statuses(session_id);
        let derived = derive_session_status(&statuses);
        let result = if derived == SessionStatus::Terminated {
            Some(self.session_result(session_id))
        } else {
            None
        };
        if let Some(session) = self.sessions.get_mut(session_id) {
            if session.status != derived {
                debug!(
                    session = %session_id, from = ?session.status, to = ?derived,
                    "session status derived from kernels"
                );
                session.status = derived;
                if derived == SessionStatus::Terminated {
                    session.occupying_slots = ResourceSlot::new();
                    session.terminated_at = Some(now);
                    if session.result == SessionResult::Undefined {
                        if let Some(result) = result {
                            session.result = result;
                        }
                    }
                }
            }
            session.status
        } else {
            derived
        }
    }

    /// BATCH sessions succeed iff the main kernel exited zero; everything
    /// else that terminates normally counts as success.
    fn session_result(&self, session_id: &SessionId) -> SessionResult {
        let Some(session) = self.sessions.get(session_id) else {
            return SessionResult::Undefined;
        };
        if session.session_type != SessionType::Batch {
            return SessionResult::Success;
        }
        let main_exit = self
            .by_session
            .get(session_id)
            .and_then(|ids| ids.iter().filter_map(|id| self.kernels.get(id)).find(|k| k.is_main()))
            .and_then(|k| k.exit_code);
        match main_exit {
            Some(0) => SessionResult::Success,
            _ => SessionResult::Failure,
        }
    }
}

/// Registry of sessions and their kernels.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session with its kernel rows (the enqueue path).
    pub async fn insert_session(
        &self,
        session: SessionRecord,
        kernels: Vec<KernelRecord>,
    ) -> Result<()> {
        if kernels.iter().filter(|k| k.is_main()).count() != 1 {
            return Err(Error::validation(format!(
                "session {} must have exactly one main kernel",
                session.id
            )));
        }
        if kernels.iter().any(|k| k.session_id != session.id) {
            return Err(Error::validation(format!(
                "kernel rows do not belong to session {}",
                session.id
            )));
        }
        let mut state = self.state.write().await;
        if state.sessions.contains_key(&session.id) {
            return Err(Error::validation(format!(
                "session {} already exists",
                session.id
            )));
        }
        let kernel_ids: Vec<KernelId> = kernels.iter().map(|k| k.id.clone()).collect();
        for kernel in kernels {
            state.kernels.insert(kernel.id.clone(), kernel);
        }
        state.by_session.insert(session.id.clone(), kernel_ids);
        state.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub async fn session(&self, session_id: &SessionId) -> Result<SessionRecord> {
        self.state
            .read()
            .await
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("unknown session: {session_id}")))
    }

    pub async fn session_with_kernels(&self, session_id: &SessionId) -> Result<SessionWithKernels> {
        let state = self.state.read().await;
        let session = state
            .sessions
            .get(session_id)
            .ok_or_else(|| Error::not_found(format!("unknown session: {session_id}")))?;
        Ok(state.with_kernels(session))
    }

    pub async fn kernel(&self, kernel_id: &KernelId) -> Result<KernelRecord> {
        self.state
            .read()
            .await
            .kernels
            .get(kernel_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("unknown kernel: {kernel_id}")))
    }

    /// PENDING sessions of a resource group in pick order:
    /// `(priority desc, created_at asc, id asc)`.
    pub async fn pending_sessions(&self, scaling_group: &str) -> Vec<SessionWithKernels> {
        let state = self.state.read().await;
        let mut pending: Vec<&SessionRecord> = state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Pending && s.scaling_group == scaling_group)
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        pending.into_iter().map(|s| state.with_kernels(s)).collect()
    }

    /// Sessions admitted but not yet RUNNING; they count against concurrency
    /// caps and their slots are already deducted via the ledger.
    pub async fn scheduled_not_running(&self, scaling_group: &str) -> Vec<SessionRecord> {
        self.state
            .read()
            .await
            .sessions
            .values()
            .filter(|s| {
                s.scaling_group == scaling_group && s.status.is_scheduled_but_not_running()
            })
            .cloned()
            .collect()
    }

    pub async fn sessions_in_status(&self, status: SessionStatus) -> Vec<SessionWithKernels> {
        let state = self.state.read().await;
        state
            .sessions
            .values()
            .filter(|s| s.status == status)
            .map(|s| state.with_kernels(s))
            .collect()
    }

    /// Per-access-key counts of admitted sessions, split into
    /// (regular, SFTP/system) for the two concurrency caps.
    pub async fn concurrency_usage(&self) -> BTreeMap<AccessKey, (usize, usize)> {
        let mut usage: BTreeMap<AccessKey, (usize, usize)> = BTreeMap::new();
        for session in self.state.read().await.sessions.values() {
            if !session.status.is_concurrency_occupying() {
                continue;
            }
            let entry = usage.entry(session.access_key.clone()).or_default();
            match session.session_type {
                SessionType::System => entry.1 += 1,
                _ => entry.0 += 1,
            }
        }
        usage
    }

    /// Add a dependency edge: the session blocks until `depends_on` has
    /// terminated successfully.
    pub async fn add_dependency(
        &self,
        session_id: &SessionId,
        depends_on: SessionId,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.sessions.contains_key(&depends_on) {
            return Err(Error::not_found(format!(
                "dependency session not found: {depends_on}"
            )));
        }
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::not_found(format!("unknown session: {session_id}")))?;
        session.depends_on.insert(depends_on);
        Ok(())
    }

    /// Slot occupancy of admitted sessions per access key (DRF input).
    /// Sessions not yet RUNNING count with their requested slots, since the
    /// ledger has already deducted them.
    pub async fn occupancy_by_access_key(&self) -> BTreeMap<AccessKey, ResourceSlot> {
        let mut occupancy: BTreeMap<AccessKey, ResourceSlot> = BTreeMap::new();
        for session in self.state.read().await.sessions.values() {
            if !session.status.is_concurrency_occupying() {
                continue;
            }
            let slots = if session.occupying_slots.is_zero() {
                session.requested_slots.clone()
            } else {
                session.occupying_slots.clone()
            };
            *occupancy.entry(session.access_key.clone()).or_default() += slots;
        }
        occupancy
    }

    /// Evaluate the dependency gate for a session.
    pub async fn dependency_verdict(&self, session: &SessionRecord) -> DependencyVerdict {
        let state = self.state.read().await;
        for dep_id in &session.depends_on {
            match state.sessions.get(dep_id) {
                None => return DependencyVerdict::Waiting(dep_id.clone()),
                Some(dep) => match (dep.status, dep.result) {
                    (SessionStatus::Terminated, SessionResult::Success) => {}
                    (SessionStatus::Terminated, _) | (SessionStatus::Cancelled, _) => {
                        return DependencyVerdict::Failed(dep_id.clone());
                    }
                    _ => return DependencyVerdict::Waiting(dep_id.clone()),
                },
            }
        }
        DependencyVerdict::Satisfied
    }

    /// Commit a successful placement: kernels get their agents and go
    /// SCHEDULED, the session follows.
    pub async fn mark_scheduled(
        &self,
        session_id: &SessionId,
        assignments: &[(KernelId, AgentId, String)],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        for (kernel_id, agent_id, agent_addr) in assignments {
            let kernel = state
                .kernels
                .get_mut(kernel_id)
                .ok_or_else(|| Error::not_found(format!("unknown kernel: {kernel_id}")))?;
            if !kernel.status.can_transition_to(KernelStatus::Scheduled) {
                return Err(Error::state_transition(format!(
                    "kernel {kernel_id}: cannot schedule from {:?}",
                    kernel.status
                )));
            }
            kernel.agent_id = Some(agent_id.clone());
            kernel.agent_addr = Some(agent_addr.clone());
            kernel.occupied_slots = kernel.requested_slots.clone();
            kernel.status = KernelStatus::Scheduled;
            kernel.status_changed = now;
        }
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::not_found(format!("unknown session: {session_id}")))?;
        session.status = SessionStatus::Scheduled;
        session.status_info = None;
        Ok(())
    }

    /// Record why the scheduler could not admit a session this tick.
    pub async fn set_status_info(&self, session_id: &SessionId, info: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::not_found(format!("unknown session: {session_id}")))?;
        session.status_info = Some(info.to_string());
        Ok(())
    }

    /// Cancel a session still in the queue. Returns false if it already left
    /// PENDING (the terminator owns it from there).
    pub async fn cancel_pending(&self, session_id: &SessionId, info: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(session) = state.sessions.get(session_id) else {
            return Err(Error::not_found(format!("unknown session: {session_id}")));
        };
        if session.status != SessionStatus::Pending {
            return Ok(false);
        }
        let now = Utc::now();
        if let Some(kernel_ids) = state.by_session.get(session_id).cloned() {
            for kernel_id in kernel_ids {
                if let Some(kernel) = state.kernels.get_mut(&kernel_id) {
                    kernel.status = KernelStatus::Cancelled;
                    kernel.status_changed = now;
                }
            }
        }
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.status = SessionStatus::Cancelled;
            session.status_info = Some(info.to_string());
            session.terminated_at = Some(now);
        }
        Ok(true)
    }

    /// Apply a termination request.
    pub async fn mark_terminating(
        &self,
        session_id: &SessionId,
        reason: &str,
    ) -> Result<TerminationDisposition> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let status = state
            .sessions
            .get(session_id)
            .map(|s| s.status)
            .ok_or_else(|| Error::not_found(format!("unknown session: {session_id}")))?;
        if status.is_terminal() {
            return Ok(TerminationDisposition::AlreadyTerminal);
        }
        let (kernel_status, session_status, disposition) = if status == SessionStatus::Pending {
            (
                KernelStatus::Cancelled,
                SessionStatus::Cancelled,
                TerminationDisposition::Cancelled,
            )
        } else {
            (
                KernelStatus::Terminating,
                SessionStatus::Terminating,
                TerminationDisposition::Terminating,
            )
        };
        if let Some(kernel_ids) = state.by_session.get(session_id).cloned() {
            for kernel_id in kernel_ids {
                if let Some(kernel) = state.kernels.get_mut(&kernel_id) {
                    if !kernel.status.is_terminal() && kernel.status != kernel_status {
                        kernel.status = kernel_status;
                        kernel.status_changed = now;
                    }
                }
            }
        }
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.status = session_status;
            session.status_info = Some(reason.to_string());
            if session_status == SessionStatus::Cancelled {
                session.terminated_at = Some(now);
            }
        }
        Ok(disposition)
    }

    pub async fn terminating_sessions(&self) -> Vec<SessionWithKernels> {
        self.sessions_in_status(SessionStatus::Terminating).await
    }

    /// Validated kernel status write; recomputes the session status.
    ///
    /// Duplicate notifications are a no-op; illegal transitions are an error
    /// the caller may log and drop.
    pub async fn update_kernel_status(
        &self,
        kernel_id: &KernelId,
        new_status: KernelStatus,
        exit_code: Option<i32>,
    ) -> Result<KernelStatusUpdate> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let (session_id, old_session_status) = {
            let kernel = state
                .kernels
                .get(kernel_id)
                .ok_or_else(|| Error::not_found(format!("unknown kernel: {kernel_id}")))?;
            let session_status = state
                .sessions
                .get(&kernel.session_id)
                .map(|s| s.status)
                .ok_or_else(|| {
                    Error::internal(format!("kernel {kernel_id} has no session row"))
                })?;
            (kernel.session_id.clone(), session_status)
        };

        let kernel = match state.kernels.get_mut(kernel_id) {
            Some(kernel) => kernel,
            None => return Err(Error::not_found(format!("unknown kernel: {kernel_id}"))),
        };
        if kernel.status == new_status {
            return Ok(KernelStatusUpdate {
                kernel_changed: false,
                old_session_status,
                new_session_status: old_session_status,
            });
        }
        if !kernel.status.can_transition_to(new_status) {
            return Err(Error::state_transition(format!(
                "kernel {kernel_id}: {:?} -> {:?} is not a legal transition",
                kernel.status, new_status
            )));
        }
        kernel.status = new_status;
        kernel.status_changed = now;
        if let Some(code) = exit_code {
            kernel.exit_code = Some(code);
        }
        match new_status {
            KernelStatus::Running => {
                if kernel.starts_at.is_none() {
                    kernel.starts_at = Some(now);
                }
            }
            KernelStatus::Terminated => {
                if kernel.terminated_at.is_none() {
                    kernel.terminated_at = Some(now);
                }
            }
            _ => {}
        }

        let new_session_status = state.refresh_session_status(&session_id, now);
        Ok(KernelStatusUpdate {
            kernel_changed: true,
            old_session_status,
            new_session_status,
        })
    }

    /// Write the session's occupying slots (RUNNING hook).
    pub async fn set_occupying_slots(
        &self,
        session_id: &SessionId,
        occupying: ResourceSlot,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::not_found(format!("unknown session: {session_id}")))?;
        session.occupying_slots = occupying;
        Ok(())
    }

    pub async fn set_pending_hook(
        &self,
        session_id: &SessionId,
        hook: Option<SessionStatus>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::not_found(format!("unknown session: {session_id}")))?;
        session.pending_hook = hook;
        Ok(())
    }

    pub async fn sessions_with_pending_hooks(&self) -> Vec<(SessionWithKernels, SessionStatus)> {
        let state = self.state.read().await;
        state
            .sessions
            .values()
            .filter_map(|s| s.pending_hook.map(|hook| (state.with_kernels(s), hook)))
            .collect()
    }

    /// Kernels of a resource group that have started and still have usage to
    /// account (running, or terminated but not yet observed to the end).
    pub async fn kernels_for_usage(&self, scaling_group: &str) -> Vec<KernelRecord> {
        let state = self.state.read().await;
        state
            .sessions
            .values()
            .filter(|s| s.scaling_group == scaling_group)
            .flat_map(|s| {
                state
                    .by_session
                    .get(&s.id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| state.kernels.get(id))
            })
            .filter(|k| {
                if k.starts_at.is_none() {
                    return false;
                }
                match (k.terminated_at, k.last_observed_at) {
                    (Some(terminated), Some(observed)) => observed < terminated,
                    _ => true,
                }
            })
            .cloned()
            .collect()
    }

    /// Record fair-share observation times.
    pub async fn record_usage_observations(
        &self,
        observations: &BTreeMap<KernelId, DateTime<Utc>>,
    ) {
        let mut state = self.state.write().await;
        for (kernel_id, observed_at) in observations {
            if let Some(kernel) = state.kernels.get_mut(kernel_id) {
                kernel.last_observed_at = Some(*observed_at);
            }
        }
    }

    /// Live kernel count per agent for an endpoint's sessions (replica
    /// spreading input).
    pub async fn endpoint_kernel_counts(
        &self,
        endpoint_id: &EndpointId,
    ) -> BTreeMap<AgentId, usize> {
        let state = self.state.read().await;
        let mut counts: BTreeMap<AgentId, usize> = BTreeMap::new();
        for session in state.sessions.values() {
            if session.endpoint_id.as_ref() != Some(endpoint_id)
                || session.status.is_terminal()
            {
                continue;
            }
            for kernel_id in state.by_session.get(&session.id).into_iter().flatten() {
                if let Some(kernel) = state.kernels.get(kernel_id) {
                    if let Some(agent_id) = &kernel.agent_id {
                        if !kernel.status.is_terminal() {
                            *counts.entry(agent_id.clone()).or_default() += 1;
                        }
                    }
                }
            }
        }
        counts
    }

    /// Non-terminal kernels bound to an agent (sweep input).
    pub async fn kernels_on_agent(&self, agent_id: &AgentId) -> Vec<KernelRecord> {
        self.state
            .read()
            .await
            .kernels
            .values()
            .filter(|k| k.agent_id.as_ref() == Some(agent_id) && !k.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Every scaling group with at least one session row.
    pub async fn scaling_groups(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut groups: Vec<String> = state
            .sessions
            .values()
            .map(|s| s.scaling_group.clone())
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }

    /// Scaling groups that currently have pending sessions.
    pub async fn scaling_groups_with_pending(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut groups: Vec<String> = state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Pending)
            .map(|s| s.scaling_group.clone())
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ClusterMode, ClusterRole, SessionType};
    use pretty_assertions::assert_eq;

    fn make_entry(access_key: &str, session_type: SessionType, kernel_count: usize) -> (SessionRecord, Vec<KernelRecord>) {
        let session_id = SessionId::new();
        let now = Utc::now();
        let kernels: Vec<KernelRecord> = (0..kernel_count)
            .map(|idx| KernelRecord {
                id: KernelId::new(),
                session_id: session_id.clone(),
                cluster_role: if idx == 0 {
                    ClusterRole::Main
                } else {
                    ClusterRole::Sub
                },
                cluster_idx: idx as u32,
                image: "python:3.12".into(),
                architecture: "x86_64".into(),
                requested_slots: ResourceSlot::from_pairs([("cpu", "1"), ("mem", "512")])
                    .unwrap(),
                occupied_slots: ResourceSlot::new(),
                agent_id: None,
                agent_addr: None,
                status: KernelStatus::Pending,
                status_changed: now,
                startup_command: None,
                exit_code: None,
                created_at: now,
                starts_at: None,
                last_observed_at: None,
                terminated_at: None,
            })
            .collect();
        let session = SessionRecord {
            id: session_id,
            access_key: AccessKey::from(access_key),
            domain: "default".into(),
            project: "default".into(),
            user: access_key.into(),
            name: "test".into(),
            priority: 10,
            session_type,
            cluster_mode: ClusterMode::SingleNode,
            cluster_size: kernel_count as u32,
            scaling_group: "sg01".into(),
            architecture: "x86_64".into(),
            requested_slots: ResourceSlot::from_pairs([("cpu", "1"), ("mem", "512")]).unwrap(),
            occupying_slots: ResourceSlot::new(),
            status: SessionStatus::Pending,
            status_info: None,
            result: SessionResult::Undefined,
            created_at: now,
            terminated_at: None,
            depends_on: Default::default(),
            startup_command: None,
            batch_timeout: None,
            bootstrap_script: None,
            environ: Default::default(),
            callback_url: None,
            endpoint_id: None,
            pending_hook: None,
        };
        (session, kernels)
    }

    async fn insert(registry: &SessionRegistry, access_key: &str) -> (SessionId, Vec<KernelId>) {
        let (session, kernels) = make_entry(access_key, SessionType::Interactive, 1);
        let session_id = session.id.clone();
        let kernel_ids = kernels.iter().map(|k| k.id.clone()).collect();
        registry.insert_session(session, kernels).await.unwrap();
        (session_id, kernel_ids)
    }

    #[tokio::test]
    async fn insert_requires_exactly_one_main_kernel() {
        let registry = SessionRegistry::new();
        let (session, mut kernels) = make_entry("user01", SessionType::Interactive, 2);
        kernels[1].cluster_role = ClusterRole::Main;
        assert!(registry.insert_session(session, kernels).await.is_err());
    }

    #[tokio::test]
    async fn kernel_transitions_drive_session_status() {
        let registry = SessionRegistry::new();
        let (session_id, kernel_ids) = insert(&registry, "user01").await;
        let kernel_id = &kernel_ids[0];

        let agent = AgentId::from("i-001");
        registry
            .mark_scheduled(
                &session_id,
                &[(kernel_id.clone(), agent, "10.0.1.1:6001".into())],
            )
            .await
            .unwrap();
        assert_eq!(
            registry.session(&session_id).await.unwrap().status,
            SessionStatus::Scheduled
        );
        // Kernels occupy their requested slots once placed.
        let kernel = registry.kernel(kernel_id).await.unwrap();
        assert_eq!(kernel.occupied_slots, kernel.requested_slots);

        let update = registry
            .update_kernel_status(kernel_id, KernelStatus::Running, None)
            .await
            .unwrap();
        assert!(update.session_changed());
        assert_eq!(update.new_session_status, SessionStatus::Running);
        assert!(registry.kernel(kernel_id).await.unwrap().starts_at.is_some());

        // Duplicate notification is a no-op.
        let update = registry
            .update_kernel_status(kernel_id, KernelStatus::Running, None)
            .await
            .unwrap();
        assert!(!update.kernel_changed);

        // Backwards transitions are rejected.
        let err = registry
            .update_kernel_status(kernel_id, KernelStatus::Scheduled, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StateTransition(_)));

        let update = registry
            .update_kernel_status(kernel_id, KernelStatus::Terminated, None)
            .await
            .unwrap();
        assert_eq!(update.new_session_status, SessionStatus::Terminated);
        let session = registry.session(&session_id).await.unwrap();
        assert!(session.occupying_slots.is_zero());
        assert!(session.terminated_at.is_some());
        assert_eq!(session.result, SessionResult::Success);
    }

    #[tokio::test]
    async fn scheduled_not_running_tracks_admitted_sessions() {
        let registry = SessionRegistry::new();
        let (session_id, kernel_ids) = insert(&registry, "user01").await;
        assert!(registry.scheduled_not_running("sg01").await.is_empty());

        registry
            .mark_scheduled(
                &session_id,
                &[(
                    kernel_ids[0].clone(),
                    AgentId::from("i-001"),
                    "10.0.1.1:6001".into(),
                )],
            )
            .await
            .unwrap();
        assert_eq!(registry.scheduled_not_running("sg01").await.len(), 1);

        registry
            .update_kernel_status(&kernel_ids[0], KernelStatus::Running, None)
            .await
            .unwrap();
        assert!(registry.scheduled_not_running("sg01").await.is_empty());
    }

    #[tokio::test]
    async fn terminating_a_pending_session_cancels_it() {
        let registry = SessionRegistry::new();
        let (session_id, _) = insert(&registry, "user01").await;
        let disposition = registry
            .mark_terminating(&session_id, "user-requested")
            .await
            .unwrap();
        assert_eq!(disposition, TerminationDisposition::Cancelled);
        let session = registry.session(&session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);
        assert!(session.terminated_at.is_some());

        assert_eq!(
            registry
                .mark_terminating(&session_id, "again")
                .await
                .unwrap(),
            TerminationDisposition::AlreadyTerminal
        );
    }

    #[tokio::test]
    async fn dependency_verdicts() {
        let registry = SessionRegistry::new();
        let (dep_id, dep_kernels) = insert(&registry, "user01").await;
        let (session_id, _) = insert(&registry, "user01").await;
        registry
            .add_dependency(&session_id, dep_id.clone())
            .await
            .unwrap();
        let session = registry.session(&session_id).await.unwrap();

        assert_eq!(
            registry.dependency_verdict(&session).await,
            DependencyVerdict::Waiting(dep_id.clone())
        );

        // Drive the dependency to a successful termination.
        registry
            .mark_scheduled(
                &dep_id,
                &[(
                    dep_kernels[0].clone(),
                    AgentId::from("i-001"),
                    "10.0.1.1:6001".into(),
                )],
            )
            .await
            .unwrap();
        registry
            .update_kernel_status(&dep_kernels[0], KernelStatus::Running, None)
            .await
            .unwrap();
        registry
            .update_kernel_status(&dep_kernels[0], KernelStatus::Terminated, Some(0))
            .await
            .unwrap();
        assert_eq!(
            registry.dependency_verdict(&session).await,
            DependencyVerdict::Satisfied
        );
    }

    #[tokio::test]
    async fn cancelled_dependency_fails_dependents() {
        let registry = SessionRegistry::new();
        let (dep_id, _) = insert(&registry, "user01").await;
        let (session_id, _) = insert(&registry, "user01").await;
        registry
            .add_dependency(&session_id, dep_id.clone())
            .await
            .unwrap();
        registry.cancel_pending(&dep_id, "timeout").await.unwrap();

        let session = registry.session(&session_id).await.unwrap();
        assert_eq!(
            registry.dependency_verdict(&session).await,
            DependencyVerdict::Failed(dep_id)
        );
    }

    #[tokio::test]
    async fn concurrency_usage_splits_sftp_sessions() {
        let registry = SessionRegistry::new();
        let (regular_id, regular_kernels) = insert(&registry, "user01").await;
        let (sftp_session, sftp_kernels) = make_entry("user01", SessionType::System, 1);
        let sftp_id = sftp_session.id.clone();
        let sftp_kernel = sftp_kernels[0].id.clone();
        registry
            .insert_session(sftp_session, sftp_kernels)
            .await
            .unwrap();

        // Pending sessions do not count.
        assert!(registry.concurrency_usage().await.is_empty());

        for (session_id, kernel_id) in [(&regular_id, &regular_kernels[0]), (&sftp_id, &sftp_kernel)] {
            registry
                .mark_scheduled(
                    session_id,
                    &[(kernel_id.clone(), AgentId::from("i-001"), "addr".into())],
                )
                .await
                .unwrap();
        }
        let usage = registry.concurrency_usage().await;
        assert_eq!(usage[&AccessKey::from("user01")], (1, 1));
    }
}
