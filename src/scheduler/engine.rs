//! The scheduling tick.
//!
//! Per resource group, in a loop until no progress: load the pending queue,
//! apply the admission filters, let the picker choose a session and the
//! selector choose its agents, then commit the placement through the ledger
//! and the registry. Each (pick, select, allocate) cycle runs under the
//! group's advisory lock so concurrent ticks never double-allocate.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::registry::{
    AgentRegistry, DependencyVerdict, KeypairPolicyStore, SessionRegistry,
};
use crate::resource::{ResourceLedger, ResourceSlot};
use crate::state::{ClusterMode, ClusterRole, SessionType, SessionWithKernels};
use crate::types::{
    AccessKey, AgentId, Error, KernelId, ResourceGroupOpts, Result, SessionId,
};

use super::picker::{create_session_picker, PickContext};
use super::selector::{
    create_agent_selector, AgentCandidate, AgentSelector, ResourceGroupStateStore,
    SessionWorkload,
};

/// Why the scheduler could not admit a session this tick. These land in
/// `status_info` and resolve on a later tick.
const STATUS_NO_SUITABLE_AGENT: &str = "no-suitable-agent";
const STATUS_NO_AVAILABLE_INSTANCES: &str = "no-available-instances";
const STATUS_PENDING_TIMEOUT: &str = "pending-timeout";
const STATUS_DEPENDENCY_FAILED: &str = "dependency-failed";
const STATUS_CONCURRENCY_LIMIT: &str = "concurrency-limit-reached";
const STATUS_PENDING_LIMIT: &str = "pending-session-limit-reached";

/// Counters for one scheduling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub scheduled: usize,
    pub cancelled: usize,
}

impl ScheduleStats {
    fn merge(&mut self, other: ScheduleStats) {
        self.scheduled += other.scheduled;
        self.cancelled += other.cancelled;
    }
}

enum PlacementOutcome {
    Placed,
    NoAgent,
    AllocationFailed,
}

/// Arguments for creating a [`SchedulerEngine`].
#[derive(Debug, Clone)]
pub struct SchedulerEngineArgs {
    pub sessions: Arc<SessionRegistry>,
    pub agents: Arc<AgentRegistry>,
    pub ledger: Arc<ResourceLedger>,
    pub policies: Arc<KeypairPolicyStore>,
    pub state_store: Arc<dyn ResourceGroupStateStore>,
    pub resource_priority: Vec<String>,
}

/// Drives PENDING sessions to SCHEDULED.
#[derive(Debug)]
pub struct SchedulerEngine {
    sessions: Arc<SessionRegistry>,
    agents: Arc<AgentRegistry>,
    ledger: Arc<ResourceLedger>,
    policies: Arc<KeypairPolicyStore>,
    state_store: Arc<dyn ResourceGroupStateStore>,
    resource_priority: Vec<String>,
    group_opts: RwLock<BTreeMap<String, ResourceGroupOpts>>,
    group_locks: Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
}

impl SchedulerEngine {
    pub fn new(args: SchedulerEngineArgs) -> Self {
        Self {
            sessions: args.sessions,
            agents: args.agents,
            ledger: args.ledger,
            policies: args.policies,
            state_store: args.state_store,
            resource_priority: args.resource_priority,
            group_opts: RwLock::new(BTreeMap::new()),
            group_locks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Configure a resource group. The selector combination is validated
    /// eagerly so a bad config fails here, not on the first tick.
    pub async fn set_group_opts(&self, scaling_group: &str, opts: ResourceGroupOpts) -> Result<()> {
        create_agent_selector(
            opts.agent_selection_strategy,
            opts.enforce_spreading_endpoint_replica,
            self.resource_priority.clone(),
            self.state_store.clone(),
        )?;
        self.group_opts
            .write()
            .await
            .insert(scaling_group.to_string(), opts);
        Ok(())
    }

    async fn group_opts(&self, scaling_group: &str) -> ResourceGroupOpts {
        self.group_opts
            .read()
            .await
            .get(scaling_group)
            .cloned()
            .unwrap_or_default()
    }

    async fn group_lock(&self, scaling_group: &str) -> Arc<Mutex<()>> {
        self.group_locks
            .lock()
            .await
            .entry(scaling_group.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// One scheduling pass over every known resource group.
    pub async fn schedule_tick(&self) -> Result<ScheduleStats> {
        let mut groups: BTreeSet<String> = self.agents.scaling_groups().await;
        groups.extend(self.sessions.scaling_groups_with_pending().await);
        let mut stats = ScheduleStats::default();
        for scaling_group in groups {
            stats.merge(self.schedule_group(&scaling_group).await?);
        }
        Ok(stats)
    }

    /// Schedule one resource group until no further progress is possible.
    pub async fn schedule_group(&self, scaling_group: &str) -> Result<ScheduleStats> {
        let opts = self.group_opts(scaling_group).await;
        let picker = create_session_picker(opts.session_picker);
        let selector = create_agent_selector(
            opts.agent_selection_strategy,
            opts.enforce_spreading_endpoint_replica,
            self.resource_priority.clone(),
            self.state_store.clone(),
        )?;

        let mut stats = ScheduleStats::default();
        stats.cancelled += self.expire_pending_timeouts(scaling_group, &opts).await?;

        let mut attempted: BTreeSet<SessionId> = BTreeSet::new();
        loop {
            // Advisory lock: one (pick, select, allocate) cycle per hold.
            let lock = self.group_lock(scaling_group).await;
            let _guard = lock.lock().await;

            let candidates = self.candidates(scaling_group, None).await;
            let total_capacity = candidates
                .iter()
                .fold(ResourceSlot::new(), |acc, c| acc + c.free_slots());

            let (admissible, cancelled) = self
                .admissible_sessions(scaling_group, &attempted, &total_capacity)
                .await?;
            stats.cancelled += cancelled;
            if admissible.is_empty() {
                break;
            }

            let ctx = PickContext {
                total_capacity,
                occupancy_by_key: self.sessions.occupancy_by_access_key().await,
            };
            let Some(picked_id) = picker.pick_session(&ctx, &admissible) else {
                break;
            };
            attempted.insert(picked_id.clone());
            let Some(picked) = admissible.into_iter().find(|s| s.session.id == picked_id)
            else {
                break;
            };

            match self.try_place(scaling_group, &opts, selector.as_ref(), &picked).await? {
                PlacementOutcome::Placed => {
                    info!(
                        session = %picked_id, group = scaling_group,
                        picker = picker.name(), selector = selector.name(),
                        "session scheduled"
                    );
                    stats.scheduled += 1;
                }
                PlacementOutcome::NoAgent => {
                    debug!(session = %picked_id, group = scaling_group, "no suitable agent");
                    self.sessions
                        .set_status_info(&picked_id, STATUS_NO_SUITABLE_AGENT)
                        .await?;
                }
                PlacementOutcome::AllocationFailed => {
                    debug!(session = %picked_id, group = scaling_group, "allocation failed");
                    self.sessions
                        .set_status_info(&picked_id, STATUS_NO_AVAILABLE_INSTANCES)
                        .await?;
                }
            }
        }
        Ok(stats)
    }

    /// Cancel sessions that waited longer than the group's pending timeout.
    async fn expire_pending_timeouts(
        &self,
        scaling_group: &str,
        opts: &ResourceGroupOpts,
    ) -> Result<usize> {
        let Some(timeout) = opts.pending_timeout else {
            return Ok(0);
        };
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| Error::config(format!("pending_timeout out of range: {e}")))?;
        let now = Utc::now();
        let mut cancelled = 0;
        for entry in self.sessions.pending_sessions(scaling_group).await {
            if entry.session.created_at + timeout < now
                && self
                    .sessions
                    .cancel_pending(&entry.session.id, STATUS_PENDING_TIMEOUT)
                    .await?
            {
                info!(session = %entry.session.id, "pending session timed out");
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Apply the admission filters to the pending queue, in queue order.
    /// Returns admissible sessions and the number cancelled on the way.
    async fn admissible_sessions(
        &self,
        scaling_group: &str,
        attempted: &BTreeSet<SessionId>,
        total_capacity: &ResourceSlot,
    ) -> Result<(Vec<SessionWithKernels>, usize)> {
        let usage = self.sessions.concurrency_usage().await;
        let mut pending_seen: BTreeMap<AccessKey, usize> = BTreeMap::new();
        let mut admissible = Vec::new();
        let mut cancelled = 0;

        for entry in self.sessions.pending_sessions(scaling_group).await {
            let session = &entry.session;
            if attempted.contains(&session.id) {
                continue;
            }

            match self.sessions.dependency_verdict(session).await {
                DependencyVerdict::Satisfied => {}
                DependencyVerdict::Failed(dep) => {
                    warn!(session = %session.id, dependency = %dep, "dependency failed");
                    if self
                        .sessions
                        .cancel_pending(&session.id, STATUS_DEPENDENCY_FAILED)
                        .await?
                    {
                        cancelled += 1;
                    }
                    continue;
                }
                DependencyVerdict::Waiting(dep) => {
                    self.sessions
                        .set_status_info(&session.id, &format!("dependency-not-met: {dep}"))
                        .await?;
                    continue;
                }
            }

            let policy = self.policies.get(&session.access_key).await;
            let seen = pending_seen.entry(session.access_key.clone()).or_default();
            *seen += 1;
            if let Some(max_pending) = policy.max_pending_session_count {
                if *seen > max_pending {
                    self.sessions
                        .set_status_info(&session.id, STATUS_PENDING_LIMIT)
                        .await?;
                    continue;
                }
            }
            let (regular, sftp) = usage.get(&session.access_key).copied().unwrap_or((0, 0));
            let (occupied, cap) = match session.session_type {
                SessionType::System => (sftp, policy.max_concurrent_sftp_sessions),
                _ => (regular, policy.max_concurrent_sessions),
            };
            if let Some(cap) = cap {
                if occupied >= cap {
                    self.sessions
                        .set_status_info(&session.id, STATUS_CONCURRENCY_LIMIT)
                        .await?;
                    continue;
                }
            }

            if !session.requested_slots.eq_contained(total_capacity) {
                self.sessions
                    .set_status_info(&session.id, STATUS_NO_AVAILABLE_INSTANCES)
                    .await?;
                continue;
            }

            admissible.push(entry);
        }
        Ok((admissible, cancelled))
    }

    /// Candidate agents of a group, with occupancy overlaid from the ledger.
    async fn candidates(
        &self,
        scaling_group: &str,
        architecture: Option<&str>,
    ) -> Vec<AgentCandidate> {
        let agents = self.agents.schedulable_agents(scaling_group, architecture).await;
        let agent_ids: Vec<AgentId> = agents.iter().map(|a| a.id.clone()).collect();
        let mut occupancy = self.ledger.get_agent_occupancy(&agent_ids).await;
        agents
            .into_iter()
            .map(|a| AgentCandidate {
                occupied_slots: occupancy.remove(&a.id).unwrap_or_default(),
                id: a.id,
                addr: a.addr,
                architecture: a.architecture,
                available_slots: a.available_slots,
            })
            .collect()
    }

    /// Select agents for the session's kernels and commit the allocation.
    async fn try_place(
        &self,
        scaling_group: &str,
        opts: &ResourceGroupOpts,
        selector: &dyn AgentSelector,
        picked: &SessionWithKernels,
    ) -> Result<PlacementOutcome> {
        let session = &picked.session;
        let candidates = self
            .candidates(scaling_group, Some(&session.architecture))
            .await;
        if candidates.is_empty() {
            return Ok(PlacementOutcome::NoAgent);
        }

        let endpoint_kernel_counts = match (&session.endpoint_id, session.session_type) {
            (Some(endpoint_id), SessionType::Inference)
                if opts.enforce_spreading_endpoint_replica =>
            {
                Some(self.sessions.endpoint_kernel_counts(endpoint_id).await)
            }
            _ => None,
        };

        // (kernel, agent, addr) triples to commit.
        let mut assignments: Vec<(KernelId, AgentId, String)> = Vec::new();
        match session.cluster_mode {
            ClusterMode::SingleNode => {
                // One agent must fit the sum of all kernels.
                let workload = SessionWorkload {
                    session_id: session.id.clone(),
                    scaling_group: scaling_group.to_string(),
                    session_type: session.session_type,
                    requested_slots: session.requested_slots.clone(),
                    endpoint_kernel_counts,
                };
                let Some(agent_id) = selector.select_agent(&candidates, &workload).await?
                else {
                    return Ok(PlacementOutcome::NoAgent);
                };
                let addr = candidate_addr(&candidates, &agent_id);
                for kernel in &picked.kernels {
                    assignments.push((kernel.id.clone(), agent_id.clone(), addr.clone()));
                }
            }
            ClusterMode::MultiNode => {
                // One selector call per kernel; picked peers are excluded to
                // enforce cluster spreading.
                let mut excluded: BTreeSet<AgentId> = BTreeSet::new();
                let mut kernels: Vec<_> = picked.kernels.iter().collect();
                kernels.sort_by_key(|k| (k.cluster_role != ClusterRole::Main, k.cluster_idx));
                for kernel in kernels {
                    let remaining: Vec<AgentCandidate> = candidates
                        .iter()
                        .filter(|c| !excluded.contains(&c.id))
                        .cloned()
                        .collect();
                    let workload = SessionWorkload {
                        session_id: session.id.clone(),
                        scaling_group: scaling_group.to_string(),
                        session_type: session.session_type,
                        requested_slots: kernel.requested_slots.clone(),
                        endpoint_kernel_counts: endpoint_kernel_counts.clone(),
                    };
                    let Some(agent_id) = selector.select_agent(&remaining, &workload).await?
                    else {
                        return Ok(PlacementOutcome::NoAgent);
                    };
                    let addr = candidate_addr(&candidates, &agent_id);
                    excluded.insert(agent_id.clone());
                    assignments.push((kernel.id.clone(), agent_id, addr));
                }
            }
        }

        // Ledger transaction: request + allocate per kernel; roll back every
        // committed kernel if any allocation fails.
        let mut allocated: Vec<(KernelId, AgentId)> = Vec::new();
        for (kernel_id, agent_id, _) in &assignments {
            let kernel = picked
                .kernels
                .iter()
                .find(|k| &k.id == kernel_id)
                .ok_or_else(|| Error::internal(format!("kernel {kernel_id} vanished")))?;
            let outcome = async {
                self.ledger
                    .request_resources(kernel_id, &kernel.requested_slots)
                    .await?;
                self.ledger
                    .allocate_resources(kernel_id, agent_id, &kernel.requested_slots)
                    .await?;
                Ok::<(), Error>(())
            }
            .await;
            match outcome {
                Ok(()) => allocated.push((kernel_id.clone(), agent_id.clone())),
                Err(err) => {
                    warn!(
                        session = %session.id, kernel = %kernel_id, agent = %agent_id,
                        error = %err, "allocation failed; rolling back placement"
                    );
                    for (done_kernel, done_agent) in &allocated {
                        self.ledger
                            .rollback_resources(done_kernel, done_agent)
                            .await?;
                    }
                    // Retriable failures (a raced-away agent) leave the
                    // session PENDING for the next tick; anything else is a
                    // bug worth surfacing.
                    return if err.is_retriable() {
                        Ok(PlacementOutcome::AllocationFailed)
                    } else {
                        Err(err)
                    };
                }
            }
        }

        self.sessions.mark_scheduled(&session.id, &assignments).await?;
        Ok(PlacementOutcome::Placed)
    }
}

fn candidate_addr(candidates: &[AgentCandidate], agent_id: &AgentId) -> String {
    candidates
        .iter()
        .find(|c| &c.id == agent_id)
        .map(|c| c.addr.clone())
        .unwrap_or_default()
}
