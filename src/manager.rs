//! The manager facade.
//!
//! `Manager` owns every subsystem and exposes the inbound surface: session
//! enqueue/terminate, the three ticks, agent registration, and agent event
//! intake. `ManagerDaemon` runs the ticks on their configured cadences with
//! cooperative shutdown.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::AgentClientPool;
use crate::events::{EventProducer, KernelLifecycleEvent};
use crate::fair_share::{FairShareAggregator, KernelUsageObservation, UsageRecordStore};
use crate::hooks::{DeploymentRepository, HookRegistry, HookRegistryArgs};
use crate::lifecycle::{
    KernelEventHandler, LifecycleSweeper, LifecycleSweeperArgs, SessionStarter,
    SessionStarterArgs, SessionTerminator, SessionTerminatorArgs, SweepStats, TerminationStats,
};
use crate::registry::{
    AgentRegistry, KeypairPolicyStore, SessionRegistry, TerminationDisposition,
};
use crate::resource::{ResourceLedger, ResourceSlot, SlotTypeCatalog};
use crate::scheduler::{
    ResourceGroupStateStore, ScheduleStats, SchedulerEngine, SchedulerEngineArgs,
};
use crate::state::{
    AgentRecord, ClusterRole, KernelRecord, KernelStatus, SessionRecord, SessionResult,
    SessionStatus, SessionType, ClusterMode, SESSION_PRIORITY_DEFAULT,
};
use crate::types::{
    AccessKey, Config, EndpointId, Error, KernelId, ResourceGroupOpts, Result, SessionId,
};

/// One kernel of a new session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSpec {
    pub image: String,
    /// Defaults to the session architecture.
    pub architecture: Option<String>,
    pub cluster_role: ClusterRole,
    pub cluster_idx: u32,
    pub requested_slots: ResourceSlot,
    pub startup_command: Option<String>,
}

/// Everything needed to enqueue a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreator {
    pub access_key: AccessKey,
    pub domain: String,
    pub project: String,
    pub user: String,
    pub name: String,
    pub session_type: SessionType,
    pub cluster_mode: ClusterMode,
    pub cluster_size: u32,
    pub scaling_group: String,
    pub architecture: String,
    pub priority: Option<i32>,
    pub depends_on: BTreeSet<SessionId>,
    pub startup_command: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    pub batch_timeout: Option<Duration>,
    pub bootstrap_script: Option<String>,
    pub environ: BTreeMap<String, String>,
    pub callback_url: Option<String>,
    pub endpoint_id: Option<EndpointId>,
    pub kernels: Vec<KernelSpec>,
}

/// Counters for one lifecycle tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleTickStats {
    pub kernels_preparing: usize,
    pub termination: TerminationStats,
    pub sweep: SweepStats,
    pub hooks_retried: usize,
}

/// Arguments for creating a [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerArgs {
    pub config: Config,
    pub catalog: SlotTypeCatalog,
    pub deployments: Arc<dyn DeploymentRepository>,
    pub events: Arc<dyn EventProducer>,
    pub state_store: Arc<dyn ResourceGroupStateStore>,
    pub usage_store: Arc<dyn UsageRecordStore>,
}

/// The scheduling and lifecycle core. Owns all subsystems.
#[derive(Debug)]
pub struct Manager {
    config: Config,
    sessions: Arc<SessionRegistry>,
    agents: Arc<AgentRegistry>,
    ledger: Arc<ResourceLedger>,
    policies: Arc<KeypairPolicyStore>,
    agent_pool: Arc<AgentClientPool>,
    engine: SchedulerEngine,
    starter: SessionStarter,
    terminator: SessionTerminator,
    sweeper: LifecycleSweeper,
    event_handler: KernelEventHandler,
    aggregator: FairShareAggregator,
    usage_store: Arc<dyn UsageRecordStore>,
}

impl Manager {
    pub fn new(args: ManagerArgs) -> Self {
        crate::observability::init_tracing(&args.config.observability);

        let sessions = Arc::new(SessionRegistry::new());
        let agents = Arc::new(AgentRegistry::new());
        let ledger = Arc::new(ResourceLedger::new(args.catalog));
        let policies = Arc::new(KeypairPolicyStore::new());
        let agent_pool = Arc::new(AgentClientPool::new());

        let engine = SchedulerEngine::new(SchedulerEngineArgs {
            sessions: sessions.clone(),
            agents: agents.clone(),
            ledger: ledger.clone(),
            policies: policies.clone(),
            state_store: args.state_store,
            resource_priority: args
                .config
                .scheduler
                .agent_selection_resource_priority
                .clone(),
        });
        let starter = SessionStarter::new(SessionStarterArgs {
            sessions: sessions.clone(),
            agent_pool: agent_pool.clone(),
            rpc_timeout: args.config.lifecycle.rpc_timeout,
        });
        let terminator = SessionTerminator::new(SessionTerminatorArgs {
            sessions: sessions.clone(),
            agent_pool: agent_pool.clone(),
            destroy_concurrency: args.config.lifecycle.destroy_concurrency,
            rpc_timeout: args.config.lifecycle.rpc_timeout,
        });
        let sweeper = LifecycleSweeper::new(LifecycleSweeperArgs {
            sessions: sessions.clone(),
            agents: agents.clone(),
            ledger: ledger.clone(),
            lost_agent_grace: args.config.lifecycle.lost_agent_grace,
        });
        let hooks = Arc::new(HookRegistry::new(HookRegistryArgs {
            sessions: sessions.clone(),
            agent_pool: agent_pool.clone(),
            deployments: args.deployments,
            events: args.events,
        }));
        let event_handler = KernelEventHandler::new(sessions.clone(), ledger.clone(), hooks);

        Self {
            config: args.config,
            sessions,
            agents,
            ledger,
            policies,
            agent_pool,
            engine,
            starter,
            terminator,
            sweeper,
            event_handler,
            aggregator: FairShareAggregator::new(),
            usage_store: args.usage_store,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn policies(&self) -> &Arc<KeypairPolicyStore> {
        &self.policies
    }

    pub fn agent_pool(&self) -> &Arc<AgentClientPool> {
        &self.agent_pool
    }

    /// Configure a resource group's scheduler and selector.
    pub async fn configure_resource_group(
        &self,
        scaling_group: &str,
        opts: ResourceGroupOpts,
    ) -> Result<()> {
        self.engine.set_group_opts(scaling_group, opts).await
    }

    /// Register or refresh an agent (heartbeat path). Capacity flows into
    /// the ledger; `used` values are untouched.
    pub async fn upsert_agent(&self, agent: AgentRecord) -> Result<()> {
        self.ledger
            .upsert_agent_capacity(&agent.id, &agent.available_slots)
            .await?;
        self.agents.upsert(agent).await;
        Ok(())
    }

    pub async fn mark_agent_lost(&self, agent_id: &crate::types::AgentId) -> Result<()> {
        self.agents.mark_lost(agent_id).await
    }

    pub async fn mark_agent_alive(&self, agent_id: &crate::types::AgentId) -> Result<()> {
        self.agents.mark_alive(agent_id).await
    }

    /// Validate and insert a new PENDING session with its kernels.
    pub async fn enqueue_session(&self, creator: SessionCreator) -> Result<SessionId> {
        if creator.kernels.is_empty() {
            return Err(Error::validation("session must have at least one kernel"));
        }
        if creator
            .kernels
            .iter()
            .filter(|k| k.cluster_role == ClusterRole::Main)
            .count()
            != 1
        {
            return Err(Error::validation("session must have exactly one main kernel"));
        }
        if creator.cluster_size as usize != creator.kernels.len() {
            return Err(Error::validation(format!(
                "cluster_size {} does not match kernel count {}",
                creator.cluster_size,
                creator.kernels.len()
            )));
        }
        let catalog = self.ledger.catalog().await;
        for kernel in &creator.kernels {
            catalog.validate_names(kernel.requested_slots.names())?;
        }
        for dep in &creator.depends_on {
            self.sessions.session(dep).await?;
        }

        let session_id = SessionId::new();
        let now = Utc::now();
        let mut requested_slots = ResourceSlot::new();
        let mut kernels = Vec::with_capacity(creator.kernels.len());
        for spec in &creator.kernels {
            requested_slots += spec.requested_slots.clone();
            kernels.push(KernelRecord {
                id: KernelId::new(),
                session_id: session_id.clone(),
                cluster_role: spec.cluster_role,
                cluster_idx: spec.cluster_idx,
                image: spec.image.clone(),
                architecture: spec
                    .architecture
                    .clone()
                    .unwrap_or_else(|| creator.architecture.clone()),
                requested_slots: spec.requested_slots.clone(),
                occupied_slots: ResourceSlot::new(),
                agent_id: None,
                agent_addr: None,
                status: KernelStatus::Pending,
                status_changed: now,
                startup_command: spec
                    .startup_command
                    .clone()
                    .or_else(|| creator.startup_command.clone()),
                exit_code: None,
                created_at: now,
                starts_at: None,
                last_observed_at: None,
                terminated_at: None,
            });
        }

        let session = SessionRecord {
            id: session_id.clone(),
            access_key: creator.access_key,
            domain: creator.domain,
            project: creator.project,
            user: creator.user,
            name: creator.name,
            priority: creator.priority.unwrap_or(SESSION_PRIORITY_DEFAULT),
            session_type: creator.session_type,
            cluster_mode: creator.cluster_mode,
            cluster_size: creator.cluster_size,
            scaling_group: creator.scaling_group,
            architecture: creator.architecture,
            requested_slots,
            occupying_slots: ResourceSlot::new(),
            status: SessionStatus::Pending,
            status_info: None,
            result: SessionResult::Undefined,
            created_at: now,
            terminated_at: None,
            depends_on: creator.depends_on,
            startup_command: creator.startup_command,
            batch_timeout: creator.batch_timeout,
            bootstrap_script: creator.bootstrap_script,
            environ: creator.environ,
            callback_url: creator.callback_url,
            endpoint_id: creator.endpoint_id,
            pending_hook: None,
        };
        self.sessions.insert_session(session, kernels).await?;
        info!(session = %session_id, "session enqueued");
        Ok(session_id)
    }

    /// Mark a session for termination and return immediately; ticks and
    /// agent events drive the actual shutdown.
    pub async fn terminate_session(
        &self,
        session_id: &SessionId,
        reason: &str,
    ) -> Result<TerminationDisposition> {
        let disposition = self.sessions.mark_terminating(session_id, reason).await?;
        info!(session = %session_id, reason, ?disposition, "termination requested");
        Ok(disposition)
    }

    /// One scheduling pass: PENDING -> SCHEDULED.
    pub async fn scheduler_tick(&self) -> Result<ScheduleStats> {
        self.engine.schedule_tick().await
    }

    /// One lifecycle pass: kernel creation, destroy fan-out, sweep, and
    /// hook retries.
    pub async fn lifecycle_tick(&self) -> Result<LifecycleTickStats> {
        let stats = LifecycleTickStats {
            kernels_preparing: self.starter.start_scheduled_sessions().await?,
            termination: self.terminator.terminate_sessions().await?,
            sweep: self.sweeper.sweep().await?,
            hooks_retried: self.event_handler.retry_pending_hooks().await?,
        };
        let violations = self.ledger.audit().await;
        if !violations.is_empty() {
            error!(count = violations.len(), "ledger audit found violations");
        }
        Ok(stats)
    }

    /// One fair-share pass: slice unaccounted kernel usage up to `now`.
    /// Returns the number of slices persisted.
    pub async fn fair_share_tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut groups: BTreeSet<String> = self.agents.scaling_groups().await;
        groups.extend(self.sessions.scaling_groups().await);
        let mut total = 0;
        for scaling_group in groups {
            let kernels = self.sessions.kernels_for_usage(&scaling_group).await;
            let mut observations = Vec::with_capacity(kernels.len());
            for kernel in kernels {
                let session = match self.sessions.session(&kernel.session_id).await {
                    Ok(session) => session,
                    Err(err) => {
                        warn!(kernel = %kernel.id, error = %err, "kernel without session row");
                        continue;
                    }
                };
                let Some(starts_at) = kernel.starts_at else {
                    continue;
                };
                observations.push(KernelUsageObservation {
                    kernel_id: kernel.id.clone(),
                    session_id: kernel.session_id.clone(),
                    occupied_slots: kernel.occupied_slots.clone(),
                    starts_at,
                    last_observed_at: kernel.last_observed_at,
                    terminated_at: kernel.terminated_at,
                    domain: session.domain.clone(),
                    project: session.project.clone(),
                    user: session.user.clone(),
                });
            }
            let aggregation = self
                .aggregator
                .prepare_usage_records(&observations, &scaling_group, now);
            if !aggregation.specs.is_empty() {
                self.usage_store.insert_slices(&aggregation.specs).await?;
                total += aggregation.specs.len();
            }
            self.sessions
                .record_usage_observations(&aggregation.observation_times)
                .await;
        }
        Ok(total)
    }

    /// Apply one agent-pushed kernel lifecycle event.
    pub async fn handle_kernel_event(&self, event: &KernelLifecycleEvent) -> Result<()> {
        self.event_handler.handle(event).await
    }
}

/// Runs the three ticks in background tasks with cooperative shutdown.
#[derive(Debug)]
pub struct ManagerDaemon {
    manager: Arc<Manager>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ManagerDaemon {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Spawn the tick loops. Returns immediately.
    pub fn start(&mut self) {
        let config = self.manager.config().clone();

        let manager = self.manager.clone();
        let cancel = self.cancel.clone();
        self.handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.scheduler.tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = manager.scheduler_tick().await {
                            error!(error = %err, "scheduler tick failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }));

        let manager = self.manager.clone();
        let cancel = self.cancel.clone();
        self.handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.lifecycle.tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = manager.lifecycle_tick().await {
                            error!(error = %err, "lifecycle tick failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }));

        let manager = self.manager.clone();
        let cancel = self.cancel.clone();
        self.handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.fair_share.tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = manager.fair_share_tick(Utc::now()).await {
                            error!(error = %err, "fair-share tick failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }));

        info!("manager daemon started");
    }

    /// Request cooperative shutdown of the current ticks.
    pub fn stop(&mut self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the tick tasks to drain.
    pub async fn shutdown(mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("manager daemon stopped");
    }
}
