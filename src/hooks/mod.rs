//! Status-based transition hooks.
//!
//! Hooks run after a session has successfully entered the target status, in
//! their own failure domain: a failing hook never reverts the transition, it
//! is retried by the next lifecycle tick. Every hook must therefore be
//! idempotent.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::agent::AgentClientPool;
use crate::events::{ClusterEvent, EventProducer};
use crate::registry::SessionRegistry;
use crate::resource::ResourceSlot;
use crate::state::{SessionStatus, SessionType, SessionWithKernels};
use crate::types::{EndpointId, Error, Result};

/// One status-keyed side effect.
#[async_trait]
pub trait TransitionHook: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Execute the hook for a session that just entered the target status.
    async fn execute(&self, session: &SessionWithKernels) -> Result<()>;
}

/// Endpoint routing seam owned by the deployment subsystem.
#[async_trait]
pub trait DeploymentRepository: Send + Sync + fmt::Debug {
    /// Recompute the endpoint's route list from its live sessions.
    async fn update_endpoint_route_info(&self, endpoint_id: &EndpointId) -> Result<()>;
}

/// Deployment repository for setups without model serving.
#[derive(Debug, Default)]
pub struct NoopDeploymentRepository;

#[async_trait]
impl DeploymentRepository for NoopDeploymentRepository {
    async fn update_endpoint_route_info(&self, _endpoint_id: &EndpointId) -> Result<()> {
        Ok(())
    }
}

/// Arguments for creating a [`HookRegistry`].
#[derive(Debug, Clone)]
pub struct HookRegistryArgs {
    pub sessions: Arc<SessionRegistry>,
    pub agent_pool: Arc<AgentClientPool>,
    pub deployments: Arc<dyn DeploymentRepository>,
    pub events: Arc<dyn EventProducer>,
}

/// Registry of status-based transition hooks.
#[derive(Debug)]
pub struct HookRegistry {
    hooks: BTreeMap<SessionStatus, Arc<dyn TransitionHook>>,
}

impl HookRegistry {
    pub fn new(args: HookRegistryArgs) -> Self {
        let mut hooks: BTreeMap<SessionStatus, Arc<dyn TransitionHook>> = BTreeMap::new();
        hooks.insert(
            SessionStatus::Running,
            Arc::new(RunningTransitionHook {
                sessions: args.sessions,
                agent_pool: args.agent_pool,
                deployments: args.deployments.clone(),
                events: args.events.clone(),
            }),
        );
        hooks.insert(
            SessionStatus::Terminated,
            Arc::new(TerminatedTransitionHook {
                deployments: args.deployments,
                events: args.events,
            }),
        );
        Self { hooks }
    }

    /// The hook for a status transition, or `None` when no side effect is
    /// needed.
    pub fn get_hook(&self, status: SessionStatus) -> Option<Arc<dyn TransitionHook>> {
        self.hooks.get(&status).cloned()
    }
}

/// Hook executed when sessions transition to RUNNING.
///
/// Common: write the session's occupying slots. BATCH: trigger the startup
/// command. INFERENCE: publish the new route.
#[derive(Debug)]
struct RunningTransitionHook {
    sessions: Arc<SessionRegistry>,
    agent_pool: Arc<AgentClientPool>,
    deployments: Arc<dyn DeploymentRepository>,
    events: Arc<dyn EventProducer>,
}

#[async_trait]
impl TransitionHook for RunningTransitionHook {
    fn name(&self) -> &'static str {
        "running"
    }

    async fn execute(&self, entry: &SessionWithKernels) -> Result<()> {
        // 1. Common: occupying slots become real.
        let occupying = entry
            .kernels
            .iter()
            .fold(ResourceSlot::new(), |acc, k| acc + k.occupied_slots.clone());
        self.sessions
            .set_occupying_slots(&entry.session.id, occupying)
            .await?;

        // 2. Session-type specific work.
        match entry.session.session_type {
            SessionType::Batch => self.trigger_batch(entry).await,
            SessionType::Inference => {
                publish_route_update(
                    &self.deployments,
                    &self.events,
                    entry,
                    "created",
                )
                .await
            }
            _ => {
                debug!(
                    session = %entry.session.id,
                    "no specific RUNNING hook for this session type"
                );
                Ok(())
            }
        }
    }
}

impl RunningTransitionHook {
    async fn trigger_batch(&self, entry: &SessionWithKernels) -> Result<()> {
        let main_kernel = entry.main_kernel()?;
        let agent_id = main_kernel.agent_id.clone().ok_or_else(|| {
            Error::internal(format!(
                "main kernel has no agent assigned for session {}",
                entry.session.id
            ))
        })?;
        let client = self.agent_pool.acquire(&agent_id).await?;
        client
            .trigger_batch_execution(
                &entry.session.id,
                &main_kernel.id,
                main_kernel.startup_command.as_deref().unwrap_or(""),
                entry.session.batch_timeout,
            )
            .await?;
        info!(
            session = %entry.session.id, agent = %agent_id,
            "triggered batch execution"
        );
        Ok(())
    }
}

/// Hook executed when sessions transition to TERMINATED.
///
/// INFERENCE: republish routes so the proxy drops the dead one; everything
/// else is a no-op.
#[derive(Debug)]
struct TerminatedTransitionHook {
    deployments: Arc<dyn DeploymentRepository>,
    events: Arc<dyn EventProducer>,
}

#[async_trait]
impl TransitionHook for TerminatedTransitionHook {
    fn name(&self) -> &'static str {
        "terminated"
    }

    async fn execute(&self, entry: &SessionWithKernels) -> Result<()> {
        match entry.session.session_type {
            SessionType::Inference => {
                publish_route_update(&self.deployments, &self.events, entry, "removed").await
            }
            _ => {
                debug!(
                    session = %entry.session.id,
                    "no specific TERMINATED hook for this session type"
                );
                Ok(())
            }
        }
    }
}

async fn publish_route_update(
    deployments: &Arc<dyn DeploymentRepository>,
    events: &Arc<dyn EventProducer>,
    entry: &SessionWithKernels,
    change: &str,
) -> Result<()> {
    let Some(endpoint_id) = entry.session.endpoint_id.clone() else {
        warn!(
            session = %entry.session.id,
            "inference session has no endpoint; skipping route update"
        );
        return Ok(());
    };
    deployments.update_endpoint_route_info(&endpoint_id).await?;
    events
        .anycast(ClusterEvent::EndpointRouteListUpdated(endpoint_id.clone()))
        .await?;
    info!(
        session = %entry.session.id, endpoint = %endpoint_id, change,
        "endpoint route list updated"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelEventProducer;
    use crate::state::{
        ClusterMode, ClusterRole, KernelRecord, KernelStatus, SessionRecord, SessionResult,
    };
    use crate::types::{AccessKey, AgentId, KernelId, SessionId};
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Default)]
    struct RecordingDeploymentRepository {
        updates: StdMutex<Vec<EndpointId>>,
    }

    #[async_trait]
    impl DeploymentRepository for RecordingDeploymentRepository {
        async fn update_endpoint_route_info(&self, endpoint_id: &EndpointId) -> Result<()> {
            self.updates.lock().unwrap().push(endpoint_id.clone());
            Ok(())
        }
    }

    fn inference_session(endpoint_id: Option<EndpointId>) -> SessionWithKernels {
        let session_id = SessionId::new();
        let now = Utc::now();
        let kernel = KernelRecord {
            id: KernelId::new(),
            session_id: session_id.clone(),
            cluster_role: ClusterRole::Main,
            cluster_idx: 0,
            image: "model:latest".into(),
            architecture: "x86_64".into(),
            requested_slots: ResourceSlot::from_pairs([("cpu", "1")]).unwrap(),
            occupied_slots: ResourceSlot::from_pairs([("cpu", "1")]).unwrap(),
            agent_id: Some(AgentId::from("i-001")),
            agent_addr: Some("10.0.1.1:6001".into()),
            status: KernelStatus::Running,
            status_changed: now,
            startup_command: None,
            exit_code: None,
            created_at: now,
            starts_at: Some(now),
            last_observed_at: None,
            terminated_at: None,
        };
        SessionWithKernels {
            session: SessionRecord {
                id: session_id,
                access_key: AccessKey::from("user01"),
                domain: "default".into(),
                project: "default".into(),
                user: "user".into(),
                name: "svc".into(),
                priority: 10,
                session_type: SessionType::Inference,
                cluster_mode: ClusterMode::SingleNode,
                cluster_size: 1,
                scaling_group: "sg01".into(),
                architecture: "x86_64".into(),
                requested_slots: ResourceSlot::from_pairs([("cpu", "1")]).unwrap(),
                occupying_slots: ResourceSlot::new(),
                status: SessionStatus::Running,
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
                endpoint_id,
                pending_hook: None,
            },
            kernels: vec![kernel],
        }
    }

    fn registry_with(
        deployments: Arc<dyn DeploymentRepository>,
        events: Arc<dyn EventProducer>,
    ) -> HookRegistry {
        HookRegistry::new(HookRegistryArgs {
            sessions: Arc::new(SessionRegistry::new()),
            agent_pool: Arc::new(AgentClientPool::new()),
            deployments,
            events,
        })
    }

    #[tokio::test]
    async fn terminated_hook_republishes_inference_routes() {
        let deployments = Arc::new(RecordingDeploymentRepository::default());
        let (events, mut rx) = ChannelEventProducer::channel();
        let registry = registry_with(deployments.clone(), events);

        let endpoint = EndpointId::new();
        let entry = inference_session(Some(endpoint.clone()));
        let hook = registry.get_hook(SessionStatus::Terminated).unwrap();
        hook.execute(&entry).await.unwrap();

        assert_eq!(deployments.updates.lock().unwrap().as_slice(), &[endpoint.clone()]);
        assert_eq!(
            rx.recv().await,
            Some(ClusterEvent::EndpointRouteListUpdated(endpoint))
        );
    }

    #[tokio::test]
    async fn missing_endpoint_skips_route_update() {
        let deployments = Arc::new(RecordingDeploymentRepository::default());
        let (events, _rx) = ChannelEventProducer::channel();
        let registry = registry_with(deployments.clone(), events);

        let entry = inference_session(None);
        let hook = registry.get_hook(SessionStatus::Terminated).unwrap();
        hook.execute(&entry).await.unwrap();
        assert!(deployments.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_hooks_for_intermediate_statuses() {
        let deployments = Arc::new(NoopDeploymentRepository);
        let (events, _rx) = ChannelEventProducer::channel();
        let registry = registry_with(deployments, events);
        assert!(registry.get_hook(SessionStatus::Preparing).is_none());
        assert!(registry.get_hook(SessionStatus::Scheduled).is_none());
        assert!(registry.get_hook(SessionStatus::Running).is_some());
        assert!(registry.get_hook(SessionStatus::Terminated).is_some());
    }
}
