//! The lifecycle tick's startup half: SCHEDULED kernels are shipped to their
//! agents via `create_kernels` and move to PREPARING on success.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{error, info, warn};

use crate::agent::{AgentClientPool, KernelCreationSpec};
use crate::registry::SessionRegistry;
use crate::state::{KernelStatus, SessionStatus, SessionWithKernels};
use crate::types::{AgentId, Error, KernelId, Result};

/// Arguments for creating a [`SessionStarter`].
#[derive(Debug, Clone)]
pub struct SessionStarterArgs {
    pub sessions: Arc<SessionRegistry>,
    pub agent_pool: Arc<AgentClientPool>,
    pub rpc_timeout: Duration,
}

/// Advances SCHEDULED sessions towards RUNNING.
#[derive(Debug)]
pub struct SessionStarter {
    sessions: Arc<SessionRegistry>,
    agent_pool: Arc<AgentClientPool>,
    rpc_timeout: Duration,
}

impl SessionStarter {
    pub fn new(args: SessionStarterArgs) -> Self {
        Self {
            sessions: args.sessions,
            agent_pool: args.agent_pool,
            rpc_timeout: args.rpc_timeout,
        }
    }

    /// Ship kernel-creation RPCs for every SCHEDULED session. Returns the
    /// number of kernels now PREPARING. Failed agent groups keep their
    /// kernels SCHEDULED and are retried next tick.
    pub async fn start_scheduled_sessions(&self) -> Result<usize> {
        let mut advanced = 0;
        for entry in self
            .sessions
            .sessions_in_status(SessionStatus::Scheduled)
            .await
        {
            advanced += self.start_session(&entry).await?;
        }
        Ok(advanced)
    }

    async fn start_session(&self, entry: &SessionWithKernels) -> Result<usize> {
        let session_id = &entry.session.id;

        // Group still-scheduled kernels by their agent; kernels already
        // PREPARING from an earlier partial tick are not re-sent.
        let mut by_agent: BTreeMap<AgentId, Vec<&_>> = BTreeMap::new();
        for kernel in &entry.kernels {
            if kernel.status != KernelStatus::Scheduled {
                continue;
            }
            let agent_id = kernel.agent_id.clone().ok_or_else(|| {
                Error::internal(format!("scheduled kernel {} has no agent", kernel.id))
            })?;
            by_agent.entry(agent_id).or_default().push(kernel);
        }
        if by_agent.is_empty() {
            return Ok(0);
        }

        let calls = by_agent.into_iter().map(|(agent_id, kernels)| {
            let specs: Vec<KernelCreationSpec> = kernels
                .iter()
                .map(|k| KernelCreationSpec {
                    kernel_id: k.id.clone(),
                    session_id: session_id.clone(),
                    cluster_role: k.cluster_role,
                    cluster_idx: k.cluster_idx,
                    image: k.image.clone(),
                    architecture: k.architecture.clone(),
                    requested_slots: k.requested_slots.clone(),
                    environ: entry.session.environ.clone(),
                    bootstrap_script: entry.session.bootstrap_script.clone(),
                    startup_command: k.startup_command.clone(),
                })
                .collect();
            let kernel_ids: Vec<KernelId> = kernels.iter().map(|k| k.id.clone()).collect();
            async move {
                let outcome = async {
                    let client = self.agent_pool.acquire(&agent_id).await?;
                    tokio::time::timeout(
                        self.rpc_timeout,
                        client.create_kernels(session_id, &specs),
                    )
                    .await
                    .map_err(|_| {
                        Error::timeout(format!("create_kernels to agent {agent_id}"))
                    })?
                }
                .await;
                (agent_id, kernel_ids, outcome)
            }
        });

        // Per-agent failure isolation: one failing agent leaves only its own
        // kernels SCHEDULED.
        let mut advanced = 0;
        for (agent_id, kernel_ids, outcome) in join_all(calls).await {
            match outcome {
                Ok(()) => {
                    for kernel_id in &kernel_ids {
                        self.sessions
                            .update_kernel_status(kernel_id, KernelStatus::Preparing, None)
                            .await?;
                        advanced += 1;
                    }
                    info!(
                        session = %session_id, agent = %agent_id,
                        kernels = kernel_ids.len(), "kernels moved to preparing"
                    );
                }
                Err(err) if err.is_retriable() => {
                    warn!(
                        session = %session_id, agent = %agent_id, error = %err,
                        "create_kernels failed; kernels stay scheduled for retry"
                    );
                }
                Err(err) => {
                    error!(
                        session = %session_id, agent = %agent_id, error = %err,
                        "create_kernels failed with a non-retriable error; \
                         kernels stay scheduled"
                    );
                }
            }
        }
        Ok(advanced)
    }
}
