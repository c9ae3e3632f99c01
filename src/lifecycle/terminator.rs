//! Batch termination: fan out destroy RPCs for TERMINATING sessions.
//!
//! The terminator never writes kernel statuses itself; TERMINATED is driven
//! by agent events, or by the sweep when the agent is gone. Re-running it is
//! safe because `destroy_kernel` is idempotent on the agent side and slot
//! freeing keys off the allocation's `free_at`.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::agent::AgentClientPool;
use crate::registry::SessionRegistry;
use crate::state::KernelStatus;
use crate::types::{AgentId, Error, KernelId, Result, SessionId};

const DEFAULT_TERMINATION_REASON: &str = "terminated";

/// Counters for one termination pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminationStats {
    /// Destroy RPCs that went out and came back Ok.
    pub destroyed: usize,
    /// Destroy RPCs that failed; retried next tick.
    pub failed: usize,
}

/// Arguments for creating a [`SessionTerminator`].
#[derive(Debug, Clone)]
pub struct SessionTerminatorArgs {
    pub sessions: Arc<SessionRegistry>,
    pub agent_pool: Arc<AgentClientPool>,
    /// Bound on concurrent destroy RPCs per pass.
    pub destroy_concurrency: usize,
    pub rpc_timeout: Duration,
}

/// Fans out kernel destruction for sessions marked TERMINATING.
#[derive(Debug)]
pub struct SessionTerminator {
    sessions: Arc<SessionRegistry>,
    agent_pool: Arc<AgentClientPool>,
    destroy_concurrency: usize,
    rpc_timeout: Duration,
}

struct DestroyJob {
    kernel_id: KernelId,
    session_id: SessionId,
    agent_id: AgentId,
    reason: String,
}

impl SessionTerminator {
    pub fn new(args: SessionTerminatorArgs) -> Self {
        Self {
            sessions: args.sessions,
            agent_pool: args.agent_pool,
            destroy_concurrency: args.destroy_concurrency.max(1),
            rpc_timeout: args.rpc_timeout,
        }
    }

    /// One termination pass over every TERMINATING session.
    ///
    /// Per-kernel failures are isolated: one failing kernel does not cancel
    /// its siblings, and the session simply stays TERMINATING until every
    /// kernel is confirmed gone by events or the sweep.
    pub async fn terminate_sessions(&self) -> Result<TerminationStats> {
        let terminating = self.sessions.terminating_sessions().await;
        let mut jobs = Vec::new();
        for entry in &terminating {
            let reason = entry
                .session
                .status_info
                .clone()
                .unwrap_or_else(|| DEFAULT_TERMINATION_REASON.to_string());
            for kernel in &entry.kernels {
                if kernel.status != KernelStatus::Terminating {
                    continue;
                }
                // Kernels that never reached an agent have nothing to destroy;
                // the sweep finishes them.
                let Some(agent_id) = kernel.agent_id.clone() else {
                    debug!(kernel = %kernel.id, "terminating kernel has no agent");
                    continue;
                };
                jobs.push(DestroyJob {
                    kernel_id: kernel.id.clone(),
                    session_id: entry.session.id.clone(),
                    agent_id,
                    reason: reason.clone(),
                });
            }
        }
        if jobs.is_empty() {
            return Ok(TerminationStats::default());
        }

        let results: Vec<(DestroyJob, Result<()>)> = stream::iter(jobs)
            .map(|job| async {
                let outcome = self.destroy_one(&job).await;
                (job, outcome)
            })
            .buffer_unordered(self.destroy_concurrency)
            .collect()
            .await;

        let mut stats = TerminationStats::default();
        for (job, outcome) in results {
            match outcome {
                Ok(()) => {
                    stats.destroyed += 1;
                    info!(
                        kernel = %job.kernel_id, session = %job.session_id,
                        agent = %job.agent_id, "destroy rpc sent"
                    );
                }
                Err(err) if err.is_retriable() => {
                    stats.failed += 1;
                    warn!(
                        kernel = %job.kernel_id, session = %job.session_id,
                        agent = %job.agent_id, error = %err,
                        "destroy rpc failed; retried next tick"
                    );
                }
                Err(err) => {
                    stats.failed += 1;
                    // A missing client won't heal by retrying; the sweep
                    // finishes these kernels once the agent goes LOST.
                    error!(
                        kernel = %job.kernel_id, session = %job.session_id,
                        agent = %job.agent_id, error = %err,
                        "destroy rpc failed with a non-retriable error"
                    );
                }
            }
        }
        Ok(stats)
    }

    async fn destroy_one(&self, job: &DestroyJob) -> Result<()> {
        let client = self.agent_pool.acquire(&job.agent_id).await?;
        tokio::time::timeout(
            self.rpc_timeout,
            client.destroy_kernel(&job.kernel_id, &job.session_id, &job.reason, false),
        )
        .await
        .map_err(|_| Error::timeout(format!("destroy_kernel to agent {}", job.agent_id)))?
    }
}
