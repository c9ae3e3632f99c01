//! The lifecycle sweep: force-terminate kernels stranded on LOST agents.
//!
//! An agent that drops off and comes back (e.g. a hard node restart) must
//! not resurrect the kernels it hosted during the outage: once the dwell
//! expires, their rows go TERMINATED and their slots are freed. Hooks for
//! the resulting session transitions are parked as pending and picked up by
//! the lifecycle tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::registry::{AgentRegistry, SessionRegistry};
use crate::resource::ResourceLedger;
use crate::state::{KernelStatus, SessionStatus};
use crate::types::Result;

/// Counters for one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Kernels force-marked TERMINATED.
    pub kernels_terminated: usize,
    /// Sessions that reached a terminal status because of the sweep.
    pub sessions_closed: usize,
}

/// Arguments for creating a [`LifecycleSweeper`].
#[derive(Debug, Clone)]
pub struct LifecycleSweeperArgs {
    pub sessions: Arc<SessionRegistry>,
    pub agents: Arc<AgentRegistry>,
    pub ledger: Arc<ResourceLedger>,
    /// How long an agent may stay LOST before its kernels are demoted.
    pub lost_agent_grace: Duration,
}

/// Demotes kernels whose agents have been LOST beyond the dwell time.
#[derive(Debug)]
pub struct LifecycleSweeper {
    sessions: Arc<SessionRegistry>,
    agents: Arc<AgentRegistry>,
    ledger: Arc<ResourceLedger>,
    lost_agent_grace: Duration,
}

impl LifecycleSweeper {
    pub fn new(args: LifecycleSweeperArgs) -> Self {
        Self {
            sessions: args.sessions,
            agents: args.agents,
            ledger: args.ledger,
            lost_agent_grace: args.lost_agent_grace,
        }
    }

    pub async fn sweep(&self) -> Result<SweepStats> {
        let grace = chrono::Duration::from_std(self.lost_agent_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let now = Utc::now();
        let mut stats = SweepStats::default();

        for agent in self.agents.lost_agents().await {
            let Some(lost_at) = agent.lost_at else {
                continue;
            };
            if now - lost_at < grace {
                continue;
            }
            for kernel in self.sessions.kernels_on_agent(&agent.id).await {
                match self
                    .sessions
                    .update_kernel_status(&kernel.id, KernelStatus::Terminated, None)
                    .await
                {
                    Ok(update) => {
                        info!(
                            kernel = %kernel.id, agent = %agent.id,
                            "force-terminated kernel on lost agent"
                        );
                        stats.kernels_terminated += 1;
                        self.ledger.free_resources(&kernel.id, &agent.id).await?;
                        if update.session_changed() && update.new_session_status.is_terminal() {
                            stats.sessions_closed += 1;
                            if update.new_session_status == SessionStatus::Terminated {
                                // Park the TERMINATED hook for the lifecycle tick.
                                self.sessions
                                    .set_pending_hook(
                                        &kernel.session_id,
                                        Some(SessionStatus::Terminated),
                                    )
                                    .await?;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(
                            kernel = %kernel.id, agent = %agent.id, error = %err,
                            "sweep could not demote kernel"
                        );
                    }
                }
            }
        }
        Ok(stats)
    }
}
