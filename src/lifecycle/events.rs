//! Applying agent-pushed kernel lifecycle events to the state machine.
//!
//! Status writes and hook execution run in separate failure domains: a hook
//! failure never reverts the transition, it only parks a pending-hook marker
//! that the next lifecycle tick retries.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::events::{KernelEventKind, KernelLifecycleEvent};
use crate::hooks::HookRegistry;
use crate::registry::SessionRegistry;
use crate::resource::ResourceLedger;
use crate::state::{SessionStatus, SessionWithKernels};
use crate::types::{Error, Result, SessionId};

/// Applies kernel events, frees slots, and dispatches transition hooks.
#[derive(Debug)]
pub struct KernelEventHandler {
    sessions: Arc<SessionRegistry>,
    ledger: Arc<ResourceLedger>,
    hooks: Arc<HookRegistry>,
}

impl KernelEventHandler {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        ledger: Arc<ResourceLedger>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            sessions,
            ledger,
            hooks,
        }
    }

    /// Apply one agent event. Stale or duplicate notifications are dropped;
    /// everything else moves the kernel, possibly the session, and fires the
    /// session hook for the new status.
    pub async fn handle(&self, event: &KernelLifecycleEvent) -> Result<()> {
        let target = event.kind.target_status();
        let update = match self
            .sessions
            .update_kernel_status(&event.kernel_id, target, event.exit_code)
            .await
        {
            Ok(update) => update,
            Err(Error::StateTransition(msg)) => {
                debug!(kernel = %event.kernel_id, %msg, "dropping stale kernel event");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if !update.kernel_changed {
            return Ok(());
        }

        // A dead kernel's slots go back to the pool exactly once.
        if event.kind == KernelEventKind::Terminated {
            let kernel = self.sessions.kernel(&event.kernel_id).await?;
            if let Some(agent_id) = &kernel.agent_id {
                self.ledger.free_resources(&kernel.id, agent_id).await?;
            }
        }

        if update.session_changed() {
            let kernel = self.sessions.kernel(&event.kernel_id).await?;
            self.dispatch_hook(&kernel.session_id, update.new_session_status)
                .await?;
        }
        Ok(())
    }

    /// Retry hooks that failed on a previous tick.
    pub async fn retry_pending_hooks(&self) -> Result<usize> {
        let mut retried = 0;
        for (entry, status) in self.sessions.sessions_with_pending_hooks().await {
            if self.run_hook(&entry, status).await {
                retried += 1;
            }
        }
        Ok(retried)
    }

    async fn dispatch_hook(&self, session_id: &SessionId, status: SessionStatus) -> Result<()> {
        if self.hooks.get_hook(status).is_none() {
            return Ok(());
        }
        let entry = self.sessions.session_with_kernels(session_id).await?;
        self.run_hook(&entry, status).await;
        Ok(())
    }

    /// Execute one hook; true on success. Failures park a pending-hook
    /// marker for the next tick.
    async fn run_hook(&self, entry: &SessionWithKernels, status: SessionStatus) -> bool {
        let Some(hook) = self.hooks.get_hook(status) else {
            // Hook was registered when parked but is gone now; drop the marker.
            let _ = self
                .sessions
                .set_pending_hook(&entry.session.id, None)
                .await;
            return false;
        };
        match hook.execute(entry).await {
            Ok(()) => {
                let _ = self
                    .sessions
                    .set_pending_hook(&entry.session.id, None)
                    .await;
                true
            }
            Err(err) => {
                // Hooks are parked for retry either way; non-retriable
                // failures get a louder log since another attempt is
                // unlikely to fix them.
                if err.is_retriable() {
                    warn!(
                        session = %entry.session.id, hook = hook.name(), error = %err,
                        "transition hook failed; will retry next tick"
                    );
                } else {
                    error!(
                        session = %entry.session.id, hook = hook.name(), error = %err,
                        "transition hook failed with a non-retriable error; \
                         will retry next tick"
                    );
                }
                let _ = self
                    .sessions
                    .set_pending_hook(&entry.session.id, Some(status))
                    .await;
                false
            }
        }
    }
}
