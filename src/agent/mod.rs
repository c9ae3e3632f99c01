//! Agent RPC surface.
//!
//! The core never talks wire protocols itself; it calls this trait and an
//! external collaborator supplies the transport. Implementations must make
//! `destroy_kernel` idempotent: the terminator re-issues it on every tick
//! until the kernel-terminated event arrives.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::resource::ResourceSlot;
use crate::state::ClusterRole;
use crate::types::{AgentId, Error, KernelId, Result, SessionId};

/// Everything an agent needs to start one kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelCreationSpec {
    pub kernel_id: KernelId,
    pub session_id: SessionId,
    pub cluster_role: ClusterRole,
    pub cluster_idx: u32,
    pub image: String,
    pub architecture: String,
    pub requested_slots: ResourceSlot,
    pub environ: BTreeMap<String, String>,
    pub bootstrap_script: Option<String>,
    pub startup_command: Option<String>,
}

/// RPC client for one agent.
#[async_trait]
pub trait AgentClient: Send + Sync + fmt::Debug {
    /// Start a batch of kernels for a session. May raise; the caller keeps
    /// the kernels SCHEDULED and retries on the next tick.
    async fn create_kernels(
        &self,
        session_id: &SessionId,
        specs: &[KernelCreationSpec],
    ) -> Result<()>;

    /// Destroy one kernel. Must be idempotent on the agent side.
    async fn destroy_kernel(
        &self,
        kernel_id: &KernelId,
        session_id: &SessionId,
        reason: &str,
        suppress_events: bool,
    ) -> Result<()>;

    /// Kick off the startup command of a BATCH session's main kernel.
    async fn trigger_batch_execution(
        &self,
        session_id: &SessionId,
        kernel_id: &KernelId,
        startup_command: &str,
        batch_timeout: Option<Duration>,
    ) -> Result<()>;
}

/// Client lookup by agent id.
#[derive(Debug, Default)]
pub struct AgentClientPool {
    clients: RwLock<BTreeMap<AgentId, Arc<dyn AgentClient>>>,
}

impl AgentClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, agent_id: AgentId, client: Arc<dyn AgentClient>) {
        self.clients.write().await.insert(agent_id, client);
    }

    pub async fn remove(&self, agent_id: &AgentId) {
        self.clients.write().await.remove(agent_id);
    }

    pub async fn acquire(&self, agent_id: &AgentId) -> Result<Arc<dyn AgentClient>> {
        self.clients
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no client for agent: {agent_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct NullAgentClient;

    #[async_trait]
    impl AgentClient for NullAgentClient {
        async fn create_kernels(
            &self,
            _session_id: &SessionId,
            _specs: &[KernelCreationSpec],
        ) -> Result<()> {
            Ok(())
        }

        async fn destroy_kernel(
            &self,
            _kernel_id: &KernelId,
            _session_id: &SessionId,
            _reason: &str,
            _suppress_events: bool,
        ) -> Result<()> {
            Ok(())
        }

        async fn trigger_batch_execution(
            &self,
            _session_id: &SessionId,
            _kernel_id: &KernelId,
            _startup_command: &str,
            _batch_timeout: Option<Duration>,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn pool_acquire_and_remove() {
        let pool = AgentClientPool::new();
        let agent_id = AgentId::from("i-001");
        pool.register(agent_id.clone(), Arc::new(NullAgentClient)).await;
        assert!(pool.acquire(&agent_id).await.is_ok());

        pool.remove(&agent_id).await;
        assert!(matches!(
            pool.acquire(&agent_id).await,
            Err(Error::NotFound(_))
        ));
    }
}
