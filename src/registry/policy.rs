//! Keypair concurrency policies.
//!
//! The full policy tables (domain/project/keypair resource policies) belong
//! to external collaborators; the scheduler only needs the per-access-key
//! concurrency caps, mirrored here. Limits are optional: `None` means
//! unlimited (the policy tables express that as an infinite value).

use std::collections::BTreeMap;

use tokio::sync::RwLock;

use crate::types::AccessKey;

/// Concurrency caps for one access key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeypairPolicy {
    /// Cap on concurrently admitted non-SFTP sessions.
    pub max_concurrent_sessions: Option<usize>,
    /// Cap on concurrently admitted SFTP (SYSTEM) sessions.
    pub max_concurrent_sftp_sessions: Option<usize>,
    /// Cap on sessions waiting in the pending queue.
    pub max_pending_session_count: Option<usize>,
}

/// Per-access-key policy store. Unknown keys get the default (unlimited).
#[derive(Debug, Default)]
pub struct KeypairPolicyStore {
    policies: RwLock<BTreeMap<AccessKey, KeypairPolicy>>,
}

impl KeypairPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, access_key: AccessKey, policy: KeypairPolicy) {
        self.policies.write().await.insert(access_key, policy);
    }

    pub async fn get(&self, access_key: &AccessKey) -> KeypairPolicy {
        self.policies
            .read()
            .await
            .get(access_key)
            .copied()
            .unwrap_or_default()
    }
}
