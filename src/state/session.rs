//! Session state: a set of kernels presented to the user as one job.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::ResourceSlot;
use crate::types::{AccessKey, EndpointId, Error, Result, SessionId};

use super::kernel::{KernelRecord, KernelStatus};

/// Default session priority. Higher runs first.
pub const SESSION_PRIORITY_DEFAULT: i32 = 10;

/// Session lifecycle state; mirrors the kernel states it is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Pending,
    Scheduled,
    Preparing,
    Pulling,
    Prepared,
    Creating,
    Running,
    Terminating,
    Terminated,
    Error,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Terminated | SessionStatus::Cancelled)
    }

    /// Sessions counted against keypair concurrency caps: admitted but not
    /// yet gone.
    pub fn is_concurrency_occupying(self) -> bool {
        !matches!(
            self,
            SessionStatus::Pending | SessionStatus::Terminated | SessionStatus::Cancelled
        )
    }

    /// Admitted but not yet running; still deducted from capacity and counted
    /// against caps.
    pub fn is_scheduled_but_not_running(self) -> bool {
        matches!(
            self,
            SessionStatus::Scheduled
                | SessionStatus::Preparing
                | SessionStatus::Pulling
                | SessionStatus::Prepared
                | SessionStatus::Creating
        )
    }
}

/// What the session is for; drives hook dispatch and concurrency caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Interactive,
    Batch,
    Inference,
    /// Cluster-internal sessions (e.g. the SFTP service); capped separately.
    System,
}

/// How the session's kernels are spread over agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterMode {
    SingleNode,
    MultiNode,
}

/// Outcome of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionResult {
    #[default]
    Undefined,
    Success,
    Failure,
}

/// A session row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub access_key: AccessKey,
    /// Ownership scope, carried through to fair-share usage records.
    pub domain: String,
    pub project: String,
    pub user: String,
    pub name: String,
    pub priority: i32,
    pub session_type: SessionType,
    pub cluster_mode: ClusterMode,
    pub cluster_size: u32,
    pub scaling_group: String,
    pub architecture: String,
    pub requested_slots: ResourceSlot,
    pub occupying_slots: ResourceSlot,
    pub status: SessionStatus,
    pub status_info: Option<String>,
    pub result: SessionResult,
    pub created_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub depends_on: BTreeSet<SessionId>,
    pub startup_command: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    pub batch_timeout: Option<Duration>,
    pub bootstrap_script: Option<String>,
    pub environ: BTreeMap<String, String>,
    pub callback_url: Option<String>,
    pub endpoint_id: Option<EndpointId>,
    /// Transition hook that still needs a successful run; retried each
    /// lifecycle tick.
    pub pending_hook: Option<SessionStatus>,
}

/// A session together with its kernels, as loaded for scheduling and hooks.
#[derive(Debug, Clone)]
pub struct SessionWithKernels {
    pub session: SessionRecord,
    pub kernels: Vec<KernelRecord>,
}

impl SessionWithKernels {
    /// The `main` kernel. Every session has exactly one.
    pub fn main_kernel(&self) -> Result<&KernelRecord> {
        self.kernels
            .iter()
            .find(|k| k.is_main())
            .ok_or_else(|| Error::internal(format!("session {} has no main kernel", self.session.id)))
    }
}

fn kernel_to_session_status(status: KernelStatus) -> SessionStatus {
    match status {
        KernelStatus::Pending => SessionStatus::Pending,
        KernelStatus::Scheduled => SessionStatus::Scheduled,
        KernelStatus::Preparing => SessionStatus::Preparing,
        KernelStatus::Pulling => SessionStatus::Pulling,
        KernelStatus::Prepared => SessionStatus::Prepared,
        KernelStatus::Creating => SessionStatus::Creating,
        KernelStatus::Running => SessionStatus::Running,
        KernelStatus::Terminating => SessionStatus::Terminating,
        KernelStatus::Terminated => SessionStatus::Terminated,
        KernelStatus::Error => SessionStatus::Error,
        KernelStatus::Cancelled => SessionStatus::Cancelled,
    }
}

/// Derive a session's aggregate status from its kernels.
///
/// Startup uses the lattice minimum (the session is only as far along as its
/// slowest kernel); shutdown uses the maximum (one terminating kernel makes
/// the whole session terminating until every kernel is gone).
pub fn derive_session_status(kernels: &[KernelStatus]) -> SessionStatus {
    if kernels.is_empty() {
        return SessionStatus::Pending;
    }
    if kernels.iter().any(|s| *s == KernelStatus::Error) {
        return SessionStatus::Error;
    }
    if kernels.iter().all(|s| *s == KernelStatus::Cancelled) {
        return SessionStatus::Cancelled;
    }
    if kernels.iter().all(|s| s.is_terminal()) {
        return SessionStatus::Terminated;
    }
    if kernels
        .iter()
        .any(|s| matches!(s, KernelStatus::Terminating | KernelStatus::Terminated)
            || *s == KernelStatus::Cancelled)
    {
        return SessionStatus::Terminating;
    }
    let slowest = kernels
        .iter()
        .filter_map(|s| s.startup_rank().map(|rank| (rank, *s)))
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, status)| status)
        .unwrap_or(KernelStatus::Pending);
    kernel_to_session_status(slowest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_kernel_status_is_canonical() {
        assert_eq!(
            derive_session_status(&[KernelStatus::Running]),
            SessionStatus::Running
        );
        assert_eq!(
            derive_session_status(&[KernelStatus::Pending]),
            SessionStatus::Pending
        );
    }

    #[test]
    fn startup_takes_the_minimum() {
        assert_eq!(
            derive_session_status(&[KernelStatus::Running, KernelStatus::Preparing]),
            SessionStatus::Preparing
        );
        assert_eq!(
            derive_session_status(&[KernelStatus::Creating, KernelStatus::Pulling]),
            SessionStatus::Pulling
        );
    }

    #[test]
    fn shutdown_takes_the_maximum() {
        assert_eq!(
            derive_session_status(&[KernelStatus::Running, KernelStatus::Terminating]),
            SessionStatus::Terminating
        );
        assert_eq!(
            derive_session_status(&[KernelStatus::Running, KernelStatus::Terminated]),
            SessionStatus::Terminating
        );
        assert_eq!(
            derive_session_status(&[KernelStatus::Terminated, KernelStatus::Terminated]),
            SessionStatus::Terminated
        );
    }

    #[test]
    fn error_dominates() {
        assert_eq!(
            derive_session_status(&[KernelStatus::Running, KernelStatus::Error]),
            SessionStatus::Error
        );
    }

    #[test]
    fn all_cancelled_is_cancelled() {
        assert_eq!(
            derive_session_status(&[KernelStatus::Cancelled, KernelStatus::Cancelled]),
            SessionStatus::Cancelled
        );
        // A mix of cancelled and terminated is still a finished session.
        assert_eq!(
            derive_session_status(&[KernelStatus::Cancelled, KernelStatus::Terminated]),
            SessionStatus::Terminated
        );
    }
}
