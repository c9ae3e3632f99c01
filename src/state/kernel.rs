//! Kernel state: the smallest schedulable unit.
//!
//! Status transitions:
//! ```text
//! PENDING → SCHEDULED → PREPARING → PULLING? → PREPARED → CREATING → RUNNING
//! RUNNING → TERMINATING → TERMINATED
//! any     → ERROR → TERMINATING → TERMINATED
//! PENDING → CANCELLED
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::ResourceSlot;
use crate::types::{AgentId, KernelId, SessionId};

/// Kernel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum KernelStatus {
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

impl KernelStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            KernelStatus::Terminated | KernelStatus::Cancelled
        )
    }

    /// Stable states sit still between ticks; everything else is expected to
    /// progress within a bounded time or be demoted by the sweep.
    pub fn is_transient(self) -> bool {
        !matches!(
            self,
            KernelStatus::Pending
                | KernelStatus::Scheduled
                | KernelStatus::Running
                | KernelStatus::Terminated
                | KernelStatus::Cancelled
        )
    }

    /// Position on the startup path, if the status is on it.
    pub fn startup_rank(self) -> Option<u8> {
        match self {
            KernelStatus::Pending => Some(0),
            KernelStatus::Scheduled => Some(1),
            KernelStatus::Preparing => Some(2),
            KernelStatus::Pulling => Some(3),
            KernelStatus::Prepared => Some(4),
            KernelStatus::Creating => Some(5),
            KernelStatus::Running => Some(6),
            _ => None,
        }
    }

    /// Check if transition is valid.
    ///
    /// Forward jumps along the startup path are allowed because agents may
    /// coalesce intermediate notifications (e.g. no PULLING when the image is
    /// cached).
    pub fn can_transition_to(self, to: KernelStatus) -> bool {
        // Startup path: strictly forward, skips allowed.
        if let (Some(from_rank), Some(to_rank)) = (self.startup_rank(), to.startup_rank()) {
            return to_rank > from_rank;
        }
        match (self, to) {
            // Shutdown path. TERMINATED may be reached directly when the
            // agent reports a death the manager never asked for, or when the
            // sweep demotes kernels on a LOST agent.
            (from, KernelStatus::Terminating) => !from.is_terminal(),
            (from, KernelStatus::Terminated) => !from.is_terminal(),
            // Fatal sink
            (from, KernelStatus::Error) => !from.is_terminal() && from != KernelStatus::Error,
            // Cancellation is only for kernels that never started.
            (KernelStatus::Pending | KernelStatus::Scheduled, KernelStatus::Cancelled) => true,
            _ => false,
        }
    }
}

/// Role of a kernel within its session's cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    Main,
    Sub,
}

/// A kernel row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelRecord {
    pub id: KernelId,
    pub session_id: SessionId,
    pub cluster_role: ClusterRole,
    pub cluster_idx: u32,
    pub image: String,
    pub architecture: String,
    pub requested_slots: ResourceSlot,
    pub occupied_slots: ResourceSlot,
    pub agent_id: Option<AgentId>,
    pub agent_addr: Option<String>,
    pub status: KernelStatus,
    pub status_changed: DateTime<Utc>,
    pub startup_command: Option<String>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub starts_at: Option<DateTime<Utc>>,
    pub last_observed_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
}

impl KernelRecord {
    pub fn is_main(&self) -> bool {
        self.cluster_role == ClusterRole::Main
    }
}
