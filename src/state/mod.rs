//! Session, kernel, and agent state: status enums with validated transitions
//! and the record types the registries store.

mod agent;
mod kernel;
mod session;

pub use agent::{AgentRecord, AgentStatus};
pub use kernel::{ClusterRole, KernelRecord, KernelStatus};
pub use session::{
    derive_session_status, ClusterMode, SessionRecord, SessionResult, SessionStatus, SessionType,
    SessionWithKernels, SESSION_PRIORITY_DEFAULT,
};
