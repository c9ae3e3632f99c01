//! In-memory registries: the manager's authoritative session/kernel and agent
//! rows, exposed through repository-style query methods.

mod agents;
mod policy;
mod sessions;

pub use agents::AgentRegistry;
pub use policy::{KeypairPolicy, KeypairPolicyStore};
pub use sessions::{
    DependencyVerdict, KernelStatusUpdate, SessionRegistry, TerminationDisposition,
};
