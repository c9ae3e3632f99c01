//! The pending-queue scheduler: session picking, agent selection, and the
//! scheduling tick that converts PENDING sessions into SCHEDULED ones.

mod engine;
mod picker;
mod selector;

pub use engine::{ScheduleStats, SchedulerEngine, SchedulerEngineArgs};
pub use picker::{create_session_picker, PickContext, SessionPicker};
pub use selector::{
    create_agent_selector, AgentCandidate, AgentSelector, InMemoryStateStore,
    ResourceGroupStateStore, SessionWorkload,
};
