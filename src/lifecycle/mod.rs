//! Session lifecycle driving: kernel creation fan-out, batch termination,
//! agent-event application, and the stale-state sweep.

mod events;
mod starter;
mod sweep;
mod terminator;

pub use events::KernelEventHandler;
pub use starter::{SessionStarter, SessionStarterArgs};
pub use sweep::{LifecycleSweeper, LifecycleSweeperArgs, SweepStats};
pub use terminator::{SessionTerminator, SessionTerminatorArgs, TerminationStats};
