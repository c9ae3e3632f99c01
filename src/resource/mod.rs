//! Resource accounting: slot names, slot maps, and the allocation ledger.
//!
//! The ledger is the single source of truth for how much of each slot is in
//! use on each agent and which kernel owns it. No other component mutates
//! agent usage or allocation rows.

mod catalog;
mod ledger;
mod slot;

pub use catalog::SlotTypeCatalog;
pub use ledger::{AgentResource, ResourceAllocation, ResourceLedger};
pub use slot::{ResourceSlot, SlotKind, SlotName, SlotType};
