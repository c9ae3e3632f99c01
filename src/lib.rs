//! # Berth Core - Compute Session Scheduling Kernel
//!
//! Rust implementation of the scheduling and session lifecycle core for a
//! multi-tenant compute cluster:
//! - Pending-queue scheduling per resource group (FIFO / LIFO / DRF)
//! - Strategy-driven agent placement under capacity constraints
//! - Transactional resource-slot ledger with audit-trail allocations
//! - Session/kernel state machine with agent RPC fan-out
//! - Fair-share usage aggregation into five-minute slices
//! - Status-keyed transition hooks (batch trigger, endpoint routing)
//!
//! ## Architecture
//!
//! A single `Manager` facade owns the subsystems; background ticks drive it:
//! ```text
//!                     ┌───────────────────────────────────┐
//!   enqueue/terminate │            Manager                │
//!        agent events │  ┌─────────┐ ┌──────────────────┐ │
//!                  →  │  │Resource │ │ Scheduler Engine │ │
//!                     │  │ Ledger  │ │ (picker+selector)│ │
//!                     │  └─────────┘ └──────────────────┘ │
//!                     │  ┌─────────┐ ┌─────────┐ ┌──────┐ │
//!                     │  │Lifecycle│ │  Hooks  │ │ Fair │ │
//!                     │  │ + Sweep │ │Registry │ │Share │ │
//!                     │  └─────────┘ └─────────┘ └──────┘ │
//!                     └───────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod agent;
pub mod events;
pub mod fair_share;
pub mod hooks;
pub mod lifecycle;
pub mod manager;
pub mod registry;
pub mod resource;
pub mod scheduler;
pub mod state;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
