//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the scheduling kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation errors on inbound requests.
    #[error("validation error: {0}")]
    Validation(String),

    /// Entity not found (session, kernel, agent, allocation).
    #[error("not found: {0}")]
    NotFound(String),

    /// Allocation would exceed an agent's slot capacity.
    ///
    /// Caught by the scheduler; the session stays PENDING and another agent
    /// is tried on the same or a later tick.
    #[error("agent resource capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Unknown resource slot name. Fatal for the request.
    #[error("resource slot type not found: {0}")]
    SlotTypeNotFound(String),

    /// Invalid session/kernel status transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Bad manager or resource-group configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Agent RPC failure (retriable on the next tick).
    #[error("agent rpc error: {0}")]
    Rpc(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Cancellation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn capacity_exceeded(msg: impl Into<String>) -> Self {
        Self::CapacityExceeded(msg.into())
    }

    pub fn slot_type_not_found(msg: impl Into<String>) -> Self {
        Self::SlotTypeNotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn rpc(msg: impl Into<String>) -> Self {
        Self::Rpc(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}

impl Error {
    /// Whether the scheduler should retry the operation on a later tick
    /// instead of surfacing the failure.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::CapacityExceeded(_) | Error::Rpc(_) | Error::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(Error::capacity_exceeded("cpu over").is_retriable());
        assert!(Error::rpc("connection reset").is_retriable());
        assert!(Error::timeout("deadline").is_retriable());
        assert!(!Error::validation("bad request").is_retriable());
        assert!(!Error::slot_type_not_found("fpga.cells").is_retriable());
    }
}
