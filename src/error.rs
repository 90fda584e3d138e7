//! Error taxonomy for the QXL bridge
//!
//! Transient resource pressure (`AllocationFailed`, `CapacityExceeded`) is
//! absorbed by the caller: the frame or command is dropped and the next
//! repaint cycle tries again. Configuration and protocol errors are fatal;
//! the binary exits on them instead of continuing with corrupted state.

use thiserror::Error;

/// All errors produced by the bridge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Heap exhaustion while building a command or a surface backing
    #[error("allocation failed: {what}")]
    AllocationFailed { what: String },

    /// A bounded resource (surfaces, command ring) is full
    #[error("{resource} capacity exceeded (limit {limit})")]
    CapacityExceeded { resource: &'static str, limit: usize },

    /// Bad startup configuration
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A structural invariant of the server session was broken
    #[error("protocol invariant violated: {0}")]
    ProtocolInvariantViolation(String),

    /// A release handle that is not in flight (already released or never issued)
    #[error("release handle {0:#x} is not in flight")]
    UnknownRelease(u64),

    /// A rectangle the supplied pixels cannot cover
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}

impl BridgeError {
    /// Whether the process must stop rather than skip the operation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::ConfigInvalid(_) | BridgeError::ProtocolInvariantViolation(_)
        )
    }

    pub(crate) fn allocation(what: impl Into<String>) -> Self {
        BridgeError::AllocationFailed { what: what.into() }
    }

    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        BridgeError::ProtocolInvariantViolation(msg.into())
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(BridgeError::ConfigInvalid("port".into()).is_fatal());
        assert!(BridgeError::violation("second worker").is_fatal());
        assert!(!BridgeError::allocation("frame").is_fatal());
        assert!(!BridgeError::CapacityExceeded { resource: "surface", limit: 2 }.is_fatal());
        assert!(!BridgeError::UnknownRelease(7).is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = BridgeError::CapacityExceeded { resource: "command ring", limit: 4 };
        assert_eq!(err.to_string(), "command ring capacity exceeded (limit 4)");
        assert_eq!(
            BridgeError::UnknownRelease(0x10).to_string(),
            "release handle 0x10 is not in flight"
        );
    }
}
