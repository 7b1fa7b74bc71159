//! Veil error types and the status surface returned to clients

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::BusError;

/// Result type for Veil operations
pub type Result<T> = std::result::Result<T, VeilError>;

/// Errors produced by the core
#[derive(Debug, Error)]
pub enum VeilError {
    /// Caller broke the request contract; nothing was touched
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Request or result buffer has the wrong size
    #[error("Invalid buffer size: expected {expected} bytes, got {actual}")]
    InvalidSize { expected: usize, actual: usize },

    /// Output buffer was empty; `needed` bytes are required
    #[error("Buffer overflow: {needed} bytes required")]
    BufferOverflow { needed: usize },

    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported request code {0:#x}")]
    Unsupported(u32),

    /// Collaborator interfaces are not acquired
    #[error("Device not ready")]
    DeviceNotReady,

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Request cancelled")]
    Cancelled,
}

impl VeilError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Map to the status reported to the client
    pub fn status(&self) -> Status {
        match self {
            Self::InvalidParameter(_) => Status::InvalidParameter,
            Self::InvalidSize { .. } => Status::InvalidSize,
            Self::BufferOverflow { .. } => Status::BufferOverflow,
            Self::ResourceExhausted(_) => Status::ResourceExhausted,
            Self::NotFound(_) => Status::NotFound,
            Self::Unsupported(_) => Status::UnsupportedRequest,
            Self::DeviceNotReady => Status::DeviceNotReady,
            Self::Cancelled => Status::Cancelled,
            Self::Bus(e) => e.status(),
        }
    }
}

/// Completion status of a request
///
/// The numeric codes are stable and travel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Pending,
    InvalidParameter,
    InvalidSize,
    BufferOverflow,
    ResourceExhausted,
    NotFound,
    UnsupportedRequest,
    DeviceNotReady,
    Cancelled,
    /// Collaborator failure with no closer match
    Unsuccessful,
}

impl Status {
    pub const fn code(self) -> u32 {
        match self {
            Status::Success => 0x0000_0000,
            Status::Pending => 0x0000_0103,
            Status::BufferOverflow => 0x8000_0005,
            Status::Unsuccessful => 0xC000_0001,
            Status::InvalidParameter => 0xC000_000D,
            Status::UnsupportedRequest => 0xC000_0010,
            Status::ResourceExhausted => 0xC000_009A,
            Status::DeviceNotReady => 0xC000_00A3,
            Status::Cancelled => 0xC000_0120,
            Status::InvalidSize => 0xC000_0206,
            Status::NotFound => 0xC000_0225,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        [
            Status::Success,
            Status::Pending,
            Status::InvalidParameter,
            Status::InvalidSize,
            Status::BufferOverflow,
            Status::ResourceExhausted,
            Status::NotFound,
            Status::UnsupportedRequest,
            Status::DeviceNotReady,
            Status::Cancelled,
            Status::Unsuccessful,
        ]
        .into_iter()
        .find(|s| s.code() == code)
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({:#010x})", self, self.code())
    }
}

/// Report a broken teardown invariant and stop
///
/// Used where a resource can no longer be returned to the bus (a grant
/// that will not revoke, a mapping that will not unmap, a watch that
/// will not unregister). Continuing would leave foreign access open.
#[track_caller]
pub fn invariant_violation(what: &str, err: &dyn std::fmt::Display) -> ! {
    tracing::error!(%err, "invariant violation: {}", what);
    panic!("invariant violation: {what}: {err}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_roundtrip() {
        for status in [Status::Success, Status::Pending, Status::NotFound, Status::Cancelled] {
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
        assert_eq!(Status::from_code(0xdead_beef), None);
    }

    #[test]
    fn test_bus_errors_map_to_status() {
        assert_eq!(VeilError::from(BusError::OutOfResources).status(), Status::ResourceExhausted);
        assert_eq!(VeilError::from(BusError::NotFound).status(), Status::NotFound);
        assert_eq!(
            VeilError::from(BusError::Rejected { code: -22 }).status(),
            Status::Unsuccessful
        );
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn test_invariant_violation_panics() {
        invariant_violation("revoke", &BusError::Unavailable);
    }
}
