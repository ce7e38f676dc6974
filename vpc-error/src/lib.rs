//! Unified error handling for YogaVPC
//!
//! This crate provides the single error type shared by the core library, the
//! daemon and the client. Every failure that can reach a caller maps onto one
//! of the [`ErrorKind`] categories, which is what travels over the wire.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// Result type alias using VpcError
pub type Result<T> = std::result::Result<T, VpcError>;

/// Failure category reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The platform firmware does not export the method. Permanent.
    MethodMissing,
    /// The method ran but returned an error or garbage. Retried only on request.
    EvaluationFailed,
    /// No device handle is bound (not attached, detached, or asleep).
    DeviceUnavailable,
    /// A serializer turn exceeded its bound.
    Timeout,
    /// Unknown property name or out-of-range value. Never reaches hardware.
    ValueInvalid,
    /// The caller may not drive the hardware. Only reported over IPC.
    PermissionDenied,
    /// Anything outside the taxonomy above (I/O, IPC, configuration).
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MethodMissing => "MethodMissing",
            ErrorKind::EvaluationFailed => "EvaluationFailed",
            ErrorKind::DeviceUnavailable => "DeviceUnavailable",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ValueInvalid => "ValueInvalid",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for all YogaVPC operations
#[derive(thiserror::Error, Debug)]
pub enum VpcError {
    // ============================================================================
    // Firmware Errors
    // ============================================================================
    #[error("Firmware method {method} is not available on this platform")]
    MethodMissing {
        method: String,
    },

    #[error("Firmware method {method} evaluation failed: {reason}")]
    EvaluationFailed {
        method: String,
        reason: String,
    },

    #[error("VPC unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    // ============================================================================
    // Request Errors
    // ============================================================================
    #[error("Invalid value: {0}")]
    ValueInvalid(String),

    #[error("{property} toggle to 0x{attempted:x} failed: {source}")]
    Toggle {
        property: String,
        attempted: u32,
        #[source]
        source: Box<VpcError>,
    },

    // ============================================================================
    // Ambient Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IPC error: {0}")]
    Ipc(String),
}

impl VpcError {
    /// Create a missing-method error
    pub fn method_missing(method: impl Into<String>) -> Self {
        Self::MethodMissing { method: method.into() }
    }

    /// Create an evaluation failure for a method
    pub fn evaluation(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EvaluationFailed {
            method: method.into(),
            reason: reason.into(),
        }
    }

    /// Create a device-unavailable error
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::DeviceUnavailable(reason.into())
    }

    /// Create an invalid-value error
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::ValueInvalid(reason.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap a failed set with the property and the value that was attempted
    pub fn toggle(property: impl Into<String>, attempted: u32, source: VpcError) -> Self {
        Self::Toggle {
            property: property.into(),
            attempted,
            source: Box::new(source),
        }
    }

    /// Category of this error. Wrapped set failures report their cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VpcError::MethodMissing { .. } => ErrorKind::MethodMissing,
            VpcError::EvaluationFailed { .. } => ErrorKind::EvaluationFailed,
            VpcError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            VpcError::Timeout(_) => ErrorKind::Timeout,
            VpcError::ValueInvalid(_) => ErrorKind::ValueInvalid,
            VpcError::Toggle { source, .. } => source.kind(),
            VpcError::Io(_) | VpcError::JsonParse(_) | VpcError::Config(_) | VpcError::Ipc(_) => {
                ErrorKind::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_error_reports_source_kind() {
        let err = VpcError::toggle("ClamshellMode", 1, VpcError::evaluation("SCSM", "AE_ERROR"));
        assert_eq!(err.kind(), ErrorKind::EvaluationFailed);
        let msg = err.to_string();
        assert!(msg.contains("ClamshellMode"));
        assert!(msg.contains("0x1"));
    }

    #[test]
    fn test_ambient_errors_are_internal() {
        let err = VpcError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(VpcError::config("bad").kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::ValueInvalid).unwrap();
        assert_eq!(json, "\"ValueInvalid\"");
        assert_eq!(ErrorKind::Timeout.to_string(), "Timeout");
        let denied: ErrorKind = serde_json::from_str("\"PermissionDenied\"").unwrap();
        assert_eq!(denied, ErrorKind::PermissionDenied);
    }
}
