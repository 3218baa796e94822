//! Error taxonomy for the HSM layer.
//!
//! Every variant carries a stable machine code, a human message (via
//! `Display`) and a recoverability flag. Vendor- and provider-specific
//! errors are converted into this type before they reach a caller.

use crate::types::KeyId;
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Top-level HSM error
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HsmError {
    /// Invalid or inconsistent configuration. Startup only.
    Configuration(String),
    UnsupportedAlgorithm(String),
    InvalidParameters(String),
    /// The key's usage list or state does not permit the operation.
    Unauthorized(String),
    KeyNotFound(KeyId),
    PoolTimeout { waited: Duration },
    PoolClosed,
    /// Normalized vendor failure.
    VendorOperation {
        vendor: String,
        code: String,
        message: String,
        connection_lost: bool,
    },
    AuditFlush(String),
    IntegrityVerification(String),
    /// Metadata store read/write failure.
    Storage(String),
    NotInitialized,
    ShuttingDown,
}

impl HsmError {
    /// Stable, machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::UnsupportedAlgorithm(_) => "UNSUPPORTED_ALGORITHM",
            Self::InvalidParameters(_) => "INVALID_PARAMETERS",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::KeyNotFound(_) => "KEY_NOT_FOUND",
            Self::PoolTimeout { .. } => "POOL_TIMEOUT",
            Self::PoolClosed => "POOL_CLOSED",
            Self::VendorOperation { .. } => "VENDOR_OPERATION_ERROR",
            Self::AuditFlush(_) => "AUDIT_FLUSH_ERROR",
            Self::IntegrityVerification(_) => "INTEGRITY_VERIFICATION_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PoolTimeout { .. }
                | Self::VendorOperation { .. }
                | Self::AuditFlush(_)
                | Self::Storage(_)
                | Self::NotInitialized
        )
    }

    /// Whether the caller, rather than the system, is at fault.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedAlgorithm(_)
                | Self::InvalidParameters(_)
                | Self::Unauthorized(_)
                | Self::KeyNotFound(_)
        )
    }
}

impl fmt::Display for HsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "configuration error: {}", msg),
            Self::UnsupportedAlgorithm(alg) => write!(f, "unsupported algorithm: {}", alg),
            Self::InvalidParameters(msg) => write!(f, "invalid parameters: {}", msg),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            Self::KeyNotFound(id) => write!(f, "key not found: {}", id),
            Self::PoolTimeout { waited } => {
                write!(f, "no HSM connection available after {}ms", waited.as_millis())
            }
            Self::PoolClosed => write!(f, "connection pool is shut down"),
            Self::VendorOperation { vendor, code, message, connection_lost } => {
                write!(f, "vendor {} error {}: {}", vendor, code, message)?;
                if *connection_lost {
                    write!(f, " (connection lost)")?;
                }
                Ok(())
            }
            Self::AuditFlush(msg) => write!(f, "audit flush failed: {}", msg),
            Self::IntegrityVerification(msg) => write!(f, "audit integrity violation: {}", msg),
            Self::Storage(msg) => write!(f, "metadata store error: {}", msg),
            Self::NotInitialized => write!(f, "HSM not initialized"),
            Self::ShuttingDown => write!(f, "HSM is shutting down"),
        }
    }
}

impl std::error::Error for HsmError {}

/// Serializable projection of an error for status reports and audit detail.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

impl From<&HsmError> for ErrorInfo {
    fn from(e: &HsmError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
            recoverable: e.is_recoverable(),
        }
    }
}
