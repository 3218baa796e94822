//! Core types: KeyId, KeyType, Classification, KeyState, KeyMetadata and
//! the per-operation result shapes.

use crate::error::HsmError;
use chrono::{DateTime, Utc};
use citadel_hsm_crypto::{Algorithm, AlgorithmCategory};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Key identifiers
// ---------------------------------------------------------------------------

/// Unique key identifier (hex-encoded random bytes).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId(String);

impl KeyId {
    /// Create a new random KeyId.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand_core::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Create from a specific string (for testing/deterministic use).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Algorithm (de)serialization by canonical name
// ---------------------------------------------------------------------------

pub(crate) mod algorithm_name {
    use citadel_hsm_crypto::Algorithm;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(alg: &Algorithm, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(alg.name())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Algorithm, D::Error> {
        let name = String::deserialize(d)?;
        Algorithm::from_name(&name).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use citadel_hsm_crypto::Algorithm;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(alg: &Option<Algorithm>, s: S) -> Result<S::Ok, S::Error> {
            match alg {
                Some(a) => s.serialize_some(a.name()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Algorithm>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(name) => Algorithm::from_name(&name)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Key classification
// ---------------------------------------------------------------------------

/// Kind of key material held by the HSM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyType {
    Symmetric,
    /// Signing key pair.
    Asymmetric,
    /// KEM key pair.
    PostQuantum,
}

impl KeyType {
    /// Infer the key type from the algorithm, if the algorithm produces keys.
    pub fn for_algorithm(algorithm: Algorithm) -> Option<Self> {
        match algorithm.category() {
            AlgorithmCategory::Symmetric => Some(Self::Symmetric),
            AlgorithmCategory::Asymmetric => Some(Self::Asymmetric),
            AlgorithmCategory::PostQuantum => Some(Self::PostQuantum),
            AlgorithmCategory::Hash | AlgorithmCategory::Kdf => None,
        }
    }

    /// Usages granted when a request does not list any.
    pub fn default_usage(&self) -> Vec<KeyUsage> {
        match self {
            Self::Symmetric => vec![KeyUsage::Encrypt, KeyUsage::Decrypt],
            Self::Asymmetric => vec![KeyUsage::Sign, KeyUsage::Verify],
            Self::PostQuantum => vec![KeyUsage::Encapsulate, KeyUsage::Decapsulate],
        }
    }

    /// Usages that make sense for this key type at all.
    pub fn permitted_usage(&self) -> &'static [KeyUsage] {
        match self {
            Self::Symmetric => &[KeyUsage::Encrypt, KeyUsage::Decrypt],
            Self::Asymmetric => &[KeyUsage::Sign, KeyUsage::Verify],
            Self::PostQuantum => &[KeyUsage::Encapsulate, KeyUsage::Decapsulate],
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Symmetric => write!(f, "SYMMETRIC"),
            Self::Asymmetric => write!(f, "ASYMMETRIC"),
            Self::PostQuantum => write!(f, "POST_QUANTUM"),
        }
    }
}

/// Sensitivity tier. Governs default lifetime, escrow and export.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Classification {
    Executive,
    Strategic,
    Confidential,
    Internal,
}

impl Classification {
    /// Default validity when the request does not give one.
    pub fn default_validity(&self) -> chrono::Duration {
        let days = match self {
            Self::Executive => 90,
            Self::Strategic => 180,
            Self::Confidential => 365,
            Self::Internal => 730,
        };
        chrono::Duration::days(days)
    }
}

impl Default for Classification {
    fn default() -> Self {
        Self::Internal
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executive => write!(f, "EXECUTIVE"),
            Self::Strategic => write!(f, "STRATEGIC"),
            Self::Confidential => write!(f, "CONFIDENTIAL"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyUsage {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Encapsulate,
    Decapsulate,
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::Sign => "sign",
            Self::Verify => "verify",
            Self::Encapsulate => "encapsulate",
            Self::Decapsulate => "decapsulate",
        };
        f.write_str(s)
    }
}

/// Escrow policy from the security configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowPolicy {
    None,
    Optional,
    Required,
}

impl Default for EscrowPolicy {
    fn default() -> Self {
        Self::None
    }
}

/// Escrow status recorded on a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowStatus {
    NotEscrowed,
    /// Escrow is required; a copy must be deposited by the escrow agent.
    PendingEscrow,
}

// ---------------------------------------------------------------------------
// Key lifecycle state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a key.
///
/// ```text
/// ACTIVE ──rotate──► SUPERSEDED ──delete──► DESTROYED
///    └────────────────delete──────────────────┘
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyState {
    Active,
    /// Replaced by a newer version; still usable on the "read" side.
    Superseded,
    /// Material erased from the HSM. Terminal.
    Destroyed,
}

impl KeyState {
    pub fn valid_transitions(&self) -> &'static [KeyState] {
        match self {
            Self::Active => &[Self::Superseded, Self::Destroyed],
            Self::Superseded => &[Self::Destroyed],
            Self::Destroyed => &[],
        }
    }

    pub fn can_transition_to(&self, target: KeyState) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// Whether a key in this state may be used for `usage`.
    pub fn permits(&self, usage: KeyUsage) -> bool {
        match self {
            Self::Active => true,
            Self::Superseded => matches!(
                usage,
                KeyUsage::Decrypt | KeyUsage::Verify | KeyUsage::Decapsulate
            ),
            Self::Destroyed => false,
        }
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Superseded => write!(f, "SUPERSEDED"),
            Self::Destroyed => write!(f, "DESTROYED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Every operation the facade audits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationType {
    GenerateKey,
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    Encapsulate,
    Decapsulate,
    RotateKey,
    GenerateBulkKeys,
    DeleteKey,
    ExportPublicKey,
}

impl OperationType {
    pub const ALL: [OperationType; 11] = [
        Self::GenerateKey,
        Self::Encrypt,
        Self::Decrypt,
        Self::Sign,
        Self::Verify,
        Self::Encapsulate,
        Self::Decapsulate,
        Self::RotateKey,
        Self::GenerateBulkKeys,
        Self::DeleteKey,
        Self::ExportPublicKey,
    ];

    /// Operations that create, replace, remove or release key material.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::GenerateKey
                | Self::RotateKey
                | Self::GenerateBulkKeys
                | Self::DeleteKey
                | Self::ExportPublicKey
        )
    }

    /// Operations whose audit entries are flushed immediately.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::DeleteKey | Self::ExportPublicKey)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerateKey => "generate_key",
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::Sign => "sign",
            Self::Verify => "verify",
            Self::Encapsulate => "encapsulate",
            Self::Decapsulate => "decapsulate",
            Self::RotateKey => "rotate_key",
            Self::GenerateBulkKeys => "generate_bulk_keys",
            Self::DeleteKey => "delete_key",
            Self::ExportPublicKey => "export_public_key",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audited result of a single operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationResult {
    Success,
    /// The operation was attempted and failed (bad input, vendor failure, timeout).
    Failure,
    /// Usage or state policy refused the operation.
    Unauthorized,
    /// The HSM layer itself was not in a state to serve the call.
    Error,
}

impl OperationResult {
    pub fn from_outcome<T>(result: &Result<T, HsmError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) => Self::from_error(e),
        }
    }

    pub fn from_error(e: &HsmError) -> Self {
        match e {
            HsmError::Unauthorized(_) => Self::Unauthorized,
            HsmError::UnsupportedAlgorithm(_)
            | HsmError::InvalidParameters(_)
            | HsmError::KeyNotFound(_)
            | HsmError::PoolTimeout { .. }
            | HsmError::VendorOperation { .. } => Self::Failure,
            HsmError::Configuration(_)
            | HsmError::PoolClosed
            | HsmError::AuditFlush(_)
            | HsmError::IntegrityVerification(_)
            | HsmError::Storage(_)
            | HsmError::NotInitialized
            | HsmError::ShuttingDown => Self::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Uniform return shape of every facade operation.
#[derive(Debug)]
pub struct OperationOutcome<T> {
    /// Matches the `operation_id` of the audit entry for this call.
    pub operation_id: String,
    pub operation: OperationType,
    pub result: Result<T, HsmError>,
    pub duration: Duration,
    /// `false` when the soft performance target was breached.
    pub within_target: bool,
}

impl<T> OperationOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&HsmError> {
        self.result.as_ref().err()
    }

    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn into_result(self) -> Result<T, HsmError> {
        self.result
    }
}

// ---------------------------------------------------------------------------
// Key metadata
// ---------------------------------------------------------------------------

/// One line of a key's access log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub at: DateTime<Utc>,
    pub operation: OperationType,
    pub operation_id: String,
    pub result: OperationResult,
    pub actor: String,
}

/// Everything the HSM layer knows about a key. Key material itself stays
/// inside the vendor; `vendor_handle` is the reference to it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub id: KeyId,
    pub label: Option<String>,
    pub key_type: KeyType,
    #[serde(with = "algorithm_name")]
    pub algorithm: Algorithm,
    pub classification: Classification,
    pub usage: Vec<KeyUsage>,
    pub state: KeyState,
    pub hardware_generated: bool,
    pub exportable: bool,
    pub escrow_status: EscrowStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub superseded_at: Option<DateTime<Utc>>,
    pub destroyed_at: Option<DateTime<Utc>>,
    /// The key this one replaced.
    pub supersedes: Option<KeyId>,
    /// The key that replaced this one.
    pub superseded_by: Option<KeyId>,
    /// 1 for a fresh key, +1 per rotation along the chain.
    pub version: u32,
    pub vendor_handle: String,
    /// Append-only. Concurrent operations on one key are appended in
    /// completion order, not issue order.
    pub access_log: Vec<AccessRecord>,
}

impl KeyMetadata {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }

    pub fn has_usage(&self, usage: KeyUsage) -> bool {
        self.usage.contains(&usage)
    }

    /// Check that `usage` is allowed right now. Expiry is a parameter
    /// problem; state or usage-list refusals are authorization problems.
    pub fn authorize(&self, usage: KeyUsage, now: DateTime<Utc>) -> Result<(), HsmError> {
        if self.state == KeyState::Destroyed {
            return Err(HsmError::Unauthorized(format!("key {} is destroyed", self.id)));
        }
        if self.is_expired_at(now) {
            return Err(HsmError::InvalidParameters(format!("key {} has expired", self.id)));
        }
        if !self.has_usage(usage) {
            return Err(HsmError::Unauthorized(format!(
                "key {} is not permitted to {}",
                self.id, usage
            )));
        }
        if !self.state.permits(usage) {
            return Err(HsmError::Unauthorized(format!(
                "key {} is {} and cannot {}",
                self.id, self.state, usage
            )));
        }
        Ok(())
    }
}
