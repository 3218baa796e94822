//! Audit entries and their integrity hashes.

use crate::config::HsmMode;
use crate::error::HsmError;
use crate::types::{algorithm_name, Classification, KeyId, OperationResult, OperationType};
use chrono::{DateTime, Utc};
use citadel_hsm_crypto::Algorithm;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Seed of the hash chain: `prev_hash` of the very first entry.
pub const GENESIS_SEED: &[u8] = b"citadel-hsm-audit-genesis";

pub fn genesis_hash() -> String {
    format!("{:x}", Sha256::digest(GENESIS_SEED))
}

/// Monotonic, collision-resistant operation id.
///
/// `sequence` strictly increases per log (and survives restarts); `instance`
/// is a random per-process tag so ids from two processes never collide.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId {
    pub instance: String,
    pub sequence: u64,
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:012}", self.instance, self.sequence)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceInfo {
    pub duration_ms: u64,
    pub target_ms: u64,
    pub within_target: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub actor: String,
    pub mode: HsmMode,
    pub vendor: String,
    pub classification: Option<Classification>,
    pub connection_id: Option<u64>,
    pub fips_mode: bool,
}

/// What the facade hands the logger. The logger stamps id and hashes.
#[derive(Clone, Debug)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: OperationType,
    pub key_id: Option<KeyId>,
    pub related_key_id: Option<KeyId>,
    pub algorithm: Option<Algorithm>,
    pub result: OperationResult,
    pub error_code: Option<String>,
    pub performance: PerformanceInfo,
    pub security: SecurityContext,
    pub detail: Option<String>,
}

/// One immutable, integrity-hashed record of one operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub operation_id: OperationId,
    pub timestamp: DateTime<Utc>,
    pub operation: OperationType,
    pub key_id: Option<KeyId>,
    /// The other key of a rotation.
    pub related_key_id: Option<KeyId>,
    #[serde(with = "algorithm_name::option")]
    pub algorithm: Option<Algorithm>,
    pub result: OperationResult,
    pub error_code: Option<String>,
    pub performance: PerformanceInfo,
    pub security: SecurityContext,
    pub detail: Option<String>,
    /// `integrity_hash` of the previous retained entry.
    pub prev_hash: String,
    /// SHA-256 over the canonical JSON of every other field.
    pub integrity_hash: String,
}

impl AuditEntry {
    pub(crate) fn seal(record: AuditRecord, operation_id: OperationId, prev_hash: String) -> Result<Self, HsmError> {
        let mut entry = Self {
            operation_id,
            timestamp: record.timestamp,
            operation: record.operation,
            key_id: record.key_id,
            related_key_id: record.related_key_id,
            algorithm: record.algorithm,
            result: record.result,
            error_code: record.error_code,
            performance: record.performance,
            security: record.security,
            detail: record.detail,
            prev_hash,
            integrity_hash: String::new(),
        };
        entry.integrity_hash = entry.compute_hash()?;
        Ok(entry)
    }

    /// Recompute the integrity hash from the entry's other fields.
    ///
    /// Canonical form: the entry serialized to a JSON object without
    /// `integrity_hash`, keys in sorted order, no whitespace.
    pub fn compute_hash(&self) -> Result<String, HsmError> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| HsmError::IntegrityVerification(format!("serialize: {}", e)))?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("integrity_hash");
        }
        let canonical = serde_json::to_vec(&value)
            .map_err(|e| HsmError::IntegrityVerification(format!("serialize: {}", e)))?;
        Ok(format!("{:x}", Sha256::digest(&canonical)))
    }

    pub fn is_high_priority(&self) -> bool {
        !self.result.is_success() || self.operation.is_high_priority()
    }
}
