//! Status reports for external monitoring.

use crate::audit::{AuditCounters, AuditStatistics};
use crate::config::{AuditLevel, HsmMode};
use crate::health::HealthStatus;
use crate::metrics::MetricsSnapshot;
use crate::policy::{evaluate_expiry, ExpiryVerdict};
use crate::types::KeyMetadata;
use crate::vendor::VendorCapabilities;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Facade lifecycle.
///
/// ```text
/// CREATED ──initialize──► RUNNING ──shutdown──► SHUTTING_DOWN ──► STOPPED
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Running => write!(f, "RUNNING"),
            Self::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Key counts by type, classification and state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct KeyInventory {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_classification: BTreeMap<String, usize>,
    pub by_state: BTreeMap<String, usize>,
    /// Active keys past 90% of their validity.
    pub expiring_soon: usize,
    /// Active keys past their expiry.
    pub expired: usize,
}

impl KeyInventory {
    pub fn from_keys(keys: &[KeyMetadata], now: DateTime<Utc>) -> Self {
        let mut inv = Self { total: keys.len(), ..Self::default() };
        for key in keys {
            *inv.by_type.entry(key.key_type.to_string()).or_insert(0) += 1;
            *inv.by_classification.entry(key.classification.to_string()).or_insert(0) += 1;
            *inv.by_state.entry(key.state.to_string()).or_insert(0) += 1;
            match evaluate_expiry(key, now) {
                ExpiryVerdict::ExpiringSoon { .. } => inv.expiring_soon += 1,
                ExpiryVerdict::Expired => inv.expired += 1,
                ExpiryVerdict::Valid | ExpiryVerdict::NotApplicable => {}
            }
        }
        inv
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ConfigSummary {
    pub vendor: String,
    pub endpoint: String,
    pub mode: HsmMode,
    pub fips_mode: bool,
    pub audit_level: AuditLevel,
    pub pool_capacity: usize,
    pub capabilities: VendorCapabilities,
}

#[derive(Clone, Debug, Serialize)]
pub struct ComprehensiveStatus {
    pub lifecycle: Lifecycle,
    pub health: HealthStatus,
    pub metrics: MetricsSnapshot,
    /// Over the last hour.
    pub audit: AuditStatistics,
    pub audit_counters: AuditCounters,
    pub keys: KeyInventory,
    pub config: ConfigSummary,
    pub alerts_emitted: u64,
    pub uptime_secs: u64,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use citadel_hsm_crypto::Algorithm;

    fn key(state: KeyState, classification: Classification, age_days: i64, validity_days: i64) -> KeyMetadata {
        let created_at = Utc::now() - chrono::Duration::days(age_days);
        KeyMetadata {
            id: KeyId::generate(),
            label: None,
            key_type: KeyType::Symmetric,
            algorithm: Algorithm::Aes256Gcm,
            classification,
            usage: vec![KeyUsage::Encrypt, KeyUsage::Decrypt],
            state,
            hardware_generated: false,
            exportable: false,
            escrow_status: EscrowStatus::NotEscrowed,
            created_at,
            expires_at: Some(created_at + chrono::Duration::days(validity_days)),
            superseded_at: None,
            destroyed_at: None,
            supersedes: None,
            superseded_by: None,
            version: 1,
            vendor_handle: "obj-000001".into(),
            access_log: Vec::new(),
        }
    }

    #[test]
    fn inventory_counts() {
        let keys = vec![
            key(KeyState::Active, Classification::Executive, 1, 90),
            key(KeyState::Active, Classification::Internal, 95, 100),
            key(KeyState::Active, Classification::Internal, 10, 5),
            key(KeyState::Superseded, Classification::Internal, 10, 5),
        ];
        let inv = KeyInventory::from_keys(&keys, Utc::now());
        assert_eq!(inv.total, 4);
        assert_eq!(inv.by_classification["INTERNAL"], 3);
        assert_eq!(inv.by_state["ACTIVE"], 3);
        assert_eq!(inv.by_type["SYMMETRIC"], 4);
        assert_eq!(inv.expiring_soon, 1);
        assert_eq!(inv.expired, 1);
    }
}
