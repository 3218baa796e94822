//! Provisioning policy: export, escrow and lifetime decisions for new keys,
//! plus expiry evaluation of existing ones.

use crate::config::SecurityPolicy;
use crate::types::{Classification, EscrowPolicy, EscrowStatus, KeyMetadata, KeyState};
use chrono::{DateTime, Utc};

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

/// What a key request asks for, as far as policy is concerned.
#[derive(Clone, Debug)]
pub struct ProvisioningRequest {
    pub classification: Classification,
    pub exportable: bool,
    /// Ask for escrow when the policy makes it optional.
    pub escrow: bool,
    pub validity: Option<chrono::Duration>,
}

/// Attributes policy assigns to a new key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Provisioning {
    pub exportable: bool,
    pub escrow_status: EscrowStatus,
    pub expires_at: DateTime<Utc>,
    /// Why a requested attribute was refused, for the audit detail.
    pub notes: Vec<String>,
}

/// Apply the security policy to a key request.
///
/// Export rule: an executive key under escrow policy `none` is never
/// exportable, and nothing is exportable in FIPS mode.
pub fn provision(req: &ProvisioningRequest, security: &SecurityPolicy, now: DateTime<Utc>) -> Provisioning {
    let mut notes = Vec::new();

    let mut exportable = req.exportable;
    if exportable
        && req.classification == Classification::Executive
        && security.escrow_policy == EscrowPolicy::None
    {
        exportable = false;
        notes.push("export refused: executive key without escrow".to_string());
    }
    if exportable && security.fips_mode {
        exportable = false;
        notes.push("export refused: fips mode".to_string());
    }

    let escrow_status = match security.escrow_policy {
        EscrowPolicy::Required => EscrowStatus::PendingEscrow,
        EscrowPolicy::Optional if req.escrow => EscrowStatus::PendingEscrow,
        EscrowPolicy::Optional | EscrowPolicy::None => {
            if req.escrow && security.escrow_policy == EscrowPolicy::None {
                notes.push("escrow refused: escrow policy is none".to_string());
            }
            EscrowStatus::NotEscrowed
        }
    };

    let validity = req
        .validity
        .unwrap_or_else(|| req.classification.default_validity());

    Provisioning {
        exportable,
        escrow_status,
        expires_at: now + validity,
        notes,
    }
}

// ---------------------------------------------------------------------------
// Expiry evaluation
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExpiryVerdict {
    Valid,
    /// Past 90% of its validity.
    ExpiringSoon { remaining: chrono::Duration },
    Expired,
    /// Superseded or destroyed keys are not evaluated.
    NotApplicable,
}

pub fn evaluate_expiry(key: &KeyMetadata, now: DateTime<Utc>) -> ExpiryVerdict {
    if key.state != KeyState::Active {
        return ExpiryVerdict::NotApplicable;
    }
    let Some(expires_at) = key.expires_at else {
        return ExpiryVerdict::Valid;
    };
    if now >= expires_at {
        return ExpiryVerdict::Expired;
    }
    let total = expires_at - key.created_at;
    let elapsed = now - key.created_at;
    // Warn at 90%
    if elapsed.num_seconds() * 10 >= total.num_seconds() * 9 {
        return ExpiryVerdict::ExpiringSoon { remaining: expires_at - now };
    }
    ExpiryVerdict::Valid
}
