//! Request parameters and typed results of the facade operations.

use crate::error::HsmError;
use crate::types::{algorithm_name, Classification, KeyId, KeyMetadata, KeyType, KeyUsage};
use citadel_hsm_crypto::{Algorithm, SecretBytes};
use serde::{Deserialize, Serialize};

/// Actor recorded when a request does not name one.
pub const DEFAULT_ACTOR: &str = "system";

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateKeyParams {
    /// Canonical algorithm name, e.g. `AES-256-GCM`.
    pub algorithm: String,
    /// Must agree with the algorithm when given.
    pub key_type: Option<KeyType>,
    pub classification: Classification,
    /// Empty means the key type's defaults.
    pub usage: Vec<KeyUsage>,
    pub exportable: bool,
    /// Request escrow where the policy makes it optional.
    pub escrow: bool,
    /// Overrides the classification's default validity.
    pub validity_days: Option<u32>,
    pub label: Option<String>,
    pub actor: Option<String>,
}

impl GenerateKeyParams {
    pub fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            ..Self::default()
        }
    }

    pub fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = Some(key_type);
        self
    }

    pub fn classification(mut self, classification: Classification) -> Self {
        self.classification = classification;
        self
    }

    pub fn usage(mut self, usage: impl IntoIterator<Item = KeyUsage>) -> Self {
        self.usage = usage.into_iter().collect();
        self
    }

    pub fn exportable(mut self, exportable: bool) -> Self {
        self.exportable = exportable;
        self
    }

    pub fn escrow(mut self, escrow: bool) -> Self {
        self.escrow = escrow;
        self
    }

    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = Some(days);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct EncryptParams {
    pub key_id: KeyId,
    pub plaintext: Vec<u8>,
    /// Bound to the ciphertext; must be supplied again to decrypt.
    pub aad: Vec<u8>,
    pub actor: Option<String>,
}

impl EncryptParams {
    pub fn new(key_id: KeyId, plaintext: impl Into<Vec<u8>>) -> Self {
        Self { key_id, plaintext: plaintext.into(), aad: Vec::new(), actor: None }
    }

    pub fn aad(mut self, aad: impl Into<Vec<u8>>) -> Self {
        self.aad = aad.into();
        self
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct DecryptParams {
    pub key_id: KeyId,
    pub ciphertext: Vec<u8>,
    pub aad: Vec<u8>,
    pub actor: Option<String>,
}

impl DecryptParams {
    pub fn new(key_id: KeyId, ciphertext: impl Into<Vec<u8>>) -> Self {
        Self { key_id, ciphertext: ciphertext.into(), aad: Vec::new(), actor: None }
    }

    pub fn aad(mut self, aad: impl Into<Vec<u8>>) -> Self {
        self.aad = aad.into();
        self
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

impl From<&EncryptedData> for DecryptParams {
    fn from(data: &EncryptedData) -> Self {
        Self {
            key_id: data.key_id.clone(),
            ciphertext: data.ciphertext.clone(),
            aad: data.aad.clone(),
            actor: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SignParams {
    pub key_id: KeyId,
    pub message: Vec<u8>,
    /// Allow-listed hash to digest the message with before signing.
    pub hash: Option<String>,
    pub actor: Option<String>,
}

impl SignParams {
    pub fn new(key_id: KeyId, message: impl Into<Vec<u8>>) -> Self {
        Self { key_id, message: message.into(), hash: None, actor: None }
    }

    pub fn hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct VerifyParams {
    pub key_id: KeyId,
    pub message: Vec<u8>,
    pub signature: Vec<u8>,
    /// Must match the hash used when signing.
    pub hash: Option<String>,
    pub actor: Option<String>,
}

impl VerifyParams {
    pub fn new(key_id: KeyId, message: impl Into<Vec<u8>>, signature: impl Into<Vec<u8>>) -> Self {
        Self {
            key_id,
            message: message.into(),
            signature: signature.into(),
            hash: None,
            actor: None,
        }
    }

    pub fn hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct EncapsulateParams {
    pub key_id: KeyId,
    pub actor: Option<String>,
}

impl EncapsulateParams {
    pub fn new(key_id: KeyId) -> Self {
        Self { key_id, actor: None }
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct DecapsulateParams {
    pub key_id: KeyId,
    pub ciphertext: Vec<u8>,
    pub actor: Option<String>,
}

impl DecapsulateParams {
    pub fn new(key_id: KeyId, ciphertext: impl Into<Vec<u8>>) -> Self {
        Self { key_id, ciphertext: ciphertext.into(), actor: None }
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Ciphertext plus what is needed to decrypt it again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub key_id: KeyId,
    pub key_version: u32,
    #[serde(with = "algorithm_name")]
    pub algorithm: Algorithm,
    pub ciphertext: Vec<u8>,
    pub aad: Vec<u8>,
}

impl EncryptedData {
    pub fn ciphertext_hex(&self) -> String {
        hex::encode(&self.ciphertext)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub key_id: KeyId,
    #[serde(with = "algorithm_name")]
    pub algorithm: Algorithm,
    #[serde(with = "algorithm_name::option")]
    pub hash: Option<Algorithm>,
    pub bytes: Vec<u8>,
}

pub struct EncapsulatedKey {
    pub key_id: KeyId,
    pub algorithm: Algorithm,
    /// Send this to the key holder.
    pub ciphertext: Vec<u8>,
    pub shared_secret: SecretBytes,
}

impl std::fmt::Debug for EncapsulatedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncapsulatedKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("ciphertext_len", &self.ciphertext.len())
            .field("shared_secret", &"[redacted]")
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyExport {
    pub key_id: KeyId,
    #[serde(with = "algorithm_name")]
    pub algorithm: Algorithm,
    pub public_key: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct RotationResult {
    /// Now superseded.
    pub old_key_id: KeyId,
    pub new_key: KeyMetadata,
}

#[derive(Clone, Debug)]
pub struct BulkFailure {
    /// Position of the failed request in the input.
    pub index: usize,
    pub request: GenerateKeyParams,
    pub error: HsmError,
    pub operation_id: String,
}

/// Mixed-outcome result of a bulk generation. Generation stops at the
/// first failure; everything after it is handed back untouched.
#[derive(Clone, Debug, Default)]
pub struct BulkGenerationReport {
    pub generated: Vec<KeyMetadata>,
    pub failure: Option<BulkFailure>,
    pub remaining: Vec<GenerateKeyParams>,
}

impl BulkGenerationReport {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}
