//! Algorithm identifiers and their categories.

use crate::error::CryptoError;
use std::fmt;
use std::str::FromStr;

/// What an algorithm is for. Mirrors the allow-list sections of the HSM
/// configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AlgorithmCategory {
    Symmetric,
    Asymmetric,
    PostQuantum,
    Hash,
    Kdf,
}

impl fmt::Display for AlgorithmCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmCategory::Symmetric => write!(f, "symmetric"),
            AlgorithmCategory::Asymmetric => write!(f, "asymmetric"),
            AlgorithmCategory::PostQuantum => write!(f, "post-quantum"),
            AlgorithmCategory::Hash => write!(f, "hash"),
            AlgorithmCategory::Kdf => write!(f, "kdf"),
        }
    }
}

/// Every algorithm a provider may be asked to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    /// AES-256 in Galois/Counter Mode.
    Aes256Gcm,
    /// Ed25519 signatures (RFC 8032).
    Ed25519,
    /// ECDSA over NIST P-256 with SHA-256.
    EcdsaP256,
    /// ML-KEM-768 (FIPS 203).
    MlKem768,
    /// X25519 + ML-KEM-768 hybrid KEM. Secure if either component holds.
    X25519MlKem768,
    Sha256,
    Sha512,
    Sha3_256,
    HkdfSha256,
}

impl Algorithm {
    pub const ALL: [Algorithm; 9] = [
        Algorithm::Aes256Gcm,
        Algorithm::Ed25519,
        Algorithm::EcdsaP256,
        Algorithm::MlKem768,
        Algorithm::X25519MlKem768,
        Algorithm::Sha256,
        Algorithm::Sha512,
        Algorithm::Sha3_256,
        Algorithm::HkdfSha256,
    ];

    /// Canonical name, as written in configuration allow-lists.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "AES-256-GCM",
            Algorithm::Ed25519 => "Ed25519",
            Algorithm::EcdsaP256 => "ECDSA-P256",
            Algorithm::MlKem768 => "ML-KEM-768",
            Algorithm::X25519MlKem768 => "X25519-ML-KEM-768",
            Algorithm::Sha256 => "SHA-256",
            Algorithm::Sha512 => "SHA-512",
            Algorithm::Sha3_256 => "SHA3-256",
            Algorithm::HkdfSha256 => "HKDF-SHA256",
        }
    }

    /// Parse a canonical name. Matching ignores ASCII case.
    pub fn from_name(name: &str) -> Result<Self, CryptoError> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.name().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| CryptoError::UnknownAlgorithm(name.to_string()))
    }

    pub fn category(&self) -> AlgorithmCategory {
        match self {
            Algorithm::Aes256Gcm => AlgorithmCategory::Symmetric,
            Algorithm::Ed25519 | Algorithm::EcdsaP256 => AlgorithmCategory::Asymmetric,
            Algorithm::MlKem768 | Algorithm::X25519MlKem768 => AlgorithmCategory::PostQuantum,
            Algorithm::Sha256 | Algorithm::Sha512 | Algorithm::Sha3_256 => AlgorithmCategory::Hash,
            Algorithm::HkdfSha256 => AlgorithmCategory::Kdf,
        }
    }

    /// Whether the algorithm is in the FIPS-approved set.
    ///
    /// Ed25519 and the X25519 hybrid are excluded: neither is allowed in a
    /// FIPS 140-3 boundary run in approved mode.
    pub fn is_fips_approved(&self) -> bool {
        !matches!(self, Algorithm::Ed25519 | Algorithm::X25519MlKem768)
    }

    /// Whether this algorithm signs (as opposed to encapsulating).
    pub fn is_signature(&self) -> bool {
        matches!(self, Algorithm::Ed25519 | Algorithm::EcdsaP256)
    }

    /// Whether this algorithm is a key-encapsulation mechanism.
    pub fn is_kem(&self) -> bool {
        matches!(self, Algorithm::MlKem768 | Algorithm::X25519MlKem768)
    }

    /// Fail unless the algorithm belongs to `expected`.
    pub fn expect_category(&self, expected: AlgorithmCategory) -> Result<(), CryptoError> {
        if self.category() == expected {
            Ok(())
        } else {
            Err(CryptoError::WrongCategory { algorithm: *self, expected })
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}
