//! Error type shared by every crypto provider.

use crate::algorithm::{Algorithm, AlgorithmCategory};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The name does not match any algorithm this crate knows.
    UnknownAlgorithm(String),
    /// The algorithm exists but cannot serve the requested operation.
    WrongCategory {
        algorithm: Algorithm,
        expected: AlgorithmCategory,
    },
    /// The provider recognises the algorithm but does not implement it.
    NotImplemented(Algorithm),
    /// Key bytes have the wrong length or do not parse.
    InvalidKey(&'static str),
    /// Malformed ciphertext, signature, or other input.
    InvalidInput(&'static str),
    /// The OS random source failed.
    RandomnessUnavailable,
    EncryptionFailed,
    /// Uniform decryption failure (no oracle on the cause).
    DecryptionFailed,
    SigningFailed,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAlgorithm(name) => write!(f, "unknown algorithm: {}", name),
            Self::WrongCategory { algorithm, expected } => {
                write!(f, "{} is not a {} algorithm", algorithm, expected)
            }
            Self::NotImplemented(alg) => write!(f, "algorithm not implemented by provider: {}", alg),
            Self::InvalidKey(why) => write!(f, "invalid key: {}", why),
            Self::InvalidInput(why) => write!(f, "invalid input: {}", why),
            Self::RandomnessUnavailable => write!(f, "random number generator unavailable"),
            Self::EncryptionFailed => write!(f, "encryption failed"),
            Self::DecryptionFailed => write!(f, "decryption failed"),
            Self::SigningFailed => write!(f, "signing failed"),
        }
    }
}

impl std::error::Error for CryptoError {}
