//! Production provider built on vetted RustCrypto / dalek primitives.

use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha512};
use sha3::Sha3_256;
use zeroize::Zeroizing;

use crate::aead;
use crate::algorithm::{Algorithm, AlgorithmCategory};
use crate::error::CryptoError;
use crate::kem;
use crate::provider::{CryptoProvider, Encapsulation, KeyPair, SecretBytes};
use crate::signing;

/// Upper bound on HKDF-SHA256 output (255 blocks).
pub const MAX_DERIVE_BYTES: usize = 255 * 32;

/// Real cryptography. Safe to protect production data.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareProvider;

impl SoftwareProvider {
    pub fn new() -> Self {
        Self
    }
}

/// Compute a digest with one of the supported hash algorithms.
pub fn digest(algorithm: Algorithm, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match algorithm {
        Algorithm::Sha256 => Ok(Sha256::digest(data).to_vec()),
        Algorithm::Sha512 => Ok(Sha512::digest(data).to_vec()),
        Algorithm::Sha3_256 => Ok(Sha3_256::digest(data).to_vec()),
        other => Err(CryptoError::WrongCategory {
            algorithm: other,
            expected: AlgorithmCategory::Hash,
        }),
    }
}

impl CryptoProvider for SoftwareProvider {
    fn name(&self) -> &'static str {
        "software"
    }

    fn generate_secret_key(&self, algorithm: Algorithm) -> Result<SecretBytes, CryptoError> {
        algorithm.expect_category(AlgorithmCategory::Symmetric)?;
        let key = Zeroizing::new(aead::generate_key()?);
        Ok(Zeroizing::new(key.to_vec()))
    }

    fn generate_key_pair(&self, algorithm: Algorithm) -> Result<KeyPair, CryptoError> {
        match algorithm {
            Algorithm::Ed25519 => signing::ed25519_keygen(),
            Algorithm::EcdsaP256 => Ok(signing::p256_keygen()),
            Algorithm::MlKem768 => Ok(kem::mlkem_keygen()),
            Algorithm::X25519MlKem768 => Ok(kem::hybrid_keygen()),
            other => Err(CryptoError::WrongCategory {
                algorithm: other,
                expected: AlgorithmCategory::Asymmetric,
            }),
        }
    }

    fn encrypt(
        &self,
        algorithm: Algorithm,
        key: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        algorithm.expect_category(AlgorithmCategory::Symmetric)?;
        aead::seal(key, plaintext, aad)
    }

    fn decrypt(
        &self,
        algorithm: Algorithm,
        key: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        algorithm.expect_category(AlgorithmCategory::Symmetric)?;
        aead::open(key, ciphertext, aad)
    }

    fn encapsulate(&self, algorithm: Algorithm, public_key: &[u8]) -> Result<Encapsulation, CryptoError> {
        match algorithm {
            Algorithm::MlKem768 => kem::mlkem_encapsulate(public_key),
            Algorithm::X25519MlKem768 => kem::hybrid_encapsulate(public_key),
            other => Err(CryptoError::WrongCategory {
                algorithm: other,
                expected: AlgorithmCategory::PostQuantum,
            }),
        }
    }

    fn decapsulate(
        &self,
        algorithm: Algorithm,
        secret_key: &[u8],
        ciphertext: &[u8],
    ) -> Result<SecretBytes, CryptoError> {
        match algorithm {
            Algorithm::MlKem768 => kem::mlkem_decapsulate(secret_key, ciphertext),
            Algorithm::X25519MlKem768 => kem::hybrid_decapsulate(secret_key, ciphertext),
            other => Err(CryptoError::WrongCategory {
                algorithm: other,
                expected: AlgorithmCategory::PostQuantum,
            }),
        }
    }

    fn sign(&self, algorithm: Algorithm, secret_key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match algorithm {
            Algorithm::Ed25519 => signing::ed25519_sign(secret_key, message),
            Algorithm::EcdsaP256 => signing::p256_sign(secret_key, message),
            other => Err(CryptoError::WrongCategory {
                algorithm: other,
                expected: AlgorithmCategory::Asymmetric,
            }),
        }
    }

    fn verify(
        &self,
        algorithm: Algorithm,
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        match algorithm {
            Algorithm::Ed25519 => signing::ed25519_verify(public_key, message, signature),
            Algorithm::EcdsaP256 => signing::p256_verify(public_key, message, signature),
            other => Err(CryptoError::WrongCategory {
                algorithm: other,
                expected: AlgorithmCategory::Asymmetric,
            }),
        }
    }

    fn digest(&self, algorithm: Algorithm, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        digest(algorithm, data)
    }

    fn derive(
        &self,
        algorithm: Algorithm,
        ikm: &[u8],
        salt: Option<&[u8]>,
        info: &[u8],
        length: usize,
    ) -> Result<SecretBytes, CryptoError> {
        algorithm.expect_category(AlgorithmCategory::Kdf)?;
        if length == 0 || length > MAX_DERIVE_BYTES {
            return Err(CryptoError::InvalidInput("HKDF output length out of range"));
        }
        let hk = Hkdf::<Sha256>::new(salt, ikm);
        let mut out = Zeroizing::new(vec![0u8; length]);
        hk.expand(info, &mut out)
            .map_err(|_| CryptoError::InvalidInput("HKDF output length out of range"))?;
        Ok(out)
    }
}
