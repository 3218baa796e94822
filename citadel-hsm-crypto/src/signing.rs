//! Signatures: Ed25519 and ECDSA-P256.
//!
//! Key encodings:
//!   Ed25519     secret = seed[32]           public = point[32]    sig = 64
//!   ECDSA-P256  secret = scalar[32]         public = SEC1 uncompressed[65]
//!                                           sig = r || s [64]

use ed25519_dalek::{Signer as _, Verifier as _};
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use rand_core::OsRng;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::provider::KeyPair;

pub const ED25519_SECRET_BYTES: usize = 32;
pub const ED25519_PUBLIC_BYTES: usize = 32;
pub const P256_SECRET_BYTES: usize = 32;
pub const P256_PUBLIC_BYTES: usize = 65;
pub const SIGNATURE_BYTES: usize = 64;

// ---------------------------------------------------------------------------
// Ed25519
// ---------------------------------------------------------------------------

fn ed25519_signing_key(secret_key: &[u8]) -> Result<ed25519_dalek::SigningKey, CryptoError> {
    let seed: Zeroizing<[u8; ED25519_SECRET_BYTES]> = Zeroizing::new(
        secret_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Ed25519 secret key must be 32 bytes"))?,
    );
    Ok(ed25519_dalek::SigningKey::from_bytes(&seed))
}

pub fn ed25519_keygen() -> Result<KeyPair, CryptoError> {
    let mut seed = Zeroizing::new([0u8; ED25519_SECRET_BYTES]);
    getrandom::getrandom(&mut seed[..]).map_err(|_| CryptoError::RandomnessUnavailable)?;
    let sk = ed25519_dalek::SigningKey::from_bytes(&seed);
    Ok(KeyPair {
        public_key: sk.verifying_key().to_bytes().to_vec(),
        secret_key: Zeroizing::new(seed.to_vec()),
    })
}

pub fn ed25519_sign(secret_key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let sk = ed25519_signing_key(secret_key)?;
    Ok(sk.sign(message).to_bytes().to_vec())
}

pub fn ed25519_verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
    let pk: [u8; ED25519_PUBLIC_BYTES] = public_key
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("Ed25519 public key must be 32 bytes"))?;
    let vk = ed25519_dalek::VerifyingKey::from_bytes(&pk)
        .map_err(|_| CryptoError::InvalidKey("Ed25519 public key is not a valid point"))?;
    let sig = ed25519_dalek::Signature::from_slice(signature)
        .map_err(|_| CryptoError::InvalidInput("Ed25519 signature must be 64 bytes"))?;
    Ok(vk.verify(message, &sig).is_ok())
}

// ---------------------------------------------------------------------------
// ECDSA-P256
// ---------------------------------------------------------------------------

pub fn p256_keygen() -> KeyPair {
    let sk = p256::ecdsa::SigningKey::random(&mut OsRng);
    let public_key = sk.verifying_key().to_encoded_point(false).as_bytes().to_vec();
    KeyPair {
        public_key,
        secret_key: Zeroizing::new(sk.to_bytes().to_vec()),
    }
}

pub fn p256_sign(secret_key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if secret_key.len() != P256_SECRET_BYTES {
        return Err(CryptoError::InvalidKey("ECDSA-P256 secret key must be 32 bytes"));
    }
    let sk = p256::ecdsa::SigningKey::from_slice(secret_key)
        .map_err(|_| CryptoError::InvalidKey("ECDSA-P256 secret scalar out of range"))?;
    let sig: p256::ecdsa::Signature = sk.try_sign(message).map_err(|_| CryptoError::SigningFailed)?;
    Ok(sig.to_bytes().to_vec())
}

pub fn p256_verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
    let vk = p256::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|_| CryptoError::InvalidKey("ECDSA-P256 public key is not a valid SEC1 point"))?;
    let sig = p256::ecdsa::Signature::from_slice(signature)
        .map_err(|_| CryptoError::InvalidInput("ECDSA-P256 signature must be 64 bytes"))?;
    Ok(vk.verify(message, &sig).is_ok())
}
