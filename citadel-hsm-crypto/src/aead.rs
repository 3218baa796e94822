//! AEAD: AES-256-GCM
//!
//! Sealed frame:
//!   version[1] || nonce[12] || ciphertext || tag[16]
//!
//! The nonce is drawn fresh from the OS for every seal. The version byte
//! is authenticated together with the caller's AAD so a frame cannot be
//! re-labelled.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use getrandom::getrandom;

use crate::error::CryptoError;

pub const KEY_BYTES: usize = 32;
pub const NONCE_BYTES: usize = 12;
pub const TAG_BYTES: usize = 16;
pub const FRAME_VERSION: u8 = 0x01;
/// Smallest frame that can possibly open (empty plaintext).
pub const MIN_FRAME_BYTES: usize = 1 + NONCE_BYTES + TAG_BYTES;

/// Generate a random 12-byte nonce.
pub fn nonce() -> Result<[u8; NONCE_BYTES], CryptoError> {
    let mut n = [0u8; NONCE_BYTES];
    getrandom(&mut n).map_err(|_| CryptoError::RandomnessUnavailable)?;
    Ok(n)
}

/// Generate a random 256-bit key.
pub fn generate_key() -> Result<[u8; KEY_BYTES], CryptoError> {
    let mut k = [0u8; KEY_BYTES];
    getrandom(&mut k).map_err(|_| CryptoError::RandomnessUnavailable)?;
    Ok(k)
}

fn framed_aad(aad: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + aad.len());
    out.push(FRAME_VERSION);
    out.extend_from_slice(aad);
    out
}

/// Encrypt `plaintext` under `key` and return a self-describing frame.
pub fn seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_BYTES {
        return Err(CryptoError::InvalidKey("AES-256-GCM key must be 32 bytes"));
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::EncryptionFailed)?;
    let n = nonce()?;
    let full_aad = framed_aad(aad);
    let payload = Payload { msg: plaintext, aad: &full_aad };
    let ct = cipher
        .encrypt(Nonce::from_slice(&n), payload)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut frame = Vec::with_capacity(1 + NONCE_BYTES + ct.len());
    frame.push(FRAME_VERSION);
    frame.extend_from_slice(&n);
    frame.extend_from_slice(&ct);
    Ok(frame)
}

/// Open a frame produced by [`seal`]. Every failure after the key length
/// check is reported as [`CryptoError::DecryptionFailed`].
pub fn open(key: &[u8], frame: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_BYTES {
        return Err(CryptoError::InvalidKey("AES-256-GCM key must be 32 bytes"));
    }
    if frame.len() < MIN_FRAME_BYTES || frame[0] != FRAME_VERSION {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::DecryptionFailed)?;
    let n = Nonce::from_slice(&frame[1..1 + NONCE_BYTES]);
    let full_aad = framed_aad(aad);
    let payload = Payload { msg: &frame[1 + NONCE_BYTES..], aad: &full_aad };
    cipher.decrypt(n, payload).map_err(|_| CryptoError::DecryptionFailed)
}
