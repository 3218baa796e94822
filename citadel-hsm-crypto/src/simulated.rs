//! Deterministic stand-in provider for running without hardware.
//!
//! **Never use this to protect data.** Encryption is a SHA-256 keystream,
//! "signatures" are keyed hashes anyone holding the public key can forge,
//! and the KEM derives the shared secret from public values. The provider
//! exists so the full HSM pipeline (pool, audit, metrics) can be exercised
//! in tests with reproducible outputs: two providers created with the same
//! seed and driven with the same call sequence return identical bytes.
//!
//! Digests and HKDF are computed for real.

use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::algorithm::{Algorithm, AlgorithmCategory};
use crate::error::CryptoError;
use crate::provider::{CryptoProvider, Encapsulation, KeyPair, SecretBytes};
use crate::software::{self, SoftwareProvider};

/// Version byte of a simulated ciphertext frame. Distinct from the real AEAD
/// frame so the two can never be confused.
pub const SIM_FRAME_VERSION: u8 = 0xF1;
const SIM_NONCE_BYTES: usize = 12;
const SIM_TAG_BYTES: usize = 16;
const SIM_KEY_BYTES: usize = 32;

#[derive(Debug)]
pub struct SimulatedProvider {
    seed: u64,
    counter: AtomicU64,
}

impl SimulatedProvider {
    pub fn new(seed: u64) -> Self {
        Self { seed, counter: AtomicU64::new(0) }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Next 32 pseudo-random bytes in this provider's deterministic stream.
    fn draw(&self, label: &[u8]) -> [u8; 32] {
        let n = self.next();
        h(&[label, &self.seed.to_be_bytes(), &n.to_be_bytes()])
    }
}

fn h(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update((p.len() as u64).to_be_bytes());
        hasher.update(p);
    }
    hasher.finalize().into()
}

fn keystream_xor(key: &[u8], nonce: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for (block_index, chunk) in data.chunks(32).enumerate() {
        let block = h(&[b"ks", key, nonce, &(block_index as u64).to_be_bytes()]);
        out.extend(chunk.iter().zip(block.iter()).map(|(a, b)| a ^ b));
    }
    out
}

fn tag(key: &[u8], nonce: &[u8], aad: &[u8], body: &[u8]) -> [u8; SIM_TAG_BYTES] {
    let full = h(&[b"tag", key, nonce, aad, body]);
    let mut t = [0u8; SIM_TAG_BYTES];
    t.copy_from_slice(&full[..SIM_TAG_BYTES]);
    t
}

fn sim_signature(public_key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut sig = Vec::with_capacity(64);
    sig.extend_from_slice(&h(&[b"sig-r", public_key, message]));
    sig.extend_from_slice(&h(&[b"sig-s", public_key, message]));
    sig
}

impl CryptoProvider for SimulatedProvider {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn is_simulated(&self) -> bool {
        true
    }

    fn generate_secret_key(&self, algorithm: Algorithm) -> Result<SecretBytes, CryptoError> {
        algorithm.expect_category(AlgorithmCategory::Symmetric)?;
        Ok(Zeroizing::new(self.draw(b"secret").to_vec()))
    }

    fn generate_key_pair(&self, algorithm: Algorithm) -> Result<KeyPair, CryptoError> {
        if !algorithm.is_signature() && !algorithm.is_kem() {
            return Err(CryptoError::WrongCategory {
                algorithm,
                expected: AlgorithmCategory::Asymmetric,
            });
        }
        let sk = self.draw(algorithm.name().as_bytes());
        let pk = h(&[b"pk", algorithm.name().as_bytes(), &sk]);
        Ok(KeyPair {
            public_key: pk.to_vec(),
            secret_key: Zeroizing::new(sk.to_vec()),
        })
    }

    fn encrypt(
        &self,
        algorithm: Algorithm,
        key: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        algorithm.expect_category(AlgorithmCategory::Symmetric)?;
        if key.len() != SIM_KEY_BYTES {
            return Err(CryptoError::InvalidKey("simulated key must be 32 bytes"));
        }
        let nonce_full = h(&[b"nonce", key, aad, plaintext]);
        let nonce = &nonce_full[..SIM_NONCE_BYTES];
        let body = keystream_xor(key, nonce, plaintext);
        let t = tag(key, nonce, aad, &body);

        let mut out = Vec::with_capacity(1 + SIM_NONCE_BYTES + body.len() + SIM_TAG_BYTES);
        out.push(SIM_FRAME_VERSION);
        out.extend_from_slice(nonce);
        out.extend_from_slice(&body);
        out.extend_from_slice(&t);
        Ok(out)
    }

    fn decrypt(
        &self,
        algorithm: Algorithm,
        key: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        algorithm.expect_category(AlgorithmCategory::Symmetric)?;
        if key.len() != SIM_KEY_BYTES {
            return Err(CryptoError::InvalidKey("simulated key must be 32 bytes"));
        }
        if ciphertext.len() < 1 + SIM_NONCE_BYTES + SIM_TAG_BYTES || ciphertext[0] != SIM_FRAME_VERSION {
            return Err(CryptoError::DecryptionFailed);
        }
        let nonce = &ciphertext[1..1 + SIM_NONCE_BYTES];
        let tag_start = ciphertext.len() - SIM_TAG_BYTES;
        let body = &ciphertext[1 + SIM_NONCE_BYTES..tag_start];
        let expected = tag(key, nonce, aad, body);
        if !bool::from(expected[..].ct_eq(&ciphertext[tag_start..])) {
            return Err(CryptoError::DecryptionFailed);
        }
        Ok(keystream_xor(key, nonce, body))
    }

    fn encapsulate(&self, algorithm: Algorithm, public_key: &[u8]) -> Result<Encapsulation, CryptoError> {
        algorithm.expect_category(AlgorithmCategory::PostQuantum)?;
        if public_key.len() != 32 {
            return Err(CryptoError::InvalidKey("simulated public key must be 32 bytes"));
        }
        let ct = h(&[b"ct", public_key, &self.draw(b"encap")]);
        let ss = h(&[b"ss", public_key, &ct]);
        Ok(Encapsulation {
            ciphertext: ct.to_vec(),
            shared_secret: Zeroizing::new(ss.to_vec()),
        })
    }

    fn decapsulate(
        &self,
        algorithm: Algorithm,
        secret_key: &[u8],
        ciphertext: &[u8],
    ) -> Result<SecretBytes, CryptoError> {
        algorithm.expect_category(AlgorithmCategory::PostQuantum)?;
        if ciphertext.len() != 32 {
            return Err(CryptoError::DecryptionFailed);
        }
        let pk = h(&[b"pk", algorithm.name().as_bytes(), secret_key]);
        Ok(Zeroizing::new(h(&[b"ss", &pk, ciphertext]).to_vec()))
    }

    fn sign(&self, algorithm: Algorithm, secret_key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        algorithm.expect_category(AlgorithmCategory::Asymmetric)?;
        let pk = h(&[b"pk", algorithm.name().as_bytes(), secret_key]);
        Ok(sim_signature(&pk, message))
    }

    fn verify(
        &self,
        algorithm: Algorithm,
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        algorithm.expect_category(AlgorithmCategory::Asymmetric)?;
        if signature.len() != 64 {
            return Err(CryptoError::InvalidInput("simulated signature must be 64 bytes"));
        }
        let expected = sim_signature(public_key, message);
        Ok(bool::from(expected.as_slice().ct_eq(signature)))
    }

    fn digest(&self, algorithm: Algorithm, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        software::digest(algorithm, data)
    }

    fn derive(
        &self,
        algorithm: Algorithm,
        ikm: &[u8],
        salt: Option<&[u8]>,
        info: &[u8],
        length: usize,
    ) -> Result<SecretBytes, CryptoError> {
        SoftwareProvider.derive(algorithm, ikm, salt, info, length)
    }
}
