//! The provider contract every crypto backend satisfies.

use crate::algorithm::Algorithm;
use crate::error::CryptoError;
use zeroize::Zeroizing;

/// Secret bytes that are wiped when dropped.
pub type SecretBytes = Zeroizing<Vec<u8>>;

/// An asymmetric or KEM key pair in the provider's serialized form.
pub struct KeyPair {
    pub public_key: Vec<u8>,
    pub secret_key: SecretBytes,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key_len", &self.public_key.len())
            .field("secret_key", &"[redacted]")
            .finish()
    }
}

/// Output of a KEM encapsulation.
pub struct Encapsulation {
    /// Sent to the holder of the secret key.
    pub ciphertext: Vec<u8>,
    /// 32-byte shared secret.
    pub shared_secret: SecretBytes,
}

/// Cryptographic backend used by the HSM soft token and the simulation mode.
///
/// Every method takes the algorithm explicitly and fails with
/// [`CryptoError::WrongCategory`] when it is handed an algorithm of the wrong
/// kind. Implementations must be callable from many threads at once.
pub trait CryptoProvider: Send + Sync {
    /// Short provider name (for logs and status reports).
    fn name(&self) -> &'static str;

    /// `true` for stand-ins that must never protect real data.
    fn is_simulated(&self) -> bool {
        false
    }

    /// Generate a fresh symmetric key.
    fn generate_secret_key(&self, algorithm: Algorithm) -> Result<SecretBytes, CryptoError>;

    /// Generate a signing or KEM key pair.
    fn generate_key_pair(&self, algorithm: Algorithm) -> Result<KeyPair, CryptoError>;

    fn encrypt(
        &self,
        algorithm: Algorithm,
        key: &[u8],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(
        &self,
        algorithm: Algorithm,
        key: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn encapsulate(&self, algorithm: Algorithm, public_key: &[u8]) -> Result<Encapsulation, CryptoError>;

    fn decapsulate(
        &self,
        algorithm: Algorithm,
        secret_key: &[u8],
        ciphertext: &[u8],
    ) -> Result<SecretBytes, CryptoError>;

    fn sign(&self, algorithm: Algorithm, secret_key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// `Ok(false)` for a well-formed signature that does not verify.
    fn verify(
        &self,
        algorithm: Algorithm,
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError>;

    fn digest(&self, algorithm: Algorithm, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Expand `ikm` into `length` bytes of output keying material.
    fn derive(
        &self,
        algorithm: Algorithm,
        ikm: &[u8],
        salt: Option<&[u8]>,
        info: &[u8],
        length: usize,
    ) -> Result<SecretBytes, CryptoError>;
}
