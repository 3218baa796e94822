//! Cryptographic providers for Citadel HSM.
//!
//! The HSM layer never calls a primitive directly. It goes through the
//! [`CryptoProvider`] contract, which has two implementations:
//!
//! - [`SoftwareProvider`]: AES-256-GCM, Ed25519, ECDSA-P256, ML-KEM-768,
//!   the X25519 + ML-KEM-768 hybrid, SHA-2/SHA-3 and HKDF-SHA256, all from
//!   independently audited crates.
//! - [`SimulatedProvider`]: deterministic, hash-based, for tests and
//!   hardware-less runs only.

pub mod aead;
pub mod algorithm;
pub mod error;
pub mod kem;
pub mod provider;
pub mod signing;
pub mod simulated;
pub mod software;

pub use algorithm::{Algorithm, AlgorithmCategory};
pub use error::CryptoError;
pub use provider::{CryptoProvider, Encapsulation, KeyPair, SecretBytes};
pub use simulated::SimulatedProvider;
pub use software::SoftwareProvider;
