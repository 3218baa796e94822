#![allow(dead_code)]

use citadel_hsm::config::AuthMethod;
use citadel_hsm::vendor::{GeneratedKey, KeySpec, VendorCapabilities, VendorEndpoint, VendorSession};
use citadel_hsm::{Algorithm, SecretBytes, SoftToken, VendorAdapter, VendorError, VendorRegistry};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SCRIPTED_VENDOR: &str = "scripted";

/// A soft token whose misbehaviour is switched on per test.
pub struct ScriptedToken {
    pub inner: SoftToken,
    /// Upcoming `connect` calls to fail.
    pub fail_connects: AtomicUsize,
    pub connects: AtomicUsize,
    pub panic_on_encrypt: AtomicBool,
    /// Close the session under the caller and report it lost.
    pub drop_on_sign: AtomicBool,
    /// Added to every key operation.
    pub delay_ms: AtomicU64,
}

impl ScriptedToken {
    pub fn new() -> Self {
        Self {
            inner: SoftToken::simulated(11),
            fail_connects: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            panic_on_encrypt: AtomicBool::new(false),
            drop_on_sign: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        }
    }

    fn pause(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }
}

impl VendorAdapter for ScriptedToken {
    fn name(&self) -> &str {
        SCRIPTED_VENDOR
    }

    fn capabilities(&self) -> VendorCapabilities {
        self.inner.capabilities()
    }

    fn connect(&self, endpoint: &VendorEndpoint) -> Result<VendorSession, VendorError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(VendorError::new("CKR_TOKEN_NOT_PRESENT", "scripted handshake failure"));
        }
        self.inner.connect(endpoint)
    }

    fn disconnect(&self, session: &VendorSession) {
        self.inner.disconnect(session)
    }

    fn generate_key(&self, session: &VendorSession, spec: &KeySpec) -> Result<GeneratedKey, VendorError> {
        self.pause();
        self.inner.generate_key(session, spec)
    }

    fn encrypt(&self, session: &VendorSession, handle: &str, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, VendorError> {
        self.pause();
        if self.panic_on_encrypt.load(Ordering::SeqCst) {
            panic!("scripted adapter panic");
        }
        self.inner.encrypt(session, handle, plaintext, aad)
    }

    fn decrypt(&self, session: &VendorSession, handle: &str, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, VendorError> {
        self.pause();
        self.inner.decrypt(session, handle, ciphertext, aad)
    }

    fn sign(
        &self,
        session: &VendorSession,
        handle: &str,
        message: &[u8],
        prehash: Option<Algorithm>,
    ) -> Result<Vec<u8>, VendorError> {
        self.pause();
        if self.drop_on_sign.load(Ordering::SeqCst) {
            self.inner.disconnect(session);
        }
        self.inner.sign(session, handle, message, prehash)
    }

    fn verify(
        &self,
        session: &VendorSession,
        handle: &str,
        message: &[u8],
        signature: &[u8],
        prehash: Option<Algorithm>,
    ) -> Result<bool, VendorError> {
        self.pause();
        self.inner.verify(session, handle, message, signature, prehash)
    }

    fn encapsulate(&self, session: &VendorSession, handle: &str) -> Result<(Vec<u8>, SecretBytes), VendorError> {
        self.pause();
        self.inner.encapsulate(session, handle)
    }

    fn decapsulate(&self, session: &VendorSession, handle: &str, ciphertext: &[u8]) -> Result<SecretBytes, VendorError> {
        self.pause();
        self.inner.decapsulate(session, handle, ciphertext)
    }

    fn public_key(&self, session: &VendorSession, handle: &str) -> Result<Vec<u8>, VendorError> {
        self.inner.public_key(session, handle)
    }

    fn destroy_key(&self, session: &VendorSession, handle: &str) -> Result<(), VendorError> {
        self.inner.destroy_key(session, handle)
    }
}

/// A registry whose `scripted` vendor always hands out `token`.
pub fn registry_with(token: Arc<ScriptedToken>) -> VendorRegistry {
    let mut registry = VendorRegistry::with_builtins();
    registry.register(SCRIPTED_VENDOR, move |_| {
        let adapter: Arc<dyn VendorAdapter> = token.clone();
        Ok(adapter)
    });
    registry
}

pub fn endpoint() -> VendorEndpoint {
    VendorEndpoint {
        address: "slot:0".into(),
        auth: AuthMethod::None,
        credential: None,
    }
}
