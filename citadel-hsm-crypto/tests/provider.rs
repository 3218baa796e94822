//! Contract tests run against both providers.

use citadel_hsm_crypto::{Algorithm, CryptoError, CryptoProvider, SimulatedProvider, SoftwareProvider};
use proptest::prelude::*;

fn providers() -> Vec<Box<dyn CryptoProvider>> {
    vec![Box::new(SoftwareProvider::new()), Box::new(SimulatedProvider::new(42))]
}

#[test]
fn symmetric_roundtrip_both_providers() {
    for p in providers() {
        let key = p.generate_secret_key(Algorithm::Aes256Gcm).unwrap();
        assert_eq!(key.len(), 32, "{}", p.name());
        let ct = p.encrypt(Algorithm::Aes256Gcm, &key, b"payload", b"aad").unwrap();
        assert_ne!(&ct[..], b"payload");
        let pt = p.decrypt(Algorithm::Aes256Gcm, &key, &ct, b"aad").unwrap();
        assert_eq!(pt, b"payload", "{}", p.name());
    }
}

#[test]
fn tampered_ciphertext_fails_both_providers() {
    for p in providers() {
        let key = p.generate_secret_key(Algorithm::Aes256Gcm).unwrap();
        let mut ct = p.encrypt(Algorithm::Aes256Gcm, &key, b"payload", b"").unwrap();
        let mid = ct.len() / 2;
        ct[mid] ^= 0x80;
        assert_eq!(
            p.decrypt(Algorithm::Aes256Gcm, &key, &ct, b""),
            Err(CryptoError::DecryptionFailed),
            "{}",
            p.name()
        );
    }
}

#[test]
fn signatures_both_providers() {
    for p in providers() {
        for alg in [Algorithm::Ed25519, Algorithm::EcdsaP256] {
            let kp = p.generate_key_pair(alg).unwrap();
            let sig = p.sign(alg, &kp.secret_key, b"document").unwrap();
            assert!(p.verify(alg, &kp.public_key, b"document", &sig).unwrap());
            assert!(!p.verify(alg, &kp.public_key, b"forged", &sig).unwrap());
        }
    }
}

#[test]
fn kem_both_providers() {
    for p in providers() {
        for alg in [Algorithm::MlKem768, Algorithm::X25519MlKem768] {
            let kp = p.generate_key_pair(alg).unwrap();
            let enc = p.encapsulate(alg, &kp.public_key).unwrap();
            let ss = p.decapsulate(alg, &kp.secret_key, &enc.ciphertext).unwrap();
            assert_eq!(*ss, *enc.shared_secret, "{} {}", p.name(), alg);
            assert_eq!(ss.len(), 32);
        }
    }
}

#[test]
fn digests_agree_between_providers() {
    let soft = SoftwareProvider::new();
    let sim = SimulatedProvider::new(1);
    for alg in [Algorithm::Sha256, Algorithm::Sha512, Algorithm::Sha3_256] {
        assert_eq!(soft.digest(alg, b"x").unwrap(), sim.digest(alg, b"x").unwrap());
    }
    assert!(soft.digest(Algorithm::Aes256Gcm, b"x").is_err());
}

#[test]
fn software_keys_are_not_repeated() {
    let p = SoftwareProvider::new();
    let a = p.generate_secret_key(Algorithm::Aes256Gcm).unwrap();
    let b = p.generate_secret_key(Algorithm::Aes256Gcm).unwrap();
    assert_ne!(*a, *b);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn software_aead_roundtrips(pt in proptest::collection::vec(any::<u8>(), 0..512),
                                aad in proptest::collection::vec(any::<u8>(), 0..64)) {
        let p = SoftwareProvider::new();
        let key = p.generate_secret_key(Algorithm::Aes256Gcm).unwrap();
        let ct = p.encrypt(Algorithm::Aes256Gcm, &key, &pt, &aad).unwrap();
        prop_assert_eq!(p.decrypt(Algorithm::Aes256Gcm, &key, &ct, &aad).unwrap(), pt);
    }

    #[test]
    fn simulated_decrypt_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
        let p = SimulatedProvider::new(9);
        let key = p.generate_secret_key(Algorithm::Aes256Gcm).unwrap();
        let _ = p.decrypt(Algorithm::Aes256Gcm, &key, &bytes, b"");
    }
}
