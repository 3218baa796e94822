use criterion::{black_box, criterion_group, criterion_main, Criterion};

use citadel_hsm_crypto::{Algorithm, CryptoProvider, SoftwareProvider};

fn bench_symmetric(c: &mut Criterion) {
    let p = SoftwareProvider::new();
    let key = p.generate_secret_key(Algorithm::Aes256Gcm).unwrap();
    let plaintext = vec![0x42u8; 1024];
    let ct = p.encrypt(Algorithm::Aes256Gcm, &key, &plaintext, b"aad").unwrap();

    c.bench_function("aes256gcm_encrypt_1k", |b| {
        b.iter(|| p.encrypt(Algorithm::Aes256Gcm, &key, black_box(&plaintext), b"aad").unwrap())
    });
    c.bench_function("aes256gcm_decrypt_1k", |b| {
        b.iter(|| p.decrypt(Algorithm::Aes256Gcm, &key, black_box(&ct), b"aad").unwrap())
    });
}

fn bench_signing(c: &mut Criterion) {
    let p = SoftwareProvider::new();
    for alg in [Algorithm::Ed25519, Algorithm::EcdsaP256] {
        let kp = p.generate_key_pair(alg).unwrap();
        let sig = p.sign(alg, &kp.secret_key, b"message").unwrap();
        c.bench_function(&format!("{}_sign", alg), |b| {
            b.iter(|| p.sign(alg, &kp.secret_key, black_box(b"message")).unwrap())
        });
        c.bench_function(&format!("{}_verify", alg), |b| {
            b.iter(|| p.verify(alg, &kp.public_key, black_box(b"message"), &sig).unwrap())
        });
    }
}

fn bench_kem(c: &mut Criterion) {
    let p = SoftwareProvider::new();
    for alg in [Algorithm::MlKem768, Algorithm::X25519MlKem768] {
        let kp = p.generate_key_pair(alg).unwrap();
        let enc = p.encapsulate(alg, &kp.public_key).unwrap();
        c.bench_function(&format!("{}_keygen", alg), |b| b.iter(|| p.generate_key_pair(alg).unwrap()));
        c.bench_function(&format!("{}_encapsulate", alg), |b| {
            b.iter(|| p.encapsulate(alg, black_box(&kp.public_key)).unwrap())
        });
        c.bench_function(&format!("{}_decapsulate", alg), |b| {
            b.iter(|| p.decapsulate(alg, &kp.secret_key, black_box(&enc.ciphertext)).unwrap())
        });
    }
}

criterion_group!(benches, bench_symmetric, bench_signing, bench_kem);
criterion_main!(benches);
