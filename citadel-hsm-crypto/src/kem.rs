//! Key encapsulation: ML-KEM-768 and the X25519 + ML-KEM-768 hybrid.
//!
//! Pure ML-KEM-768:
//!   PublicKey  = mlkem_ek[1184]
//!   SecretKey  = mlkem_dk[2400]
//!   Ciphertext = mlkem_ct[1088]
//!   Shared     = mlkem_ss[32]
//!
//! Hybrid:
//!   PublicKey  = x25519_pk[32] || mlkem_ek[1184]   (1216 bytes)
//!   SecretKey  = x25519_sk[32] || mlkem_dk[2400]   (2432 bytes)
//!   Ciphertext = x25519_eph_pk[32] || mlkem_ct[1088] (1120 bytes)
//!   Shared     = HKDF-SHA256(x25519_dh || mlkem_ss,
//!                            info = HYBRID_INFO || SHA3-256(ciphertext))[32]
//!
//! Binding the ciphertext hash into the derivation means a swapped
//! ciphertext cannot reproduce the same secret.

use core::convert::TryFrom;

use hkdf::Hkdf;
use ml_kem::{
    kem::{Decapsulate, Encapsulate},
    Ciphertext, EncodedSizeUser, KemCore, MlKem768, MlKem768Params,
};
use rand_core::OsRng;
use sha2::Sha256;
use sha3::{Digest, Sha3_256};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::provider::{Encapsulation, KeyPair, SecretBytes};

pub const X25519_KEY_BYTES: usize = 32;
pub const MLKEM_PUBLIC_KEY_BYTES: usize = 1184;
pub const MLKEM_SECRET_KEY_BYTES: usize = 2400;
pub const MLKEM_CIPHERTEXT_BYTES: usize = 1088;
pub const SHARED_SECRET_BYTES: usize = 32;

pub const HYBRID_PUBLIC_KEY_BYTES: usize = X25519_KEY_BYTES + MLKEM_PUBLIC_KEY_BYTES;
pub const HYBRID_SECRET_KEY_BYTES: usize = X25519_KEY_BYTES + MLKEM_SECRET_KEY_BYTES;
pub const HYBRID_CIPHERTEXT_BYTES: usize = X25519_KEY_BYTES + MLKEM_CIPHERTEXT_BYTES;

const HYBRID_INFO: &[u8] = b"citadel-hsm/kem/x25519-mlkem768";

type Ek = ml_kem::kem::EncapsulationKey<MlKem768Params>;
type Dk = ml_kem::kem::DecapsulationKey<MlKem768Params>;
type MlKemCt = Ciphertext<MlKem768>;

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn parse_ek(bytes: &[u8]) -> Result<Ek, CryptoError> {
    let arr: [u8; MLKEM_PUBLIC_KEY_BYTES] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("ML-KEM-768 public key must be 1184 bytes"))?;
    Ok(Ek::from_bytes(&arr.into()))
}

fn parse_dk(bytes: &[u8]) -> Result<Dk, CryptoError> {
    let arr: Zeroizing<[u8; MLKEM_SECRET_KEY_BYTES]> = Zeroizing::new(
        bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("ML-KEM-768 secret key must be 2400 bytes"))?,
    );
    Ok(Dk::from_bytes(&(*arr).into()))
}

fn parse_x25519_public(bytes: &[u8]) -> Result<X25519PublicKey, CryptoError> {
    let arr: [u8; X25519_KEY_BYTES] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("X25519 public key must be 32 bytes"))?;
    Ok(X25519PublicKey::from(arr))
}

fn parse_x25519_secret(bytes: &[u8]) -> Result<StaticSecret, CryptoError> {
    let arr: Zeroizing<[u8; X25519_KEY_BYTES]> = Zeroizing::new(
        bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("X25519 secret key must be 32 bytes"))?,
    );
    Ok(StaticSecret::from(*arr))
}

fn combine(x25519_ss: &[u8], mlkem_ss: &[u8], ciphertext: &[u8]) -> Result<SecretBytes, CryptoError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(SHARED_SECRET_BYTES * 2));
    ikm.extend_from_slice(x25519_ss);
    ikm.extend_from_slice(mlkem_ss);

    let ct_hash = Sha3_256::digest(ciphertext);
    let mut info = Vec::with_capacity(HYBRID_INFO.len() + ct_hash.len());
    info.extend_from_slice(HYBRID_INFO);
    info.extend_from_slice(&ct_hash);

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut out = Zeroizing::new(vec![0u8; SHARED_SECRET_BYTES]);
    hk.expand(&info, &mut out)
        .map_err(|_| CryptoError::InvalidInput("hkdf output length"))?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// ML-KEM-768
// ---------------------------------------------------------------------------

pub fn mlkem_keygen() -> KeyPair {
    let (dk, ek) = MlKem768::generate(&mut OsRng);
    KeyPair {
        public_key: ek.as_bytes().as_slice().to_vec(),
        secret_key: Zeroizing::new(dk.as_bytes().as_slice().to_vec()),
    }
}

pub fn mlkem_encapsulate(public_key: &[u8]) -> Result<Encapsulation, CryptoError> {
    let ek = parse_ek(public_key)?;
    let (ct, ss) = ek
        .encapsulate(&mut OsRng)
        .map_err(|_| CryptoError::InvalidInput("ML-KEM encapsulation failed"))?;
    Ok(Encapsulation {
        ciphertext: ct.as_slice().to_vec(),
        shared_secret: Zeroizing::new(ss.as_slice().to_vec()),
    })
}

pub fn mlkem_decapsulate(secret_key: &[u8], ciphertext: &[u8]) -> Result<SecretBytes, CryptoError> {
    let dk = parse_dk(secret_key)?;
    let ct = MlKemCt::try_from(ciphertext).map_err(|_| CryptoError::DecryptionFailed)?;
    let ss = dk.decapsulate(&ct).map_err(|_| CryptoError::DecryptionFailed)?;
    Ok(Zeroizing::new(ss.as_slice().to_vec()))
}

// ---------------------------------------------------------------------------
// X25519 + ML-KEM-768 hybrid
// ---------------------------------------------------------------------------

pub fn hybrid_keygen() -> KeyPair {
    let x25519_sk = StaticSecret::random_from_rng(OsRng);
    let x25519_pk = X25519PublicKey::from(&x25519_sk);
    let (mlkem_dk, mlkem_ek) = MlKem768::generate(&mut OsRng);

    let mut public_key = Vec::with_capacity(HYBRID_PUBLIC_KEY_BYTES);
    public_key.extend_from_slice(x25519_pk.as_bytes());
    public_key.extend_from_slice(mlkem_ek.as_bytes().as_slice());

    let mut secret_key = Zeroizing::new(Vec::with_capacity(HYBRID_SECRET_KEY_BYTES));
    secret_key.extend_from_slice(&x25519_sk.to_bytes());
    secret_key.extend_from_slice(mlkem_dk.as_bytes().as_slice());

    KeyPair { public_key, secret_key }
}

pub fn hybrid_encapsulate(public_key: &[u8]) -> Result<Encapsulation, CryptoError> {
    if public_key.len() != HYBRID_PUBLIC_KEY_BYTES {
        return Err(CryptoError::InvalidKey("hybrid public key must be 1216 bytes"));
    }
    let x25519_pk = parse_x25519_public(&public_key[..X25519_KEY_BYTES])?;
    let ek = parse_ek(&public_key[X25519_KEY_BYTES..])?;

    let eph = EphemeralSecret::random_from_rng(OsRng);
    let eph_pk = X25519PublicKey::from(&eph);
    let x25519_ss = eph.diffie_hellman(&x25519_pk);

    let (mlkem_ct, mlkem_ss) = ek
        .encapsulate(&mut OsRng)
        .map_err(|_| CryptoError::InvalidInput("ML-KEM encapsulation failed"))?;

    let mut ciphertext = Vec::with_capacity(HYBRID_CIPHERTEXT_BYTES);
    ciphertext.extend_from_slice(eph_pk.as_bytes());
    ciphertext.extend_from_slice(mlkem_ct.as_slice());

    let shared_secret = combine(x25519_ss.as_bytes(), mlkem_ss.as_slice(), &ciphertext)?;
    Ok(Encapsulation { ciphertext, shared_secret })
}

pub fn hybrid_decapsulate(secret_key: &[u8], ciphertext: &[u8]) -> Result<SecretBytes, CryptoError> {
    if secret_key.len() != HYBRID_SECRET_KEY_BYTES {
        return Err(CryptoError::InvalidKey("hybrid secret key must be 2432 bytes"));
    }
    if ciphertext.len() != HYBRID_CIPHERTEXT_BYTES {
        return Err(CryptoError::DecryptionFailed);
    }
    let x25519_sk = parse_x25519_secret(&secret_key[..X25519_KEY_BYTES])?;
    let dk = parse_dk(&secret_key[X25519_KEY_BYTES..])?;

    let eph_pk = parse_x25519_public(&ciphertext[..X25519_KEY_BYTES])
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let mlkem_ct = MlKemCt::try_from(&ciphertext[X25519_KEY_BYTES..])
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let x25519_ss = x25519_sk.diffie_hellman(&eph_pk);
    let mlkem_ss = dk.decapsulate(&mlkem_ct).map_err(|_| CryptoError::DecryptionFailed)?;

    combine(x25519_ss.as_bytes(), mlkem_ss.as_slice(), ciphertext)
}
