use aes_gcm::{
    aead::{Aead as _, KeyInit as _},
    Aes256Gcm, Nonce,
};
use argon2::{
    password_hash::{PasswordHasher as _, SaltString},
    Algorithm, Argon2, Params, Version,
};
use base64::Engine as _;
use hkdf::Hkdf;
use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

pub const SECRET_BOX_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("argon2 params: {0}")]
    KdfParams(String),

    #[error("argon2 hash: {0}")]
    Kdf(String),

    #[error("hkdf expand: {0}")]
    Expand(String),

    #[error("cipher init: {0}")]
    CipherInit(String),

    #[error("encrypt: {0}")]
    Seal(String),

    #[error("decrypt failed")]
    Open,

    #[error("unsupported secret box version: {0}")]
    UnsupportedVersion(u8),

    #[error("malformed secret box: {0}")]
    Malformed(String),

    #[error("wallet is already encrypted")]
    AlreadySealed,
}

/// One encrypted field of a wallet: AES-256-GCM ciphertext plus its nonce.
/// The KDF salt is wallet-level, not per-box.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretBox {
    pub v: u8,
    pub nonce_b64: String,
    pub ct_b64: String,
}

pub fn fill_random(buf: &mut [u8]) {
    let mut rng = rand::rng();
    rng.fill_bytes(buf);
}

pub fn random_salt16() -> [u8; 16] {
    let mut s = [0_u8; 16];
    fill_random(&mut s);
    s
}

pub fn derive_password_key(
    password: &SecretString,
    salt16: &[u8; 16],
) -> Result<[u8; 32], CryptoError> {
    // Freeze Argon2id parameters to avoid accidental changes across dependency updates.
    // These match `argon2::Params::DEFAULT` in argon2 0.5.x.
    let params = Params::new(19 * 1024, 2, 1, Some(32))
        .map_err(|e| CryptoError::KdfParams(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let salt = SaltString::encode_b64(salt16).map_err(|e| CryptoError::Kdf(e.to_string()))?;

    // We use a PHC hash but only take the raw bytes; this keeps parameters versioned.
    let hash = argon2
        .hash_password(password.expose_secret().as_bytes(), &salt)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    let bytes = hash
        .hash
        .ok_or_else(|| CryptoError::Kdf("missing hash output".into()))?;
    let raw = bytes.as_bytes();
    let Some(prefix) = raw.get(..32) else {
        return Err(CryptoError::Kdf("hash too short".into()));
    };
    let mut out = [0_u8; 32];
    out.copy_from_slice(prefix);
    Ok(out)
}

/// Expand the derived password key into one subkey per encrypted field, so
/// seed, last-seed, and each entry secret are sealed under distinct keys.
pub fn derive_subkey(base: &[u8; 32], purpose: &str) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, base);
    let info = format!("harborkey:{purpose}");
    let mut out = [0_u8; 32];
    hk.expand(info.as_bytes(), &mut out)
        .map_err(|e| CryptoError::Expand(e.to_string()))?;
    Ok(out)
}

pub fn seal(key32: &[u8; 32], plaintext: &[u8]) -> Result<SecretBox, CryptoError> {
    let cipher =
        Aes256Gcm::new_from_slice(key32).map_err(|e| CryptoError::CipherInit(e.to_string()))?;
    let mut nonce = [0_u8; 12];
    fill_random(&mut nonce);
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::Seal(e.to_string()))?;

    Ok(SecretBox {
        v: SECRET_BOX_VERSION,
        nonce_b64: base64::engine::general_purpose::STANDARD.encode(nonce),
        ct_b64: base64::engine::general_purpose::STANDARD.encode(ct),
    })
}

pub fn open(key32: &[u8; 32], b: &SecretBox) -> Result<Vec<u8>, CryptoError> {
    if b.v != SECRET_BOX_VERSION {
        return Err(CryptoError::UnsupportedVersion(b.v));
    }
    let cipher =
        Aes256Gcm::new_from_slice(key32).map_err(|e| CryptoError::CipherInit(e.to_string()))?;
    let nonce = base64::engine::general_purpose::STANDARD
        .decode(&b.nonce_b64)
        .map_err(|e| CryptoError::Malformed(format!("nonce: {e}")))?;
    if nonce.len() != 12 {
        return Err(CryptoError::Malformed("invalid nonce length".into()));
    }
    let ct = base64::engine::general_purpose::STANDARD
        .decode(&b.ct_b64)
        .map_err(|e| CryptoError::Malformed(format!("ciphertext: {e}")))?;

    cipher
        .decrypt(Nonce::from_slice(&nonce), ct.as_ref())
        .map_err(|_| CryptoError::Open)
}
