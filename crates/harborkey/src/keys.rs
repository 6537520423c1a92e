use bip39::{Language, Mnemonic};
use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

pub const SECRET_KEY_LEN: usize = 32;
const ADDRESS_PAYLOAD_LEN: usize = 20;
const ADDRESS_CHECKSUM_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum KeyError {
    /// The wallet's seed checkpoint or entry secrets are encrypted; nothing
    /// can be derived or signed at this layer without the plaintext form.
    #[error("wallet secrets are encrypted")]
    Sealed,

    #[error("empty seed")]
    EmptySeed,

    #[error("malformed secret key: {0}")]
    MalformedSecret(String),

    #[error("mnemonic generation: {0}")]
    Mnemonic(String),
}

/// One step of the deterministic derivation chain.
#[derive(Debug, Clone)]
pub struct Derived {
    /// Seed checkpoint after this step, hex-encoded. Feeding it back into
    /// [`derive_next`] regenerates the rest of the chain.
    pub checkpoint: String,
    pub secret_hex: String,
    pub public_hex: String,
    pub address: String,
}

/// Derive the next keypair in the chain from the current seed checkpoint
/// (the wallet seed itself for the first step).
pub fn derive_next(checkpoint: &str) -> Result<Derived, KeyError> {
    if checkpoint.is_empty() {
        return Err(KeyError::EmptySeed);
    }
    let digest: [u8; 32] = Sha256::digest(checkpoint.as_bytes()).into();
    let signing = SigningKey::from_bytes(&digest);
    let public = signing.verifying_key();
    Ok(Derived {
        checkpoint: hex::encode(digest),
        secret_hex: hex::encode(digest),
        public_hex: hex::encode(public.to_bytes()),
        address: address_from_public(&public),
    })
}

/// Base58 address: 20 bytes of the hashed public key plus a 4-byte checksum.
pub fn address_from_public(public: &VerifyingKey) -> String {
    let digest = Sha256::digest(public.as_bytes());
    let payload: Vec<u8> = digest.iter().copied().take(ADDRESS_PAYLOAD_LEN).collect();
    let check = Sha256::digest(&payload);
    let mut raw = payload;
    raw.extend(check.iter().copied().take(ADDRESS_CHECKSUM_LEN));
    bs58::encode(raw).into_string()
}

pub fn signing_key_from_hex(secret_hex: &str) -> Result<SigningKey, KeyError> {
    let bytes = hex::decode(secret_hex).map_err(|e| KeyError::MalformedSecret(e.to_string()))?;
    let bytes: [u8; SECRET_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| KeyError::MalformedSecret("wrong length".into()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Fresh default seed: a 12-word English mnemonic.
pub fn new_seed() -> Result<String, KeyError> {
    let mnemonic = Mnemonic::generate_in(Language::English, 12)
        .map_err(|e| KeyError::Mnemonic(e.to_string()))?;
    Ok(mnemonic.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() -> eyre::Result<()> {
        let a = derive_next("voyage empty exotic")?;
        let b = derive_next("voyage empty exotic")?;
        assert_eq!(a.address, b.address);
        assert_eq!(a.checkpoint, b.checkpoint);
        assert_eq!(a.secret_hex, b.secret_hex);

        let a2 = derive_next(&a.checkpoint)?;
        let b2 = derive_next(&b.checkpoint)?;
        assert_eq!(a2.address, b2.address);
        assert_ne!(a.address, a2.address);
        Ok(())
    }

    #[test]
    fn distinct_seeds_give_distinct_first_addresses() -> eyre::Result<()> {
        let a = derive_next("seed one")?;
        let b = derive_next("seed two")?;
        assert_ne!(a.address, b.address);
        Ok(())
    }

    #[test]
    fn secret_key_roundtrips_through_hex() -> eyre::Result<()> {
        let d = derive_next("roundtrip seed")?;
        let signing = signing_key_from_hex(&d.secret_hex)?;
        assert_eq!(
            address_from_public(&signing.verifying_key()),
            d.address
        );
        Ok(())
    }

    #[test]
    fn new_seed_is_twelve_words() -> eyre::Result<()> {
        let seed = new_seed()?;
        assert_eq!(seed.split_whitespace().count(), 12);
        Ok(())
    }

    #[test]
    fn empty_checkpoint_is_rejected() {
        assert!(matches!(derive_next(""), Err(KeyError::EmptySeed)));
    }
}
