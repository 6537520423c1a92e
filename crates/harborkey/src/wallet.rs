use crate::{
    balance::BalanceGetter,
    crypto::{self, CryptoError, SecretBox},
    errors::RegistryError,
    keys::{self, KeyError},
};
use base64::Engine as _;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize as _;

/// Current wallet schema version.
pub const WALLET_VERSION: &str = "0.2";

/// Pre-encryption schema version that wrote plaintext `<id>.bak` backups.
pub const LEGACY_BACKUP_VERSION: &str = "0.1";

/// One derived address with its keypair. Index order is derivation order;
/// entries only ever append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub address: String,
    pub public_key: String,
    /// Hex secret key; empty is the zero value once the wallet is encrypted.
    #[serde(default)]
    pub secret_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_secret_key: Option<SecretBox>,
}

/// Seed material: plaintext until the encryption workflow seals it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeedField {
    Plain(String),
    Sealed(SecretBox),
}

impl SeedField {
    fn as_plain(&self) -> Result<&str, KeyError> {
        match self {
            Self::Plain(s) => Ok(s),
            Self::Sealed(_) => Err(KeyError::Sealed),
        }
    }
}

#[derive(Debug, Default)]
pub struct WalletOptions {
    pub label: String,
    /// Seed to build the wallet from; a fresh mnemonic is generated when absent.
    pub seed: Option<String>,
    /// When present, the wallet is encrypted before it is first persisted.
    pub password: Option<SecretString>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    /// Stable identifier, also the persisted filename.
    pub id: String,
    pub label: String,
    pub version: String,
    pub encrypted: bool,
    /// KDF salt for the sealed fields; set by the encryption workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf_salt_b64: Option<String>,
    pub created_at: i64,
    pub seed: SeedField,
    /// Checkpoint of the derivation chain after the last entry; deriving
    /// from it continues the chain without replaying it.
    pub last_seed: SeedField,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

impl Wallet {
    pub fn new(id: String, options: &WalletOptions) -> Result<Self, KeyError> {
        let seed = match &options.seed {
            Some(s) if s.is_empty() => return Err(KeyError::EmptySeed),
            Some(s) => s.clone(),
            None => keys::new_seed()?,
        };
        Ok(Self {
            id,
            label: options.label.clone(),
            version: WALLET_VERSION.to_owned(),
            encrypted: false,
            kdf_salt_b64: None,
            created_at: chrono::Utc::now().timestamp(),
            seed: SeedField::Plain(seed.clone()),
            last_seed: SeedField::Plain(seed),
            entries: Vec::new(),
        })
    }

    pub fn first_address(&self) -> Option<&str> {
        self.entries.first().map(|e| e.address.as_str())
    }

    pub fn addresses(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.address.clone()).collect()
    }

    /// Append `num` entries derived from the seed checkpoint; returns the new
    /// addresses in derivation order.
    pub fn generate_addresses(&mut self, num: u64) -> Result<Vec<String>, KeyError> {
        if self.encrypted {
            return Err(KeyError::Sealed);
        }
        let mut checkpoint = self.last_seed.as_plain()?.to_owned();
        let mut new_addrs = Vec::with_capacity(usize::try_from(num).unwrap_or(0));
        for _ in 0..num {
            let d = keys::derive_next(&checkpoint)?;
            checkpoint = d.checkpoint;
            self.entries.push(Entry {
                address: d.address.clone(),
                public_key: d.public_hex,
                secret_key: d.secret_hex,
                encrypted_secret_key: None,
            });
            new_addrs.push(d.address);
        }
        self.last_seed = SeedField::Plain(checkpoint);
        Ok(new_addrs)
    }

    /// Scan-ahead protocol: probe up to `scan_n` addresses past the current
    /// entries and keep everything through the highest one with a positive
    /// balance. Pre-existing entries are never removed; when nothing is
    /// found, the probe leaves the wallet exactly as it was.
    pub fn scan_addresses(
        &mut self,
        scan_n: u64,
        bg: &dyn BalanceGetter,
    ) -> Result<(), RegistryError> {
        if scan_n == 0 {
            return Ok(());
        }
        if self.encrypted {
            return Err(KeyError::Sealed.into());
        }
        let existing = self.entries.len();
        let before_checkpoint = self.last_seed.as_plain()?.to_owned();

        // Candidate checkpoint after each generated entry, so the chain can
        // be rewound to exactly the retained frontier.
        let mut checkpoint = before_checkpoint.clone();
        let mut checkpoints = Vec::with_capacity(usize::try_from(scan_n).unwrap_or(0));
        let mut candidates = Vec::with_capacity(checkpoints.capacity());
        for _ in 0..scan_n {
            let d = keys::derive_next(&checkpoint)?;
            checkpoint = d.checkpoint.clone();
            checkpoints.push(d.checkpoint);
            candidates.push(Entry {
                address: d.address,
                public_key: d.public_hex,
                secret_key: d.secret_hex,
                encrypted_secret_key: None,
            });
        }

        let addrs: Vec<String> = candidates.iter().map(|e| e.address.clone()).collect();
        let balances = bg.get_balances(&addrs).map_err(RegistryError::Balance)?;
        if balances.len() != addrs.len() {
            return Err(RegistryError::Balance(
                format!(
                    "expected {} balance pairs, got {}",
                    addrs.len(),
                    balances.len()
                )
                .into(),
            ));
        }

        let mut keep: Option<(usize, String)> = None;
        for (i, (b, cp)) in balances.iter().zip(&checkpoints).enumerate() {
            if b.is_positive() {
                keep = Some((i, cp.clone()));
            }
        }

        match keep {
            Some((i, cp)) => {
                self.entries.extend(candidates.into_iter().take(i + 1));
                self.last_seed = SeedField::Plain(cp);
            }
            None => {
                self.entries.truncate(existing);
                self.last_seed = SeedField::Plain(before_checkpoint);
            }
        }
        Ok(())
    }

    /// Encryption workflow, run on a private clone by the registry: seal the
    /// seed, the checkpoint, and every entry secret individually, zeroing
    /// each plaintext as its sealed form is stored. Any failure leaves the
    /// caller free to discard this clone; nothing is committed piecemeal.
    pub(crate) fn encrypt_in_place(&mut self, password: &SecretString) -> Result<(), CryptoError> {
        if self.encrypted {
            return Err(CryptoError::AlreadySealed);
        }
        let SeedField::Plain(seed_plain) = self.seed.clone() else {
            return Err(CryptoError::AlreadySealed);
        };
        let SeedField::Plain(last_seed_plain) = self.last_seed.clone() else {
            return Err(CryptoError::AlreadySealed);
        };

        self.version = WALLET_VERSION.to_owned();

        let salt = crypto::random_salt16();
        let mut base = crypto::derive_password_key(password, &salt)?;

        let result = Self::seal_fields(&base, seed_plain, last_seed_plain, &mut self.entries);
        base.zeroize();
        let (sealed_seed, sealed_last_seed) = result?;

        self.seed = SeedField::Sealed(sealed_seed);
        self.last_seed = SeedField::Sealed(sealed_last_seed);
        self.kdf_salt_b64 = Some(base64::engine::general_purpose::STANDARD.encode(salt));
        self.encrypted = true;
        Ok(())
    }

    fn seal_fields(
        base: &[u8; 32],
        mut seed_plain: String,
        mut last_seed_plain: String,
        entries: &mut [Entry],
    ) -> Result<(SecretBox, SecretBox), CryptoError> {
        let seed_key = crypto::derive_subkey(base, "seed")?;
        let sealed_seed = crypto::seal(&seed_key, seed_plain.as_bytes())?;
        seed_plain.zeroize();

        let last_key = crypto::derive_subkey(base, "last_seed")?;
        let sealed_last_seed = crypto::seal(&last_key, last_seed_plain.as_bytes())?;
        last_seed_plain.zeroize();

        for (i, entry) in entries.iter_mut().enumerate() {
            let key = crypto::derive_subkey(base, &format!("entry:{i}"))?;
            let mut sk_bytes = hex::decode(&entry.secret_key)
                .map_err(|e| CryptoError::Malformed(format!("entry {i} secret: {e}")))?;
            let sealed = crypto::seal(&key, &sk_bytes)?;
            sk_bytes.zeroize();
            entry.encrypted_secret_key = Some(sealed);
            entry.secret_key.zeroize();
        }

        Ok((sealed_seed, sealed_last_seed))
    }
}
