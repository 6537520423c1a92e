use crate::{errors::BoxError, keys, wallet::Wallet};
use ed25519_dalek::Signer as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TxError {
    #[error("please spend after your pending transaction is confirmed")]
    UnconfirmedSpend,

    #[error("balance is not sufficient: have {have}, want {want}")]
    InsufficientBalance { have: u64, want: u64 },

    #[error("wallet is encrypted; cannot sign")]
    Sealed,

    #[error("zero spend amount")]
    ZeroCoins,

    #[error("wallet has no entries")]
    NoEntries,

    #[error("no key for address {0}")]
    UnknownAddress(String),

    #[error("malformed entry secret: {0}")]
    MalformedSecret(String),

    #[error("spend validation failed: {0}")]
    Validator(#[source] BoxError),
}

/// Refuses a spend while earlier transactions from the same addresses are
/// still unconfirmed.
pub trait TxValidator {
    fn has_unconfirmed_spends(&self, addrs: &[String]) -> Result<bool, BoxError>;
}

/// Source of spendable outputs for a set of addresses.
pub trait UnspentSource {
    fn unspents_of(&self, addrs: &[String]) -> Vec<UnspentOutput>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    /// Unique hash of the output being spent.
    pub hash: String,
    pub address: String,
    pub coins: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub address: String,
    pub coins: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub timestamp: u64,
    /// Hashes of the spent outputs.
    pub inputs: Vec<String>,
    pub outputs: Vec<TransactionOutput>,
    /// Hex ed25519 signature per input, in input order.
    pub signatures: Vec<String>,
}

impl Transaction {
    /// Digest over timestamp, inputs and outputs; signatures sign this.
    pub fn digest(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(self.timestamp.to_le_bytes());
        for input in &self.inputs {
            h.update(input.as_bytes());
            h.update([0]);
        }
        for out in &self.outputs {
            h.update(out.address.as_bytes());
            h.update([0]);
            h.update(out.coins.to_le_bytes());
        }
        h.finalize().into()
    }
}

impl Wallet {
    /// Build and sign a transaction spending `coins` to `dest`, with change
    /// back to the wallet's first address. Selection is deterministic:
    /// outputs are consumed in ascending hash order until the amount is
    /// covered.
    pub fn create_and_sign_transaction(
        &self,
        validator: &dyn TxValidator,
        unspent: &dyn UnspentSource,
        head_time: u64,
        coins: u64,
        dest: &str,
    ) -> Result<Transaction, TxError> {
        if coins == 0 {
            return Err(TxError::ZeroCoins);
        }
        if self.encrypted {
            return Err(TxError::Sealed);
        }
        let first = self.first_address().ok_or(TxError::NoEntries)?.to_owned();
        let addrs = self.addresses();

        if validator
            .has_unconfirmed_spends(&addrs)
            .map_err(TxError::Validator)?
        {
            return Err(TxError::UnconfirmedSpend);
        }

        let mut spendable = unspent.unspents_of(&addrs);
        spendable.sort_by(|a, b| a.hash.cmp(&b.hash));
        let available: u64 = spendable.iter().map(|u| u.coins).sum();

        let mut selected = Vec::new();
        let mut total = 0_u64;
        for output in spendable {
            if total >= coins {
                break;
            }
            total += output.coins;
            selected.push(output);
        }
        if total < coins {
            return Err(TxError::InsufficientBalance {
                have: available,
                want: coins,
            });
        }

        let secrets: HashMap<&str, &str> = self
            .entries
            .iter()
            .map(|e| (e.address.as_str(), e.secret_key.as_str()))
            .collect();

        let mut outputs = vec![TransactionOutput {
            address: dest.to_owned(),
            coins,
        }];
        let change = total - coins;
        if change > 0 {
            outputs.push(TransactionOutput {
                address: first,
                coins: change,
            });
        }

        let mut tx = Transaction {
            timestamp: head_time,
            inputs: selected.iter().map(|u| u.hash.clone()).collect(),
            outputs,
            signatures: Vec::with_capacity(selected.len()),
        };

        let digest = tx.digest();
        for output in &selected {
            let secret_hex = secrets
                .get(output.address.as_str())
                .ok_or_else(|| TxError::UnknownAddress(output.address.clone()))?;
            let signing = keys::signing_key_from_hex(secret_hex)
                .map_err(|e| TxError::MalformedSecret(e.to_string()))?;
            let sig = signing.sign(&digest);
            tx.signatures.push(hex::encode(sig.to_bytes()));
        }

        Ok(tx)
    }
}
