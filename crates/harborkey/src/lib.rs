//! Disk-backed registry and lifecycle manager for deterministic
//! cryptocurrency wallets.
//!
//! The [`WalletRegistry`] owns a wallet directory: it enforces one wallet
//! per seed (keyed by the first derived address), runs the all-or-nothing
//! encryption workflow, discovers a restored wallet's address frontier by
//! probing chain balances, and keeps in-memory state and persisted files
//! crash-consistent, rolling back on partial failure. Chain-specific
//! concerns (balance lookup, unspent outputs, spend validation) are
//! injected capabilities.

pub mod balance;
pub mod crypto;
pub mod errors;
mod fsutil;
pub mod keys;
pub mod registry;
pub mod storage;
pub mod transaction;
pub mod wallet;

pub use balance::{BalanceGetter, BalancePair};
pub use errors::{BoxError, RegistryError};
pub use registry::{RegistryOptions, WalletRegistry, DEFAULT_WALLET_LABEL};
pub use storage::{JsonDirStorage, StorageError, WalletStorage};
pub use transaction::{
    Transaction, TransactionOutput, TxError, TxValidator, UnspentOutput, UnspentSource,
};
pub use wallet::{Entry, SeedField, Wallet, WalletOptions, LEGACY_BACKUP_VERSION, WALLET_VERSION};
