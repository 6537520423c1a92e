use crate::{crypto::CryptoError, keys::KeyError, storage::StorageError, transaction::TxError};
use thiserror::Error;

/// Boxed error type collaborator capabilities return; the registry wraps it
/// into the matching [`RegistryError`] variant so the source chain survives.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error taxonomy of the wallet registry.
///
/// Every failing operation leaves the registry's visible state (in-memory
/// collection, first-address index, and disk) exactly as it was before the
/// call; callers never have partial mutations to clean up.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("wallet {0} doesn't exist")]
    NotFound(String),

    #[error("duplicate wallet with {0}")]
    Duplicate(String),

    #[error("wallet api disabled")]
    ApiDisabled,

    #[error("persistence failed: {0}")]
    Persistence(#[from] StorageError),

    #[error("encryption failed: {0}")]
    Encryption(#[from] CryptoError),

    #[error("generation failed: {0}")]
    Generation(#[from] KeyError),

    #[error("balance lookup failed: {0}")]
    Balance(#[source] BoxError),

    #[error(transparent)]
    Transaction(#[from] TxError),

    /// A writer panicked while holding the registry lock.
    #[error("registry lock poisoned")]
    LockPoisoned,
}
