use crate::{fsutil, wallet::Wallet};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{op} {path:?}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialize wallet {id}: {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("refusing to use symlink: {0:?}")]
    SymlinkRefused(PathBuf),

    #[error("expected directory at {0:?}")]
    NotADirectory(PathBuf),

    #[error("missing parent for {0:?}")]
    MissingParent(PathBuf),

    #[error("invalid wallet id {0:?}")]
    InvalidId(String),

    #[error("wallet directory already locked: {0:?}")]
    DirectoryLocked(PathBuf),
}

/// Persistence gateway for the registry. `save` must be atomic per wallet:
/// it either fully succeeds or leaves the previous file intact.
pub trait WalletStorage: Send + Sync {
    /// Load every wallet file in `dir`, keyed by filename. Key order is the
    /// stable load order the deduplication pass depends on.
    fn load_all(&self, dir: &Path) -> Result<BTreeMap<String, Wallet>, StorageError>;

    fn save(&self, dir: &Path, wallet: &Wallet) -> Result<(), StorageError>;

    /// Delete the legacy plaintext `<id>.bak` backup, if one exists. A
    /// missing backup is not an error; a failed deletion of an existing
    /// file is.
    fn remove_legacy_backup(&self, dir: &Path, id: &str) -> Result<(), StorageError>;
}

/// Default gateway: one pretty-printed JSON file per wallet, written
/// atomically with restrictive permissions.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDirStorage;

pub const WALLET_FILE_EXT: &str = "json";
const BACKUP_FILE_EXT: &str = "bak";

fn valid_id(id: &str) -> Result<(), StorageError> {
    if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
        return Err(StorageError::InvalidId(id.to_owned()));
    }
    Ok(())
}

impl WalletStorage for JsonDirStorage {
    fn load_all(&self, dir: &Path) -> Result<BTreeMap<String, Wallet>, StorageError> {
        let mut wallets = BTreeMap::new();
        let rd = fs::read_dir(dir).map_err(|e| StorageError::Io {
            op: "read dir",
            path: dir.to_path_buf(),
            source: e,
        })?;
        for item in rd {
            let item = item.map_err(|e| StorageError::Io {
                op: "read dir",
                path: dir.to_path_buf(),
                source: e,
            })?;
            let path = item.path();
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            // Skip temp files, lock files and `.bak` backups.
            if name.starts_with('.')
                || path.extension().and_then(|s| s.to_str()) != Some(WALLET_FILE_EXT)
            {
                continue;
            }
            let s = fs::read_to_string(&path).map_err(|e| StorageError::Io {
                op: "read",
                path: path.clone(),
                source: e,
            })?;
            let mut wallet: Wallet = serde_json::from_str(&s).map_err(|e| StorageError::Parse {
                path: path.clone(),
                source: e,
            })?;
            // The filename is authoritative: a manually copied file keeps
            // its own identity and is resolved by the deduplication pass.
            wallet.id = name.to_owned();
            wallets.insert(name.to_owned(), wallet);
        }
        Ok(wallets)
    }

    fn save(&self, dir: &Path, wallet: &Wallet) -> Result<(), StorageError> {
        valid_id(&wallet.id)?;
        let s = serde_json::to_string_pretty(wallet).map_err(|e| StorageError::Serialize {
            id: wallet.id.clone(),
            source: e,
        })?;
        fsutil::write_atomic_restrictive(
            &dir.join(&wallet.id),
            s.as_bytes(),
            fsutil::MODE_FILE_PRIVATE,
        )
    }

    fn remove_legacy_backup(&self, dir: &Path, id: &str) -> Result<(), StorageError> {
        valid_id(id)?;
        let path = dir.join(format!("{id}.{BACKUP_FILE_EXT}"));
        match fs::symlink_metadata(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io {
                op: "stat",
                path,
                source: e,
            }),
            Ok(md) if md.is_dir() => Ok(()),
            Ok(_) => fs::remove_file(&path).map_err(|e| StorageError::Io {
                op: "remove",
                path,
                source: e,
            }),
        }
    }
}
