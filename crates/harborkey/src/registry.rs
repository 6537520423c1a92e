use crate::{
    balance::BalanceGetter,
    errors::RegistryError,
    fsutil,
    keys::{self, KeyError},
    storage::{JsonDirStorage, StorageError, WalletStorage},
    transaction::{Transaction, TxValidator, UnspentSource},
    wallet::{Wallet, WalletOptions, LEGACY_BACKUP_VERSION},
};
use fs2::FileExt as _;
use secrecy::SecretString;
use std::{
    collections::{BTreeMap, HashMap},
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Label of the wallet created when an enabled registry starts empty.
pub const DEFAULT_WALLET_LABEL: &str = "Your Wallet";

const LOCK_FILE: &str = ".registry.lock";

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryOptions {
    /// When set, the wallet directory is never touched and every mutating
    /// or loading operation fails with [`RegistryError::ApiDisabled`].
    pub api_disabled: bool,
}

#[derive(Default)]
struct State {
    wallets: BTreeMap<String, Wallet>,
    /// First derived address -> wallet id; exactly one entry per distinct
    /// first address among live wallets.
    first_addr_index: HashMap<String, String>,
}

/// Concurrency-safe, disk-backed catalog of wallets. One instance owns its
/// wallet directory exclusively (an fs2 lock enforces this); every wallet
/// handed out is a deep copy taken under the registry lock.
pub struct WalletRegistry {
    state: RwLock<State>,
    storage: Box<dyn WalletStorage>,
    directory: PathBuf,
    api_disabled: bool,
    _dir_lock: Option<File>,
}

impl WalletRegistry {
    pub fn open(
        directory: impl Into<PathBuf>,
        options: RegistryOptions,
    ) -> Result<Self, RegistryError> {
        Self::open_with_storage(directory, options, Box::new(JsonDirStorage))
    }

    /// Open with an injected persistence gateway.
    pub fn open_with_storage(
        directory: impl Into<PathBuf>,
        options: RegistryOptions,
        storage: Box<dyn WalletStorage>,
    ) -> Result<Self, RegistryError> {
        let directory = directory.into();
        if options.api_disabled {
            return Ok(Self {
                state: RwLock::new(State::default()),
                storage,
                directory,
                api_disabled: true,
                _dir_lock: None,
            });
        }

        fsutil::ensure_private_dir(&directory)?;
        let dir_lock = acquire_dir_lock(&directory)?;

        let loaded = storage.load_all(&directory)?;
        let mut first_addr_index = HashMap::new();
        let wallets = dedup_wallets(loaded, &mut first_addr_index);
        info!(
            wallets = wallets.len(),
            directory = %directory.display(),
            "wallet registry opened"
        );

        let mut state = State {
            wallets,
            first_addr_index,
        };
        if state.wallets.is_empty() {
            let seed = keys::new_seed()?;
            let name = unique_wallet_filename(&state.wallets);
            let defaults = WalletOptions {
                label: DEFAULT_WALLET_LABEL.to_owned(),
                seed: Some(seed),
                password: None,
            };
            let w = insert_new_wallet(&mut state, storage.as_ref(), &directory, name, &defaults)?;
            info!(id = %w.id, "created default wallet");
        }

        Ok(Self {
            state: RwLock::new(state),
            storage,
            directory,
            api_disabled: false,
            _dir_lock: Some(dir_lock),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, RegistryError> {
        self.state.read().map_err(|_| RegistryError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, RegistryError> {
        self.state.write().map_err(|_| RegistryError::LockPoisoned)
    }

    fn ensure_enabled(&self) -> Result<(), RegistryError> {
        if self.api_disabled {
            return Err(RegistryError::ApiDisabled);
        }
        Ok(())
    }

    /// Create a wallet with one derived address. An empty `name` gets a
    /// generated filename-safe id. Fails with
    /// [`RegistryError::Duplicate`] when the new wallet's first address
    /// collides with an existing wallet's.
    pub fn create_wallet(
        &self,
        name: &str,
        options: &WalletOptions,
    ) -> Result<Wallet, RegistryError> {
        self.ensure_enabled()?;
        let mut state = self.write()?;
        let name = if name.is_empty() {
            unique_wallet_filename(&state.wallets)
        } else {
            if state.wallets.contains_key(name) {
                return Err(RegistryError::Duplicate(name.to_owned()));
            }
            name.to_owned()
        };
        let w = insert_new_wallet(
            &mut state,
            self.storage.as_ref(),
            &self.directory,
            name,
            options,
        )?;
        debug!(id = %w.id, "created wallet");
        Ok(w)
    }

    /// Run the scan-ahead protocol on a wallet, persist, and replace the
    /// stored wallet. The balance lookup happens while the registry lock is
    /// held; the getter must not re-enter the registry.
    pub fn scan_ahead_addresses(
        &self,
        id: &str,
        scan_n: u64,
        bg: &dyn BalanceGetter,
    ) -> Result<Wallet, RegistryError> {
        self.ensure_enabled()?;
        let mut state = self.write()?;
        let mut w = state
            .wallets
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        w.scan_addresses(scan_n, bg)?;
        self.storage.save(&self.directory, &w)?;
        debug!(id, entries = w.entries.len(), "scan-ahead complete");
        state.wallets.insert(id.to_owned(), w.clone());
        Ok(w)
    }

    /// Encryption workflow: all-or-nothing transition of a wallet to
    /// password-encrypted secret storage. The in-memory wallet is replaced
    /// only after the encrypted form is persisted (and, for legacy `"0.1"`
    /// wallets, the plaintext backup file is deleted).
    pub fn encrypt(&self, id: &str, password: &SecretString) -> Result<Wallet, RegistryError> {
        self.ensure_enabled()?;
        let mut state = self.write()?;
        let mut w = state
            .wallets
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        let old_version = w.version.clone();
        w.encrypt_in_place(password)?;
        self.storage.save(&self.directory, &w)?;
        if old_version == LEGACY_BACKUP_VERSION {
            self.storage.remove_legacy_backup(&self.directory, id)?;
        }
        state.wallets.insert(id.to_owned(), w.clone());
        debug!(id, "wallet encrypted");
        Ok(w)
    }

    /// Append `num` new addresses to a wallet; returns only the new ones.
    pub fn new_addresses(&self, id: &str, num: u64) -> Result<Vec<String>, RegistryError> {
        self.ensure_enabled()?;
        let mut state = self.write()?;
        let mut w = state
            .wallets
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        let addrs = w.generate_addresses(num)?;
        self.storage.save(&self.directory, &w)?;
        state.wallets.insert(id.to_owned(), w);
        debug!(id, count = addrs.len(), "generated addresses");
        Ok(addrs)
    }

    pub fn get_addresses(&self, id: &str) -> Result<Vec<String>, RegistryError> {
        let state = self.read()?;
        let w = state
            .wallets
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        Ok(w.addresses())
    }

    pub fn get_wallet(&self, id: &str) -> Result<Wallet, RegistryError> {
        let state = self.read()?;
        state
            .wallets
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))
    }

    pub fn get_wallets(&self) -> Result<BTreeMap<String, Wallet>, RegistryError> {
        let state = self.read()?;
        Ok(state.wallets.clone())
    }

    /// Re-load every wallet file, rebuild the first-address index from
    /// scratch, run the deduplication pass, and replace in-memory state
    /// wholesale.
    pub fn reload_wallets(&self) -> Result<(), RegistryError> {
        self.ensure_enabled()?;
        let mut state = self.write()?;
        let loaded = self.storage.load_all(&self.directory)?;
        let mut first_addr_index = HashMap::new();
        let wallets = dedup_wallets(loaded, &mut first_addr_index);
        info!(wallets = wallets.len(), "reloaded wallets");
        *state = State {
            wallets,
            first_addr_index,
        };
        Ok(())
    }

    pub fn update_label(&self, id: &str, label: &str) -> Result<(), RegistryError> {
        self.ensure_enabled()?;
        let mut state = self.write()?;
        let mut w = state
            .wallets
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        label.clone_into(&mut w.label);
        self.storage.save(&self.directory, &w)?;
        state.wallets.insert(id.to_owned(), w);
        Ok(())
    }

    /// Unconditionally drop the wallet from the registry, together with its
    /// first-address index entry so the same seed can be re-created later.
    /// The wallet file on disk is left alone.
    pub fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let mut state = self.write()?;
        if state.wallets.remove(id).is_some() {
            state
                .first_addr_index
                .retain(|_, wallet_id| wallet_id.as_str() != id);
            debug!(id, "removed wallet");
        }
        Ok(())
    }

    /// Read-only delegation to the wallet's transaction builder.
    pub fn create_and_sign_transaction(
        &self,
        id: &str,
        validator: &dyn TxValidator,
        unspent: &dyn UnspentSource,
        head_time: u64,
        coins: u64,
        dest: &str,
    ) -> Result<Transaction, RegistryError> {
        let state = self.read()?;
        let w = state
            .wallets
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        Ok(w.create_and_sign_transaction(validator, unspent, head_time, coins, dest)?)
    }
}

/// Build a wallet from `options`, derive its first address, check it against
/// the index, then insert + persist. A failed persist removes the wallet
/// again; the index is only updated once the wallet is durable.
fn insert_new_wallet(
    state: &mut State,
    storage: &dyn WalletStorage,
    dir: &Path,
    name: String,
    options: &WalletOptions,
) -> Result<Wallet, RegistryError> {
    let mut w = Wallet::new(name, options)?;
    w.generate_addresses(1)?;
    let first = w
        .first_address()
        .ok_or(KeyError::EmptySeed)?
        .to_owned();
    if let Some(existing) = state.first_addr_index.get(&first) {
        return Err(RegistryError::Duplicate(existing.clone()));
    }
    if let Some(password) = &options.password {
        w.encrypt_in_place(password)?;
    }
    let id = w.id.clone();
    state.wallets.insert(id.clone(), w.clone());
    if let Err(e) = storage.save(dir, &w) {
        state.wallets.remove(&id);
        return Err(e.into());
    }
    state.first_addr_index.insert(first, id);
    Ok(w)
}

/// Converge loaded wallets to one per seed. Wallets with no entries are
/// dropped; of two wallets sharing a first address the one with more entries
/// survives, ties keeping the first in the stable lexicographic load order.
fn dedup_wallets(
    wallets: BTreeMap<String, Wallet>,
    index: &mut HashMap<String, String>,
) -> BTreeMap<String, Wallet> {
    let mut doomed: Vec<String> = Vec::new();
    for (id, w) in &wallets {
        let Some(first) = w.first_address() else {
            warn!(%id, "dropping wallet with no entries");
            doomed.push(id.clone());
            continue;
        };
        if let Some(prev_id) = index.get(first).cloned() {
            let prev_len = wallets.get(&prev_id).map_or(0, |p| p.entries.len());
            if prev_len >= w.entries.len() {
                warn!(%id, keeper = %prev_id, "dropping duplicate wallet");
                doomed.push(id.clone());
            } else {
                warn!(id = %prev_id, keeper = %id, "dropping duplicate wallet");
                doomed.push(prev_id);
                index.insert(first.to_owned(), id.clone());
            }
        } else {
            index.insert(first.to_owned(), id.clone());
        }
    }
    let mut wallets = wallets;
    for id in doomed {
        wallets.remove(&id);
    }
    wallets
}

fn unique_wallet_filename(wallets: &BTreeMap<String, Wallet>) -> String {
    loop {
        let name = new_wallet_filename();
        if !wallets.contains_key(&name) {
            return name;
        }
    }
}

fn new_wallet_filename() -> String {
    let tag = Uuid::new_v4().simple().to_string();
    let tag = tag.get(..8).unwrap_or(&tag);
    format!(
        "wallet_{}_{tag}.json",
        chrono::Utc::now().format("%Y_%m_%d")
    )
}

/// One registry instance per directory: fail fast instead of blocking when
/// another process already holds the lock.
fn acquire_dir_lock(dir: &Path) -> Result<File, StorageError> {
    let path = dir.join(LOCK_FILE);
    let f = {
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .mode(fsutil::MODE_FILE_PRIVATE)
                .open(&path)
                .map_err(|e| StorageError::Io {
                    op: "open lock file",
                    path: path.clone(),
                    source: e,
                })?
        }
        #[cfg(not(unix))]
        {
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| StorageError::Io {
                    op: "open lock file",
                    path: path.clone(),
                    source: e,
                })?
        }
    };
    match f.try_lock_exclusive() {
        Ok(()) => Ok(f),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            Err(StorageError::DirectoryLocked(path))
        }
        Err(e) => Err(StorageError::Io {
            op: "lock",
            path,
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet_with_entries(id: &str, seed: &str, entries: u64) -> eyre::Result<Wallet> {
        let mut w = Wallet::new(
            id.to_owned(),
            &WalletOptions {
                label: id.to_owned(),
                seed: Some(seed.to_owned()),
                password: None,
            },
        )?;
        w.generate_addresses(entries)?;
        Ok(w)
    }

    #[test]
    fn dedup_keeps_the_wallet_with_more_entries() -> eyre::Result<()> {
        let mut wallets = BTreeMap::new();
        wallets.insert(
            "a.json".to_owned(),
            wallet_with_entries("a.json", "shared seed", 3)?,
        );
        wallets.insert(
            "b.json".to_owned(),
            wallet_with_entries("b.json", "shared seed", 5)?,
        );

        let mut index = HashMap::new();
        let survivors = dedup_wallets(wallets, &mut index);
        assert_eq!(survivors.len(), 1);
        assert!(survivors.contains_key("b.json"));
        assert_eq!(index.len(), 1);
        assert!(index.values().all(|id| id == "b.json"));
        Ok(())
    }

    #[test]
    fn dedup_tie_favors_first_in_load_order() -> eyre::Result<()> {
        let mut wallets = BTreeMap::new();
        wallets.insert(
            "a.json".to_owned(),
            wallet_with_entries("a.json", "tied seed", 2)?,
        );
        wallets.insert(
            "b.json".to_owned(),
            wallet_with_entries("b.json", "tied seed", 2)?,
        );

        let mut index = HashMap::new();
        let survivors = dedup_wallets(wallets, &mut index);
        assert_eq!(survivors.len(), 1);
        assert!(survivors.contains_key("a.json"));
        Ok(())
    }

    #[test]
    fn dedup_drops_wallets_with_no_entries() -> eyre::Result<()> {
        let mut wallets = BTreeMap::new();
        let empty = Wallet::new(
            "empty.json".to_owned(),
            &WalletOptions {
                label: "empty".to_owned(),
                seed: Some("unused seed".to_owned()),
                password: None,
            },
        )?;
        wallets.insert("empty.json".to_owned(), empty);
        wallets.insert(
            "full.json".to_owned(),
            wallet_with_entries("full.json", "full seed", 1)?,
        );

        let mut index = HashMap::new();
        let survivors = dedup_wallets(wallets, &mut index);
        assert_eq!(survivors.len(), 1);
        assert!(survivors.contains_key("full.json"));
        Ok(())
    }

    #[test]
    fn generated_filenames_are_filename_safe() {
        let name = new_wallet_filename();
        assert!(name.ends_with(".json"));
        assert!(!name.contains(['/', '\\']));
    }
}
