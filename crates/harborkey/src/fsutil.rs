use crate::storage::StorageError;
use rand::Rng as _;
use std::{
    fs::{self, OpenOptions},
    io::Write as _,
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _};

pub const MODE_DIR_PRIVATE: u32 = 0o700;
pub const MODE_FILE_PRIVATE: u32 = 0o600;

fn io_err(op: &'static str, path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

fn is_symlink(p: &Path) -> Result<bool, StorageError> {
    let md = fs::symlink_metadata(p).map_err(|e| io_err("stat", p, e))?;
    Ok(md.file_type().is_symlink())
}

pub fn ensure_private_dir(dir: &Path) -> Result<(), StorageError> {
    if dir.exists() {
        if is_symlink(dir)? {
            return Err(StorageError::SymlinkRefused(dir.to_path_buf()));
        }
        let md = fs::metadata(dir).map_err(|e| io_err("stat", dir, e))?;
        if !md.is_dir() {
            return Err(StorageError::NotADirectory(dir.to_path_buf()));
        }
    } else {
        fs::create_dir_all(dir).map_err(|e| io_err("create dir", dir, e))?;
    }

    // Best-effort: enforce private perms on Unix.
    #[cfg(unix)]
    {
        let md = fs::metadata(dir).map_err(|e| io_err("stat", dir, e))?;
        let mode = md.permissions().mode();
        // If group/other have any bits set, clamp to 0700.
        if (mode & 0o077) != 0 {
            fs::set_permissions(dir, fs::Permissions::from_mode(MODE_DIR_PRIVATE))
                .map_err(|e| io_err("chmod", dir, e))?;
        }
    }

    Ok(())
}

fn tmp_path_for(parent: &Path, final_name: &Path) -> PathBuf {
    let base = final_name
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let mut rand_bytes = [0_u8; 8];
    rand::rng().fill_bytes(&mut rand_bytes);
    let suffix = hex::encode(rand_bytes);
    parent.join(format!(".{base}.tmp.{suffix}"))
}

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, then rename over the destination. The previous file survives any
/// failure before the rename.
pub fn write_atomic_restrictive(path: &Path, bytes: &[u8], mode: u32) -> Result<(), StorageError> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::MissingParent(path.to_path_buf()))?;
    ensure_private_dir(parent)?;

    if path.exists() && is_symlink(path)? {
        return Err(StorageError::SymlinkRefused(path.to_path_buf()));
    }

    let tmp = tmp_path_for(parent, path);

    // Always create new temp files.
    let mut f = {
        #[cfg(unix)]
        {
            OpenOptions::new()
                .create_new(true)
                .write(true)
                .mode(mode)
                .open(&tmp)
                .map_err(|e| io_err("open temp", &tmp, e))?
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
            OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&tmp)
                .map_err(|e| io_err("open temp", &tmp, e))?
        }
    };

    f.write_all(bytes).map_err(|e| io_err("write", &tmp, e))?;
    f.flush().map_err(|e| io_err("flush", &tmp, e))?;
    f.sync_all().map_err(|e| io_err("fsync", &tmp, e))?;
    drop(f);

    // `rename` is atomic on Unix. On Windows, this can fail if the destination exists.
    #[cfg(windows)]
    {
        if path.exists() {
            fs::remove_file(path).map_err(|e| io_err("remove existing", path, e))?;
        }
    }

    fs::rename(&tmp, path).map_err(|e| io_err("rename", path, e))?;

    Ok(())
}
