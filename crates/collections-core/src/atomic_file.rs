//! Write-to-sibling-tmp, fsync, atomic-rename — the on-disk write
//! discipline used by every durable component (events log, state store,
//! ledger, mailbox). Grounded in `keeper-rs::state::KeeperState::save`,
//! with an fsync added before rename since these files carry financial
//! records rather than a keeper's easily-rebuildable cache.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

/// Atomically replaces the contents of `path` with `bytes`. On Unix,
/// `rename` silently replaces an existing destination; on Windows it does
/// not, so the destination is removed first.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = sibling_tmp(path);

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    drop(f);

    if let Err(err) = fs::rename(&tmp_path, path) {
        if cfg!(windows) {
            let _ = fs::remove_file(path);
            fs::rename(&tmp_path, path)?;
        } else {
            return Err(err);
        }
    }
    Ok(())
}

/// Same as [`write_atomic`] but sets Unix file mode `0600` before the
/// rename, for files holding tokens or financial records (spec §6).
#[cfg(unix)]
pub fn write_atomic_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = sibling_tmp(path);

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    f.set_permissions(fs::Permissions::from_mode(0o600))?;
    drop(f);

    if let Err(err) = fs::rename(&tmp_path, path) {
        if cfg!(windows) {
            let _ = fs::remove_file(path);
            fs::rename(&tmp_path, path)?;
        } else {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn write_atomic_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    write_atomic(path, bytes)
}

fn sibling_tmp(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_atomic_creates_and_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/dir/file.json");
        write_atomic(&path, b"first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn tmp_file_is_cleaned_up_after_rename() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("file.json");
        write_atomic(&path, b"data").unwrap();
        assert!(!sibling_tmp(&path).exists());
    }
}
