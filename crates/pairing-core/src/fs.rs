//! Filesystem utilities for atomic, owner-only writes.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Permission bits for directories holding account material.
pub const PRIVATE_DIR_MODE: u32 = 0o700;

/// Permission bits for key and metadata files.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Atomically rename a file, with fallback for platforms where rename fails if target exists.
///
/// On some platforms (notably Windows), `fs::rename` fails if the destination already exists.
/// This function handles that case by removing the destination first and retrying.
///
/// If the rename ultimately fails, the temp file is cleaned up.
///
/// # Errors
///
/// Returns an error if the rename fails even after the fallback attempt.
pub fn rename_with_fallback(temp_path: &Path, destination: &Path) -> io::Result<()> {
    if let Err(initial_err) = fs::rename(temp_path, destination) {
        let _ = fs::remove_file(destination);
        fs::rename(temp_path, destination).map_err(|retry_err| {
            let _ = fs::remove_file(temp_path);
            io::Error::new(
                retry_err.kind(),
                format!(
                    "Atomic rename failed (initial: {}, retry: {})",
                    initial_err, retry_err
                ),
            )
        })?;
    }
    Ok(())
}

/// Create `path` and any missing parents, restricted to the owner on Unix.
pub fn create_private_dir_all(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(PRIVATE_DIR_MODE);
    }
    builder.create(path)
}

/// Write `data` to `path` through a sibling temp file and a rename.
///
/// Readers observe either the previous contents or the complete new
/// contents, never a partial write. The file is owner read/write only.
pub fn write_private_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let temp_path = write_private_temp(path, data)?;
    rename_with_fallback(&temp_path, path)
}

/// Like [`write_private_atomic`], but never replaces an existing file.
///
/// The complete temp file is hard-linked into place, so of several
/// concurrent writers exactly one wins and the rest get
/// `io::ErrorKind::AlreadyExists`.
pub fn write_private_new(path: &Path, data: &[u8]) -> io::Result<()> {
    let temp_path = write_private_temp(path, data)?;
    let linked = fs::hard_link(&temp_path, path);
    let _ = fs::remove_file(&temp_path);
    linked
}

/// Write and fsync a uniquely named owner-only sibling of `path`.
fn write_private_temp(path: &Path, data: &[u8]) -> io::Result<PathBuf> {
    static NEXT_TEMP_ID: AtomicU64 = AtomicU64::new(0);

    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid file name"))?;

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        .as_nanos();
    let temp_path = parent.join(format!(
        ".{}.{}.{}.{}.tmp",
        filename,
        std::process::id(),
        NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed),
        nanos
    ));

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(PRIVATE_FILE_MODE);
    }

    let written = options.open(&temp_path).and_then(|mut file| {
        file.write_all(data)?;
        file.sync_all()
    });
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    Ok(temp_path)
}
