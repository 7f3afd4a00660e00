//! Crash-safe file replacement shared by the table store and the passphrase vault.
//!
//! Content goes to a temp file in the destination directory, is fsynced, then
//! renamed over the destination. Readers observe either the old or the new
//! bytes, never a mix.

use crate::error::{KeywardError, KeywardResult};
use log::warn;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A fully written temp file waiting to be renamed into place.
pub(crate) struct StagedWrite {
    temp: NamedTempFile,
    dest: PathBuf,
}

impl StagedWrite {
    pub(crate) fn dest(&self) -> &Path {
        &self.dest
    }

    /// Rename the staged file over its destination and sync the directory.
    pub(crate) fn commit(self) -> KeywardResult<()> {
        let parent = parent_dir(&self.dest).to_path_buf();
        self.temp
            .persist(&self.dest)
            .map_err(|err| KeywardError::Io(err.error))?;
        if let Err(err) = sync_parent_dir(&parent) {
            // The rename is done; only its durability across a crash is in doubt.
            warn!("could not sync {} after replacing {}: {err}", parent.display(), self.dest.display());
        }
        Ok(())
    }
}

/// Write `contents` to a temp file next to `path` without touching `path` yet.
///
/// When `mode` is `None` the current file's permission bits are kept (or 0644
/// for a new file). Ownership of an existing destination is preserved.
pub(crate) fn stage(path: &Path, contents: &[u8], mode: Option<u32>) -> KeywardResult<StagedWrite> {
    let dest = resolve_write_path(path)?;
    let parent = parent_dir(&dest);
    fs::create_dir_all(parent)?;

    let existing = fs::metadata(&dest).ok();
    let mode = mode
        .or_else(|| existing.as_ref().map(|meta| meta.permissions().mode() & 0o7777))
        .unwrap_or(0o644);

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(contents)?;
    temp.as_file_mut().flush()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(mode))?;

    if let Some(meta) = existing {
        // SAFETY: the descriptor belongs to `temp`, which outlives the call.
        let rc = unsafe { libc::fchown(temp.as_file().as_raw_fd(), meta.uid(), meta.gid()) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // Only root may hand files to other owners; unprivileged test runs
            // already own the destination.
            if err.raw_os_error() != Some(libc::EPERM) {
                return Err(KeywardError::Io(err));
            }
        }
    }

    temp.as_file().sync_all()?;
    Ok(StagedWrite { temp, dest })
}

/// Atomically replace `path` with `contents`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8], mode: Option<u32>) -> KeywardResult<()> {
    stage(path, contents, mode)?.commit()
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn resolve_write_path(path: &Path) -> KeywardResult<PathBuf> {
    let mut candidate = path.to_path_buf();
    for _ in 0..16 {
        let meta = match fs::symlink_metadata(&candidate) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(candidate),
            Err(err) => return Err(KeywardError::Io(err)),
        };

        if !meta.file_type().is_symlink() {
            return Ok(candidate);
        }

        let target = fs::read_link(&candidate)?;
        candidate = if target.is_absolute() {
            target
        } else {
            parent_dir(&candidate).join(target)
        };
    }

    Err(KeywardError::Provider(format!(
        "symlink resolution depth exceeded for {}",
        path.display()
    )))
}

fn sync_parent_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).and_then(|file| file.sync_all())
}
