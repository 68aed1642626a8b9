//! Blob directory: naming, temp files, atomic commit, idempotent removal

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use sfbox_core::{SfboxError, SfboxResult};
use sfbox_crypto::{random_storage_name, random_token};

/// The directory holding ciphertext blobs.
#[derive(Debug, Clone)]
pub struct BlobDir {
    root: PathBuf,
}

impl BlobDir {
    /// Open the blob directory, creating it if absent.
    pub fn open(root: impl Into<PathBuf>) -> SfboxResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A fresh, unused-looking path for a new blob.
    pub fn new_blob_path(&self, prefix: &str) -> PathBuf {
        self.root.join(random_storage_name(prefix))
    }

    /// Turn a stored path back into a filesystem path. Relative paths are
    /// taken relative to the blob directory.
    pub fn resolve(&self, stored: &str) -> PathBuf {
        let path = Path::new(stored);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Sibling temp path in the same directory, so the later rename stays on
    /// one filesystem.
    pub fn temp_path_beside(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".tmp.{}", random_token(6)));
        path.with_file_name(name)
    }

    /// Atomically move `tmp` over `dst`. On failure `tmp` is removed and
    /// `dst` is left as it was.
    ///
    /// The parent directory is synced afterwards. A failed directory sync is
    /// logged, not returned.
    pub fn commit(tmp: &Path, dst: &Path) -> SfboxResult<()> {
        if let Err(e) = fs::rename(tmp, dst) {
            let _ = fs::remove_file(tmp);
            return Err(SfboxError::Io(io::Error::new(
                e.kind(),
                format!("atomic rename onto {} failed: {e}", dst.display()),
            )));
        }
        if let Err(e) = sync_parent_dir(dst) {
            warn!(path = %dst.display(), "failed to sync blob directory: {e}");
        }
        debug!(path = %dst.display(), "blob committed");
        Ok(())
    }

    /// Remove a blob. An already-absent blob is success; returns whether a
    /// file was actually removed.
    pub fn remove(path: &Path) -> SfboxResult<bool> {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "blob removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SfboxError::Io(e)),
        }
    }
}

/// fsync the directory containing `path`, making a rename into it durable.
#[cfg(unix)]
pub(crate) fn sync_parent_dir(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::File::open(parent)?.sync_all()
}

// Directory handles cannot be synced this way off unix
#[cfg(not(unix))]
pub(crate) fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Paths are persisted as text.
pub(crate) fn path_to_string(path: &Path) -> SfboxResult<String> {
    path.to_str()
        .map(str::to_owned)
        .ok_or_else(|| {
            SfboxError::InvalidInput(format!("blob path is not UTF-8: {}", path.display()))
        })
}
