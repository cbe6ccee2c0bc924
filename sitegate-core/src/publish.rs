//! Atomic Publisher
//!
//! Either every approved entry lands in the artifact tree or the snapshot is put
//! back. Callers never observe a partially published plan.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::backup::{BackupManager, Snapshot};
use crate::error::PipelineError;
use crate::hashing::sha256_hex;
use crate::validation::ValidatedPlan;

/// Byte-level access to the artifact tree.
pub trait Storage {
    /// Current bytes at `path`, or `None` if nothing is there.
    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;
    /// Replace `path`, creating parent directories as needed.
    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
    /// Remove `path`. Removing a missing file is not an error.
    fn remove(&self, path: &Path) -> io::Result<()>;
    /// Every file under `root` as a sorted `/`-separated relative path.
    fn list(&self, root: &Path) -> io::Result<Vec<String>>;
    fn is_dir(&self, path: &Path) -> bool;
    /// Remove an empty directory. Removing a missing directory is not an error.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;
}

/// Local filesystem storage. Writes go to a uniquely named temp file in the target
/// directory and are renamed into place.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStorage;

impl Storage for FsStorage {
    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let parent = path.parent().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path has no parent: {}", path.display()),
            )
        })?;
        fs::create_dir_all(parent)?;

        // Dropped (and deleted) on every early return.
        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn list(&self, root: &Path) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        if !root.is_dir() {
            return Ok(out);
        }
        for entry in WalkDir::new(root).min_depth(1) {
            let entry = entry.map_err(|e| {
                io::Error::new(io::ErrorKind::Other, format!("Failed to walk directory: {}", e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(root) {
                let parts: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect();
                out.push(parts.join("/"));
            }
        }
        out.sort();
        Ok(out)
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        match fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

pub struct AtomicPublisher {
    site_dir: PathBuf,
}

impl AtomicPublisher {
    pub fn new(site_dir: impl Into<PathBuf>) -> Self {
        Self {
            site_dir: site_dir.into(),
        }
    }

    pub fn site_dir(&self) -> &Path {
        &self.site_dir
    }

    /// Write every entry of `plan`. On any failure the snapshot is restored.
    ///
    /// Returns the written paths in plan order.
    pub fn publish(
        &self,
        storage: &dyn Storage,
        backups: &BackupManager,
        plan: &ValidatedPlan,
        snapshot: &Snapshot,
    ) -> Result<Vec<String>, PipelineError> {
        let err = match self.write_all(storage, plan, snapshot) {
            Ok(written) => return Ok(written),
            Err(err) => err,
        };

        warn!(error = %err, snapshot = %snapshot.id, "publish failed, restoring snapshot");
        match backups.restore(storage, snapshot) {
            Ok(report) => {
                info!(
                    restored = report.restored,
                    removed = report.removed,
                    "artifact tree restored"
                );
                Err(err)
            }
            Err(PipelineError::BackupRestore { failures, .. }) => {
                error!(failures = failures.len(), "restore failed, manual intervention required");
                Err(PipelineError::BackupRestore {
                    cause: err.to_string(),
                    failures,
                })
            }
            Err(other) => Err(other),
        }
    }

    fn write_all(
        &self,
        storage: &dyn Storage,
        plan: &ValidatedPlan,
        snapshot: &Snapshot,
    ) -> Result<Vec<String>, PipelineError> {
        let mut written = Vec::with_capacity(plan.entries().len());

        for entry in plan.entries() {
            let target = self.site_dir.join(entry.path());
            self.check_unchanged(storage, &target, entry.path(), snapshot)?;

            storage
                .write(&target, entry.bytes())
                .map_err(|e| PipelineError::Write {
                    path: entry.path().to_string(),
                    reason: e.to_string(),
                })?;
            debug!(path = entry.path(), bytes = entry.bytes().len(), "wrote entry");
            written.push(entry.path().to_string());
        }

        Ok(written)
    }

    /// The target must still be in the state the snapshot recorded.
    fn check_unchanged(
        &self,
        storage: &dyn Storage,
        target: &Path,
        rel: &str,
        snapshot: &Snapshot,
    ) -> Result<(), PipelineError> {
        let recorded = snapshot.get(rel).ok_or_else(|| PipelineError::Write {
            path: rel.to_string(),
            reason: "path is not covered by the snapshot".to_string(),
        })?;

        let current = storage.read(target).map_err(|e| PipelineError::Write {
            path: rel.to_string(),
            reason: e.to_string(),
        })?;

        let current_digest = current.as_deref().map(sha256_hex);
        if current_digest != recorded.digest() {
            return Err(PipelineError::Write {
                path: rel.to_string(),
                reason: "concurrent modification detected since snapshot".to_string(),
            });
        }
        Ok(())
    }
}
