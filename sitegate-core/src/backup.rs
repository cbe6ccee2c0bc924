//! Backup Manager - Snapshot and Restore
//!
//! A snapshot records the prior state of every path a run will touch and is
//! persisted under the backup store before the first write:
//!
//! ```text
//! backups/<timestamp>-<run>/manifest.json
//! backups/<timestamp>-<run>/files/<relative path>
//! ```
//!
//! Restore is one transition: `Snapshot -> restore() -> confirmed | BackupRestore`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, RestoreFailure};
use crate::hashing::sha256_hex;
use crate::publish::Storage;
use crate::validation::normalize_path;
use crate::ENGINE_VERSION;

const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorState {
    Present(Vec<u8>),
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: String,
    pub prior: PriorState,
}

impl SnapshotFile {
    /// sha256 of the prior bytes, `None` when the file was absent.
    pub fn digest(&self) -> Option<String> {
        match &self.prior {
            PriorState::Present(bytes) => Some(sha256_hex(bytes)),
            PriorState::Absent => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub dir: PathBuf,
    files: Vec<SnapshotFile>,
    /// Parent directories that did not exist yet; a restore removes them again.
    absent_dirs: Vec<String>,
}

impl Snapshot {
    pub fn files(&self) -> &[SnapshotFile] {
        &self.files
    }

    pub fn get(&self, path: &str) -> Option<&SnapshotFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn absent_dirs(&self) -> &[String] {
        &self.absent_dirs
    }

    fn manifest(&self, failed: bool) -> SnapshotManifest {
        SnapshotManifest {
            id: self.id.clone(),
            run_id: self.run_id,
            created_at: self.created_at,
            engine_version: ENGINE_VERSION.to_string(),
            failed,
            files: self
                .files
                .iter()
                .map(|f| ManifestFile {
                    path: f.path.clone(),
                    state: match f.prior {
                        PriorState::Present(_) => FileState::Present,
                        PriorState::Absent => FileState::Absent,
                    },
                    sha256: f.digest(),
                })
                .collect(),
            absent_dirs: self.absent_dirs.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FileState {
    Present,
    Absent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestFile {
    path: String,
    state: FileState,
    #[serde(default)]
    sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotManifest {
    id: String,
    run_id: Uuid,
    created_at: DateTime<Utc>,
    engine_version: String,
    /// Failed-run snapshots are kept for manual recovery and never pruned.
    #[serde(default)]
    failed: bool,
    files: Vec<ManifestFile>,
    #[serde(default)]
    absent_dirs: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: usize,
    pub removed: usize,
    pub dirs_removed: usize,
}

pub struct BackupManager {
    site_dir: PathBuf,
    backup_dir: PathBuf,
}

impl BackupManager {
    pub fn new(site_dir: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            site_dir: site_dir.into(),
            backup_dir: backup_dir.into(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Record and persist the current state of `paths`.
    pub fn snapshot(
        &self,
        storage: &dyn Storage,
        paths: &[String],
        run_id: Uuid,
    ) -> Result<Snapshot, PipelineError> {
        let created_at = Utc::now();
        let id = format!(
            "{}-{}",
            created_at.format("%Y%m%dT%H%M%S%.3fZ"),
            &run_id.simple().to_string()[..8]
        );
        let dir = self.backup_dir.join(&id);
        let files_dir = dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir)?;

        let mut files = Vec::with_capacity(paths.len());
        let mut absent_dirs: Vec<String> = Vec::new();
        for path in paths {
            for dir in ancestors(path) {
                if !absent_dirs.contains(&dir) && !storage.is_dir(&self.site_dir.join(&dir)) {
                    absent_dirs.push(dir);
                }
            }
            let prior = match storage.read(&self.site_dir.join(path))? {
                Some(bytes) => {
                    let copy = files_dir.join(path);
                    if let Some(parent) = copy.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&copy, &bytes)?;
                    PriorState::Present(bytes)
                }
                None => PriorState::Absent,
            };
            files.push(SnapshotFile {
                path: path.clone(),
                prior,
            });
        }

        let snapshot = Snapshot {
            id,
            run_id,
            created_at,
            dir,
            files,
            absent_dirs,
        };
        self.write_manifest(&snapshot, false)?;
        debug!(snapshot = %snapshot.id, files = snapshot.files.len(), "snapshot taken");
        Ok(snapshot)
    }

    /// Put every recorded path back. Every path is attempted even after a failure.
    pub fn restore(
        &self,
        storage: &dyn Storage,
        snapshot: &Snapshot,
    ) -> Result<RestoreReport, PipelineError> {
        let mut report = RestoreReport::default();
        let mut failures = Vec::new();

        for file in &snapshot.files {
            let target = self.site_dir.join(&file.path);
            let result = match &file.prior {
                PriorState::Present(bytes) => storage.write(&target, bytes).map(|_| {
                    report.restored += 1;
                }),
                PriorState::Absent => storage.remove(&target).map(|_| {
                    report.removed += 1;
                }),
            };
            if let Err(e) = result {
                error!(path = %file.path, error = %e, "failed to restore file");
                failures.push(RestoreFailure {
                    path: file.path.clone(),
                    reason: e.to_string(),
                });
            }
        }

        // Deepest first, so a nested directory is gone before its parent.
        let mut dirs: Vec<&String> = snapshot.absent_dirs.iter().collect();
        dirs.sort_by_key(|d| std::cmp::Reverse(d.matches('/').count()));
        for dir in dirs {
            let target = self.site_dir.join(dir);
            match storage.list(&target) {
                Ok(left) if !left.is_empty() => {
                    warn!(dir = %dir, files = left.len(), "directory gained files since the snapshot, keeping it");
                }
                Ok(_) => match storage.remove_dir(&target) {
                    Ok(()) => report.dirs_removed += 1,
                    Err(e) => {
                        error!(dir = %dir, error = %e, "failed to remove directory");
                        failures.push(RestoreFailure {
                            path: dir.clone(),
                            reason: e.to_string(),
                        });
                    }
                },
                Err(e) => failures.push(RestoreFailure {
                    path: dir.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(PipelineError::BackupRestore {
                cause: format!("restore of snapshot {}", snapshot.id),
                failures,
            })
        }
    }

    /// Flag a snapshot as belonging to a failed run so retention keeps it.
    pub fn mark_failed(&self, snapshot: &Snapshot) -> Result<(), PipelineError> {
        self.write_manifest(snapshot, true)
    }

    pub fn discard(&self, snapshot: &Snapshot) -> Result<(), PipelineError> {
        fs::remove_dir_all(&snapshot.dir)?;
        Ok(())
    }

    /// Keep the newest `keep` successful snapshots and delete the rest.
    ///
    /// Returns the number of snapshots deleted.
    pub fn prune(&self, keep: usize) -> Result<usize, PipelineError> {
        let mut successful = Vec::new();
        for (dir, manifest) in self.manifests()? {
            if !manifest.failed {
                successful.push((manifest.created_at, dir));
            }
        }
        successful.sort_by(|a, b| b.0.cmp(&a.0));

        let mut removed = 0;
        for (_, dir) in successful.into_iter().skip(keep) {
            fs::remove_dir_all(&dir)?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, keep, "pruned old snapshots");
        }
        Ok(removed)
    }

    /// Reload a persisted snapshot, verifying every stored file against its digest.
    pub fn load(&self, dir: &Path) -> Result<Snapshot, PipelineError> {
        let manifest = read_manifest(dir)?;
        let mut files = Vec::with_capacity(manifest.files.len());

        for entry in manifest.files {
            let path = normalize_path(&entry.path).ok_or_else(|| {
                PipelineError::Config(format!(
                    "snapshot {} lists unsafe path {}",
                    manifest.id, entry.path
                ))
            })?;
            let prior = match entry.state {
                FileState::Absent => PriorState::Absent,
                FileState::Present => {
                    let bytes = fs::read(dir.join(FILES_DIR).join(&path))?;
                    if entry.sha256.as_deref() != Some(sha256_hex(&bytes).as_str()) {
                        return Err(PipelineError::Config(format!(
                            "snapshot {} copy of {} does not match its digest",
                            manifest.id, path
                        )));
                    }
                    PriorState::Present(bytes)
                }
            };
            files.push(SnapshotFile { path, prior });
        }

        let absent_dirs = manifest
            .absent_dirs
            .iter()
            .map(|d| {
                normalize_path(d).ok_or_else(|| {
                    PipelineError::Config(format!(
                        "snapshot {} lists unsafe directory {}",
                        manifest.id, d
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Snapshot {
            id: manifest.id,
            run_id: manifest.run_id,
            created_at: manifest.created_at,
            dir: dir.to_path_buf(),
            files,
            absent_dirs,
        })
    }

    fn write_manifest(&self, snapshot: &Snapshot, failed: bool) -> Result<(), PipelineError> {
        let mut buf = serde_json::to_string_pretty(&snapshot.manifest(failed))?;
        buf.push('\n');
        fs::write(snapshot.dir.join(MANIFEST_FILE), buf)?;
        Ok(())
    }

    fn manifests(&self) -> Result<Vec<(PathBuf, SnapshotManifest)>, PipelineError> {
        let mut out = Vec::new();
        if !self.backup_dir.is_dir() {
            return Ok(out);
        }
        for entry in fs::read_dir(&self.backup_dir)? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            match read_manifest(&dir) {
                Ok(manifest) => out.push((dir, manifest)),
                Err(e) => warn!(dir = %dir.display(), error = %e, "skipping unreadable snapshot"),
            }
        }
        Ok(out)
    }
}

/// Parent directories of a relative path, shallowest first: `a/b/c.txt` gives `a`, `a/b`.
fn ancestors(path: &str) -> Vec<String> {
    let segments: Vec<&str> = path.split('/').collect();
    (1..segments.len()).map(|n| segments[..n].join("/")).collect()
}

fn read_manifest(dir: &Path) -> Result<SnapshotManifest, PipelineError> {
    let content = fs::read_to_string(dir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_str(&content)?)
}
