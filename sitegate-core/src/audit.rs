//! Audit Log - Append-Only Run History
//!
//! One JSON object per line. The pipeline only ever appends; truncation is an
//! operator concern. The tail of the log is handed to the generator as context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    pub summary: String,
    #[serde(default)]
    pub files_written: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    /// Set only when a restore failed and the tree may be indeterminate.
    #[serde(default)]
    pub requires_intervention: bool,
}

impl AuditEntry {
    pub fn success(run_id: Uuid, summary: impl Into<String>, files_written: Vec<String>) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            outcome: Outcome::Success,
            summary: summary.into(),
            files_written,
            error_kind: None,
            error_detail: None,
            plan_hash: None,
            snapshot_id: None,
            requires_intervention: false,
        }
    }

    pub fn failure(run_id: Uuid, err: &PipelineError) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            outcome: Outcome::Failure,
            summary: format!("Run failed: {}", err),
            files_written: Vec::new(),
            error_kind: Some(err.kind().to_string()),
            error_detail: Some(err.to_string()),
            plan_hash: None,
            snapshot_id: None,
            requires_intervention: err.is_fatal(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &AuditEntry) -> Result<(), PipelineError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Every readable entry, oldest first. Unparseable lines are skipped.
    pub fn entries(&self) -> Result<Vec<AuditEntry>, PipelineError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) => out.push(entry),
                Err(e) => warn!(line = lineno + 1, error = %e, "skipping malformed audit line"),
            }
        }
        Ok(out)
    }

    /// The last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Result<Vec<AuditEntry>, PipelineError> {
        let mut all = self.entries()?;
        let skip = all.len().saturating_sub(n);
        Ok(all.split_off(skip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_recent() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("logs/audit.jsonl"));
        assert!(log.recent(5).unwrap().is_empty());

        for i in 0..4 {
            log.append(&AuditEntry::success(Uuid::new_v4(), format!("run {i}"), vec![]))
                .unwrap();
        }

        let recent = log.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].summary, "run 2");
        assert_eq!(recent[1].summary, "run 3");
        assert_eq!(log.recent(10).unwrap().len(), 4);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        log.append(&AuditEntry::success(Uuid::new_v4(), "ok", vec!["a.html".into()]))
            .unwrap();
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(b"{truncated\n").unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].files_written, vec!["a.html"]);
    }

    #[test]
    fn test_failure_entry_carries_kind() {
        let err = PipelineError::FooterMissing { index: 0, path: "a.html".into() };
        let entry = AuditEntry::failure(Uuid::new_v4(), &err);
        assert_eq!(entry.outcome, Outcome::Failure);
        assert_eq!(entry.error_kind.as_deref(), Some("footer_missing"));
        assert!(!entry.requires_intervention);
        assert!(entry.files_written.is_empty());
    }
}
