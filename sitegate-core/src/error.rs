//! Failure Taxonomy
//!
//! Validation errors are raised before any mutation and need no rollback.
//! Write errors trigger a restore. A failed restore is the only fatal outcome.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One path that could not be put back during a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreFailure {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Plan format error: {0}")]
    PlanFormat(String),

    #[error("Empty content for {path} (entry {index})")]
    EmptyContent { index: usize, path: String },

    #[error("File {path} exceeds per-file size limit ({size} > {limit} bytes)")]
    FileTooLarge {
        index: usize,
        path: String,
        size: usize,
        limit: usize,
    },

    #[error("Total size of plan exceeds limit at {path} ({total} > {limit} bytes)")]
    TotalTooLarge {
        index: usize,
        path: String,
        total: usize,
        limit: usize,
    },

    #[error("Unsafe path: {path} (entry {index})")]
    UnsafePath { index: usize, path: String },

    #[error("Forbidden content in {path}: {reason}")]
    ForbiddenContent {
        index: usize,
        path: String,
        reason: String,
    },

    #[error("Protected footer not found in {path}")]
    FooterMissing { index: usize, path: String },

    #[error("Region marker {marker:?} missing in {path}")]
    RegionMissing {
        index: usize,
        path: String,
        marker: String,
    },

    #[error("Region malformed in {path}: {reason}")]
    RegionMalformed {
        index: usize,
        path: String,
        reason: String,
    },

    #[error("Write failed for {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("Backup restore failed after {cause}: {}", describe_failures(.failures))]
    BackupRestore {
        cause: String,
        failures: Vec<RestoreFailure>,
    },

    #[error("Configuration requires engine >= {0}, current is {1}")]
    EngineVersionMismatch(String, String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn describe_failures(failures: &[RestoreFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.path, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl PipelineError {
    /// Stable snake_case name, recorded in the audit log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PlanFormat(_) => "plan_format",
            Self::EmptyContent { .. } => "empty_content",
            Self::FileTooLarge { .. } => "file_too_large",
            Self::TotalTooLarge { .. } => "total_too_large",
            Self::UnsafePath { .. } => "unsafe_path",
            Self::ForbiddenContent { .. } => "forbidden_content",
            Self::FooterMissing { .. } => "footer_missing",
            Self::RegionMissing { .. } => "region_missing",
            Self::RegionMalformed { .. } => "region_malformed",
            Self::Write { .. } => "write",
            Self::BackupRestore { .. } => "backup_restore",
            Self::EngineVersionMismatch(..) => "engine_version_mismatch",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Only a failed restore leaves the artifact tree indeterminate.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BackupRestore { .. })
    }

    /// True for rejections raised before any mutation.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::PlanFormat(_)
                | Self::EmptyContent { .. }
                | Self::FileTooLarge { .. }
                | Self::TotalTooLarge { .. }
                | Self::UnsafePath { .. }
                | Self::ForbiddenContent { .. }
                | Self::FooterMissing { .. }
                | Self::RegionMissing { .. }
                | Self::RegionMalformed { .. }
        )
    }

    /// Plan index of the entry that caused a validation failure.
    pub fn offending_entry(&self) -> Option<usize> {
        match self {
            Self::EmptyContent { index, .. }
            | Self::FileTooLarge { index, .. }
            | Self::TotalTooLarge { index, .. }
            | Self::UnsafePath { index, .. }
            | Self::ForbiddenContent { index, .. }
            | Self::FooterMissing { index, .. }
            | Self::RegionMissing { index, .. }
            | Self::RegionMalformed { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Recommended process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        if self.is_fatal() {
            3
        } else if self.is_rejection() || matches!(self, Self::Write { .. }) {
            2
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_failure_is_fatal() {
        let err = PipelineError::BackupRestore {
            cause: "write failed".to_string(),
            failures: vec![RestoreFailure {
                path: "index.html".to_string(),
                reason: "disk full".to_string(),
            }],
        };
        assert!(err.is_fatal());
        assert!(!err.is_rejection());
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("index.html (disk full)"));
    }

    #[test]
    fn test_rejection_reports_offending_entry() {
        let err = PipelineError::UnsafePath {
            index: 2,
            path: "../secrets.txt".to_string(),
        };
        assert!(err.is_rejection());
        assert_eq!(err.offending_entry(), Some(2));
        assert_eq!(err.kind(), "unsafe_path");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_write_error_is_not_fatal() {
        let err = PipelineError::Write {
            path: "a.html".to_string(),
            reason: "denied".to_string(),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.offending_entry(), None);
        assert_eq!(err.exit_code(), 2);
    }
}
