//! Publishing Pipeline - Single Entry Point
//!
//! CRITICAL: run_once MUST validate before it snapshots or writes. No bypass.
//!
//! validate -> snapshot -> publish -> audit. A rejected plan is never snapshotted.
//! A failed publish is rolled back by the publisher before this layer sees the error.

use serde::Serialize;
use std::path::Path;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog, Outcome};
use crate::backup::{BackupManager, RestoreReport, Snapshot};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::plan::Plan;
use crate::publish::{AtomicPublisher, FsStorage, Storage};
use crate::meta;
use crate::region;
use crate::sitemap;
use crate::validation::{ValidatedPlan, Validator};

/// Outcome of one run, as reported to the trigger that started it.
#[derive(Debug)]
pub struct RunResult {
    /// The record appended to the audit log.
    pub entry: AuditEntry,
    pub error: Option<PipelineError>,
    /// False if the audit append itself failed.
    pub audit_recorded: bool,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.entry.outcome == Outcome::Success
    }

    pub fn requires_intervention(&self) -> bool {
        self.entry.requires_intervention
    }

    pub fn exit_code(&self) -> u8 {
        self.error.as_ref().map_or(0, PipelineError::exit_code)
    }
}

/// Context embedded in the next generator request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorContext {
    pub footer: String,
    pub max_file_bytes: usize,
    pub max_total_bytes: usize,
    pub current_files: Vec<String>,
    pub recent_runs: Vec<AuditEntry>,
}

/// The publishing pipeline - one instance per artifact root
pub struct Pipeline<S: Storage = FsStorage> {
    config: PipelineConfig,
    storage: S,
    validator: Validator,
    backups: BackupManager,
    publisher: AtomicPublisher,
    audit: AuditLog,
}

impl Pipeline<FsStorage> {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::with_storage(config, FsStorage)
    }
}

impl<S: Storage> Pipeline<S> {
    pub fn with_storage(config: PipelineConfig, storage: S) -> Result<Self, PipelineError> {
        config.check()?;
        Ok(Self {
            backups: BackupManager::new(&config.site_dir, &config.backup_dir),
            publisher: AtomicPublisher::new(&config.site_dir),
            audit: AuditLog::new(&config.audit_file),
            validator: Validator::new(),
            storage,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Validate a plan without touching the artifact tree.
    ///
    /// This is the ONLY validation entry point; run_once goes through it too.
    pub fn validate(&self, plan: &Plan) -> Result<ValidatedPlan, PipelineError> {
        self.validator.validate(plan, &self.config, &self.storage)
    }

    /// Run the whole pipeline once for `plan` and record the outcome.
    pub fn run_once(&self, plan: Plan) -> RunResult {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        let _guard = span.enter();
        info!(entries = plan.entries.len(), "run started");

        let mut snapshot_id = None;
        let outcome = self.execute(run_id, &plan, &mut snapshot_id);

        let (mut entry, error) = match outcome {
            Ok((written, plan_hash)) => {
                let summary = if plan.summary.trim().is_empty() {
                    "Site update".to_string()
                } else {
                    plan.summary.clone()
                };
                info!(files = written.len(), "run succeeded");
                let mut entry = AuditEntry::success(run_id, summary, written);
                entry.plan_hash = Some(plan_hash);
                (entry, None)
            }
            Err(err) => (self.failure_entry(run_id, &err), Some(err)),
        };
        entry.snapshot_id = snapshot_id;

        self.finish(entry, error)
    }

    /// Record a plan that could not even be parsed as a failed run.
    pub fn record_rejection(&self, err: PipelineError) -> RunResult {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        let _guard = span.enter();
        let entry = self.failure_entry(run_id, &err);
        self.finish(entry, Some(err))
    }

    fn failure_entry(&self, run_id: Uuid, err: &PipelineError) -> AuditEntry {
        if err.is_fatal() {
            error!(error = %err, "run failed and the artifact tree needs manual recovery");
        } else {
            warn!(kind = err.kind(), error = %err, "run failed");
        }
        AuditEntry::failure(run_id, err)
    }

    fn finish(&self, entry: AuditEntry, error: Option<PipelineError>) -> RunResult {
        let audit_recorded = match self.audit.append(&entry) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "failed to append audit entry");
                false
            }
        };

        RunResult {
            entry,
            error,
            audit_recorded,
        }
    }

    fn execute(
        &self,
        run_id: Uuid,
        plan: &Plan,
        snapshot_id: &mut Option<String>,
    ) -> Result<(Vec<String>, String), PipelineError> {
        // MANDATORY: nothing is snapshotted or written for a rejected plan.
        let mut validated = self.validate(plan)?;
        self.add_sitemap(&mut validated)?;
        self.add_meta(&mut validated)?;

        let snapshot = self
            .backups
            .snapshot(&self.storage, &validated.paths(), run_id)?;
        *snapshot_id = Some(snapshot.id.clone());

        match self
            .publisher
            .publish(&self.storage, &self.backups, &validated, &snapshot)
        {
            Ok(written) => {
                self.retain(&snapshot);
                Ok((written, validated.plan_hash().to_string()))
            }
            Err(err) => {
                if let Err(e) = self.backups.mark_failed(&snapshot) {
                    warn!(error = %e, snapshot = %snapshot.id, "could not flag snapshot as failed");
                }
                Err(err)
            }
        }
    }

    /// Apply the retention policy after a successful publish. Failures here never fail the run.
    fn retain(&self, snapshot: &Snapshot) {
        let keep = self.config.backup.keep_successful;
        let result = if keep == 0 {
            self.backups.discard(snapshot)
        } else {
            self.backups.prune(keep).map(|_| ())
        };
        if let Err(e) = result {
            warn!(error = %e, "snapshot retention failed");
        }
    }

    fn add_sitemap(&self, validated: &mut ValidatedPlan) -> Result<(), PipelineError> {
        let Some(settings) = &self.config.sitemap else {
            return Ok(());
        };

        let mut pages: Vec<String> = self
            .storage
            .list(&self.config.site_dir)?
            .into_iter()
            .filter(|p| self.config.is_markup(p, None))
            .collect();
        pages.extend(
            validated
                .entries()
                .iter()
                .filter(|e| e.is_markup())
                .map(|e| e.path().to_string()),
        );

        let xml = sitemap::render(&settings.base_url, &pages, chrono::Utc::now());
        if !validated.push_derived(settings.path.clone(), xml.into_bytes()) {
            info!(path = %settings.path, "plan supplies its own sitemap");
        }
        Ok(())
    }

    /// Derive page metadata from the plan's landing page, or its first markup entry.
    ///
    /// A region-mode page contributes only the text between its markers.
    fn add_meta(&self, validated: &mut ValidatedPlan) -> Result<(), PipelineError> {
        let Some(settings) = &self.config.meta else {
            return Ok(());
        };
        let markup: Vec<_> = validated.entries().iter().filter(|e| e.is_markup()).collect();
        let Some(source) = markup
            .iter()
            .find(|e| e.path() == "index.html")
            .or_else(|| markup.first())
        else {
            return Ok(());
        };

        let Ok(document) = std::str::from_utf8(source.bytes()) else {
            return Ok(());
        };
        let body = region::locate(document, &self.config.markup_markers)
            .map(|located| located.mutable)
            .unwrap_or(document);

        let page = meta::derive(body, &settings.site_name);
        let mut json = serde_json::to_string_pretty(&page)?;
        json.push('\n');
        if !validated.push_derived(settings.path.clone(), json.into_bytes()) {
            info!(path = %settings.path, "plan supplies its own page metadata");
        }
        Ok(())
    }

    /// Current file list plus the most recent runs, for the next generator request.
    pub fn generator_context(&self, limit: Option<usize>) -> Result<GeneratorContext, PipelineError> {
        let limit = limit.unwrap_or(self.config.context_entries);
        Ok(GeneratorContext {
            footer: self.config.footer.clone(),
            max_file_bytes: self.config.max_file_bytes,
            max_total_bytes: self.config.max_total_bytes,
            current_files: self.storage.list(&self.config.site_dir)?,
            recent_runs: self.audit.recent(limit)?,
        })
    }

    /// Manually put a retained snapshot back into the artifact tree.
    pub fn restore_snapshot(&self, dir: &Path) -> Result<RestoreReport, PipelineError> {
        let snapshot = self.backups.load(dir)?;
        info!(snapshot = %snapshot.id, files = snapshot.files().len(), "manual restore");
        self.backups.restore(&self.storage, &snapshot)
    }
}
