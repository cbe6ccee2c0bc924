//! Pipeline Configuration - Deployment Profile
//!
//! Loaded from a JSON file. Every field has a default so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::region::Region;
use crate::validation::normalize_path;
use crate::ENGINE_VERSION;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Published artifact tree.
    #[serde(default = "default_site_dir")]
    pub site_dir: PathBuf,
    /// Snapshot store; must live outside `site_dir`.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    #[serde(default = "default_audit_file")]
    pub audit_file: PathBuf,
    /// Protected attribution that every published markup document must contain.
    #[serde(default = "default_footer")]
    pub footer: String,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: usize,
    #[serde(default = "default_markup_markers")]
    pub markup_markers: Region,
    #[serde(default = "default_stylesheet_markers")]
    pub stylesheet_markers: Region,
    #[serde(default = "default_markup_extensions")]
    pub markup_extensions: Vec<String>,
    #[serde(default)]
    pub backup: BackupPolicy,
    /// Number of audit entries handed to the generator as context.
    #[serde(default = "default_context_entries")]
    pub context_entries: usize,
    #[serde(default = "default_engine_min_version")]
    pub engine_min_version: String,
    #[serde(default)]
    pub sitemap: Option<SitemapConfig>,
    /// Page metadata derived from the published markup.
    #[serde(default)]
    pub meta: Option<MetaConfig>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicy {
    /// Snapshots of successful runs to keep. Zero discards them immediately.
    #[serde(default = "default_keep_successful")]
    pub keep_successful: usize,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            keep_successful: default_keep_successful(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SitemapConfig {
    pub base_url: String,
    #[serde(default = "default_sitemap_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaConfig {
    pub site_name: String,
    #[serde(default = "default_meta_path")]
    pub path: String,
}

fn default_site_dir() -> PathBuf { PathBuf::from("site") }
fn default_backup_dir() -> PathBuf { PathBuf::from("backups") }
fn default_audit_file() -> PathBuf { PathBuf::from("audit.jsonl") }
fn default_footer() -> String { "Created by CrowtherTech".to_string() }
fn default_max_file_bytes() -> usize { 150 * 1024 }
fn default_max_total_bytes() -> usize { 2 * 1024 * 1024 }
fn default_markup_markers() -> Region { Region::new("<!-- AI-START -->", "<!-- AI-END -->") }
fn default_stylesheet_markers() -> Region { Region::new("/* AI-CSS-START */", "/* AI-CSS-END */") }
fn default_markup_extensions() -> Vec<String> { vec!["html".to_string(), "htm".to_string()] }
fn default_keep_successful() -> usize { 3 }
fn default_context_entries() -> usize { 5 }
fn default_engine_min_version() -> String { "1.0.0".to_string() }
fn default_sitemap_path() -> String { "sitemap.xml".to_string() }
fn default_meta_path() -> String { "data/meta.json".to_string() }
fn default_log_level() -> String { "info".to_string() }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            site_dir: default_site_dir(),
            backup_dir: default_backup_dir(),
            audit_file: default_audit_file(),
            footer: default_footer(),
            max_file_bytes: default_max_file_bytes(),
            max_total_bytes: default_max_total_bytes(),
            markup_markers: default_markup_markers(),
            stylesheet_markers: default_stylesheet_markers(),
            markup_extensions: default_markup_extensions(),
            backup: BackupPolicy::default(),
            context_entries: default_context_entries(),
            engine_min_version: default_engine_min_version(),
            sitemap: None,
            meta: None,
            log_level: default_log_level(),
        }
    }
}

impl PipelineConfig {
    /// Default profile with every store placed under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        let mut config = Self::default();
        config.resolve_against(root);
        config
    }

    /// Load a profile from a JSON file. Relative paths resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config: Self = serde_json::from_str(&content).map_err(|e| {
            PipelineError::Config(format!("invalid config {}: {}", path.display(), e))
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_against(base);
        config.check()?;
        Ok(config)
    }

    fn resolve_against(&mut self, base: &Path) {
        for dir in [&mut self.site_dir, &mut self.backup_dir, &mut self.audit_file] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }

    /// Reject profiles the pipeline cannot enforce.
    pub fn check(&self) -> Result<(), PipelineError> {
        if self.footer.is_empty() {
            return Err(PipelineError::Config("footer must not be empty".into()));
        }
        if self.max_file_bytes == 0 || self.max_total_bytes == 0 {
            return Err(PipelineError::Config("size ceilings must be positive".into()));
        }
        for (name, region) in [
            ("markupMarkers", &self.markup_markers),
            ("stylesheetMarkers", &self.stylesheet_markers),
        ] {
            if region.start_marker.is_empty() || region.end_marker.is_empty() {
                return Err(PipelineError::Config(format!("{} must not be empty", name)));
            }
            if region.start_marker.contains(&region.end_marker)
                || region.end_marker.contains(&region.start_marker)
            {
                return Err(PipelineError::Config(format!(
                    "{} start and end markers must be distinct",
                    name
                )));
            }
        }
        let derived = [
            ("sitemap", self.sitemap.as_ref().map(|s| &s.path)),
            ("meta", self.meta.as_ref().map(|m| &m.path)),
        ];
        for (name, path) in derived {
            let Some(path) = path else { continue };
            if normalize_path(path).as_deref() != Some(path.as_str()) {
                return Err(PipelineError::Config(format!(
                    "{} path {} must be a normalized relative path",
                    name, path
                )));
            }
        }
        if self.backup_dir.starts_with(&self.site_dir) {
            return Err(PipelineError::Config(
                "backupDir must be outside siteDir".into(),
            ));
        }
        if self.audit_file.starts_with(&self.site_dir) {
            return Err(PipelineError::Config(
                "auditFile must be outside siteDir".into(),
            ));
        }
        self.check_engine_version()
    }

    fn check_engine_version(&self) -> Result<(), PipelineError> {
        let engine_ver = semver::Version::parse(ENGINE_VERSION)
            .map_err(|_| PipelineError::Config("Invalid engine version".into()))?;
        let min_ver = semver::Version::parse(&self.engine_min_version)
            .map_err(|_| PipelineError::Config("Invalid engineMinVersion".into()))?;

        if engine_ver < min_ver {
            return Err(PipelineError::EngineVersionMismatch(
                self.engine_min_version.clone(),
                ENGINE_VERSION.to_string(),
            ));
        }

        Ok(())
    }

    /// True when `path` names a markup document by extension or declared type.
    pub fn is_markup(&self, path: &str, declared_type: Option<&str>) -> bool {
        if matches!(declared_type, Some("html") | Some("html-fragment")) {
            return true;
        }
        Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |ext| {
                self.markup_extensions
                    .iter()
                    .any(|m| m.eq_ignore_ascii_case(ext))
            })
    }

    /// Marker pair for region-mode entries; `None` means whole-file mode.
    pub fn region_for(&self, declared_type: Option<&str>) -> Option<&Region> {
        match declared_type {
            Some("html-fragment") => Some(&self.markup_markers),
            Some("css-fragment") => Some(&self.stylesheet_markers),
            _ => None,
        }
    }
}
