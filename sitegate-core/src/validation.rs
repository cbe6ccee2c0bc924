//! Safety Validation - All-or-Nothing Plan Approval
//!
//! Rules run in a fixed order against every entry, in plan order, and the first
//! violation rejects the whole plan. Rules may also transform the bytes that will
//! be written (sanitizing, region composition), so what is approved is exactly
//! what gets published.

use std::collections::HashSet;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::hashing::compute_plan_hash;
use crate::plan::{FileEntry, Plan};
use crate::publish::Storage;
use crate::region::{self, Region, RegionError};
use crate::sanitize;
use crate::ENGINE_VERSION;

/// One entry on its way through the rules.
pub struct Candidate<'a> {
    pub index: usize,
    pub entry: &'a FileEntry,
    pub markup: bool,
    /// Marker pair when the entry replaces a region instead of the whole file.
    pub region: Option<&'a Region>,
    /// Bytes that will be written if the plan is approved.
    pub output: Vec<u8>,
    /// Normalized target path, set by the path rule.
    pub target: Option<String>,
}

impl<'a> Candidate<'a> {
    fn new(index: usize, entry: &'a FileEntry, config: &'a PipelineConfig) -> Self {
        let declared = entry.declared_type.as_deref();
        Self {
            index,
            entry,
            markup: config.is_markup(&entry.path, declared),
            region: config.region_for(declared),
            output: entry.content.as_bytes().to_vec(),
            target: None,
        }
    }

    fn path(&self) -> String {
        self.entry.path.clone()
    }
}

/// State shared by the rules across one plan.
pub struct RuleContext<'a> {
    pub config: &'a PipelineConfig,
    pub storage: &'a dyn Storage,
    pub running_total: usize,
}

/// Validation rule trait - rejects or transforms one candidate
pub trait ValidationRule {
    fn name(&self) -> &'static str;
    fn apply(
        &self,
        candidate: &mut Candidate<'_>,
        ctx: &mut RuleContext<'_>,
    ) -> Result<(), PipelineError>;
}

// --- Concrete Rules ---

pub struct EmptyContentRule;

impl ValidationRule for EmptyContentRule {
    fn name(&self) -> &'static str { "empty_content" }

    fn apply(&self, c: &mut Candidate<'_>, _ctx: &mut RuleContext<'_>) -> Result<(), PipelineError> {
        if c.entry.content.is_empty() {
            return Err(PipelineError::EmptyContent { index: c.index, path: c.path() });
        }
        Ok(())
    }
}

pub struct FileSizeRule;

impl ValidationRule for FileSizeRule {
    fn name(&self) -> &'static str { "file_size" }

    fn apply(&self, c: &mut Candidate<'_>, ctx: &mut RuleContext<'_>) -> Result<(), PipelineError> {
        let size = c.entry.size();
        let limit = ctx.config.max_file_bytes;
        if size > limit {
            return Err(PipelineError::FileTooLarge { index: c.index, path: c.path(), size, limit });
        }
        Ok(())
    }
}

pub struct TotalSizeRule;

impl ValidationRule for TotalSizeRule {
    fn name(&self) -> &'static str { "total_size" }

    fn apply(&self, c: &mut Candidate<'_>, ctx: &mut RuleContext<'_>) -> Result<(), PipelineError> {
        ctx.running_total += c.entry.size();
        let limit = ctx.config.max_total_bytes;
        if ctx.running_total > limit {
            return Err(PipelineError::TotalTooLarge {
                index: c.index,
                path: c.path(),
                total: ctx.running_total,
                limit,
            });
        }
        Ok(())
    }
}

/// Rejects externally sourced active elements and strips inline scripts.
pub struct ActiveContentRule;

impl ValidationRule for ActiveContentRule {
    fn name(&self) -> &'static str { "active_content" }

    fn apply(&self, c: &mut Candidate<'_>, _ctx: &mut RuleContext<'_>) -> Result<(), PipelineError> {
        if !c.markup {
            return Ok(());
        }
        let text = std::str::from_utf8(&c.output).map_err(|_| PipelineError::ForbiddenContent {
            index: c.index,
            path: c.path(),
            reason: "markup is not valid UTF-8".to_string(),
        })?;
        if let Some(reason) = sanitize::find_forbidden(text) {
            return Err(PipelineError::ForbiddenContent {
                index: c.index,
                path: c.path(),
                reason: reason.to_string(),
            });
        }
        let stripped = sanitize::strip_inline_scripts(text);
        if stripped.len() != text.len() {
            debug!(path = %c.entry.path, removed = text.len() - stripped.len(), "stripped inline scripts");
        }
        c.output = stripped.into_bytes();
        Ok(())
    }
}

/// Splices region-mode entries into the existing document.
pub struct RegionRule;

impl ValidationRule for RegionRule {
    fn name(&self) -> &'static str { "region" }

    fn apply(&self, c: &mut Candidate<'_>, ctx: &mut RuleContext<'_>) -> Result<(), PipelineError> {
        let Some(region) = c.region else {
            return Ok(());
        };
        // An unsafe path is never read; the path rule rejects it.
        let Some(target) = normalize_path(&c.entry.path) else {
            return Ok(());
        };

        let fragment = std::str::from_utf8(&c.output).map_err(|_| PipelineError::RegionMalformed {
            index: c.index,
            path: c.path(),
            reason: "fragment is not valid UTF-8".to_string(),
        })?;

        let existing = ctx.storage.read(&ctx.config.site_dir.join(&target))?;
        let composed = match existing {
            Some(bytes) => {
                let document = String::from_utf8(bytes).map_err(|_| PipelineError::RegionMalformed {
                    index: c.index,
                    path: c.path(),
                    reason: "existing document is not valid UTF-8".to_string(),
                })?;
                // A marker inside the fragment would leave the document with two of it.
                if let Some(marker) = region.marker_in(fragment) {
                    return Err(PipelineError::RegionMalformed {
                        index: c.index,
                        path: c.path(),
                        reason: format!("fragment contains region marker {:?}", marker),
                    });
                }
                let located = region::locate(&document, region)
                    .map_err(|e| region_error(c.index, &c.entry.path, e))?;
                located.splice(fragment)
            }
            None => {
                // No document yet: the entry must be a full seed carrying both markers.
                region::locate(fragment, region)
                    .map_err(|e| region_error(c.index, &c.entry.path, e))?;
                fragment.to_string()
            }
        };

        // The ceiling applies to what gets written, not just the fragment.
        let limit = ctx.config.max_file_bytes;
        if composed.len() > limit {
            return Err(PipelineError::FileTooLarge {
                index: c.index,
                path: c.path(),
                size: composed.len(),
                limit,
            });
        }

        c.output = composed.into_bytes();
        Ok(())
    }
}

fn region_error(index: usize, path: &str, err: RegionError) -> PipelineError {
    match err {
        RegionError::Missing { marker } => PipelineError::RegionMissing {
            index,
            path: path.to_string(),
            marker,
        },
        RegionError::Malformed { reason } => PipelineError::RegionMalformed {
            index,
            path: path.to_string(),
            reason,
        },
    }
}

/// Checked against the composed document, so a footer outside the region counts.
pub struct ProtectedFooterRule;

impl ValidationRule for ProtectedFooterRule {
    fn name(&self) -> &'static str { "protected_footer" }

    fn apply(&self, c: &mut Candidate<'_>, ctx: &mut RuleContext<'_>) -> Result<(), PipelineError> {
        if !c.markup {
            return Ok(());
        }
        let footer = ctx.config.footer.as_bytes();
        if !contains_bytes(&c.output, footer) {
            return Err(PipelineError::FooterMissing { index: c.index, path: c.path() });
        }
        Ok(())
    }
}

pub struct PathSafetyRule;

impl ValidationRule for PathSafetyRule {
    fn name(&self) -> &'static str { "path_safety" }

    fn apply(&self, c: &mut Candidate<'_>, _ctx: &mut RuleContext<'_>) -> Result<(), PipelineError> {
        match normalize_path(&c.entry.path) {
            Some(target) => {
                c.target = Some(target);
                Ok(())
            }
            None => Err(PipelineError::UnsafePath { index: c.index, path: c.path() }),
        }
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Normalize a plan path relative to the artifact root.
///
/// Returns `None` for empty or absolute paths, drive prefixes, NUL bytes and any
/// `..` segment. `.` and empty segments are dropped; separators become `/`.
pub fn normalize_path(raw: &str) -> Option<String> {
    if raw.is_empty() || raw.contains('\0') {
        return None;
    }
    if raw.starts_with('/') || raw.starts_with('\\') {
        return None;
    }
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return None;
    }

    let mut parts = Vec::new();
    for segment in raw.split(|c| c == '/' || c == '\\') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s => parts.push(s),
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// An approved entry: normalized target and the exact bytes to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedEntry {
    path: String,
    bytes: Vec<u8>,
    markup: bool,
}

impl ValidatedEntry {
    pub fn path(&self) -> &str { &self.path }
    pub fn bytes(&self) -> &[u8] { &self.bytes }
    pub fn is_markup(&self) -> bool { self.markup }
}

/// A plan that passed every rule. Only the validator can construct one.
#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    entries: Vec<ValidatedEntry>,
    summary: String,
    plan_hash: String,
}

impl ValidatedPlan {
    pub fn entries(&self) -> &[ValidatedEntry] {
        &self.entries
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn plan_hash(&self) -> &str {
        &self.plan_hash
    }

    /// Every path the publish step will touch, in write order.
    pub fn paths(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.path.clone()).collect()
    }

    /// Add a file computed by the pipeline itself. Plan entries win on conflict.
    pub(crate) fn push_derived(&mut self, path: String, bytes: Vec<u8>) -> bool {
        if self.entries.iter().any(|e| e.path == path) {
            return false;
        }
        self.entries.push(ValidatedEntry { path, bytes, markup: false });
        true
    }
}

/// Validator runs the rules in order and stops at the first violation
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(EmptyContentRule),
                Box::new(FileSizeRule),
                Box::new(TotalSizeRule),
                Box::new(ActiveContentRule),
                Box::new(RegionRule),
                Box::new(ProtectedFooterRule),
                Box::new(PathSafetyRule),
            ],
        }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn validate(
        &self,
        plan: &Plan,
        config: &PipelineConfig,
        storage: &dyn Storage,
    ) -> Result<ValidatedPlan, PipelineError> {
        if plan.entries.is_empty() {
            return Err(PipelineError::PlanFormat("plan contains no entries".to_string()));
        }

        let plan_hash = compute_plan_hash(&plan.to_wire(), ENGINE_VERSION)?;
        let mut ctx = RuleContext { config, storage, running_total: 0 };
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(plan.entries.len());

        for (index, entry) in plan.entries.iter().enumerate() {
            let mut candidate = Candidate::new(index, entry, config);

            for rule in &self.rules {
                if let Err(err) = rule.apply(&mut candidate, &mut ctx) {
                    warn!(rule = rule.name(), index, path = %entry.path, error = %err, "plan rejected");
                    return Err(err);
                }
            }

            let path = candidate.target.take().ok_or_else(|| PipelineError::UnsafePath {
                index,
                path: entry.path.clone(),
            })?;
            if !seen.insert(path.clone()) {
                return Err(PipelineError::PlanFormat(format!(
                    "entry {} ({}) targets {} more than once",
                    index, entry.path, path
                )));
            }

            entries.push(ValidatedEntry {
                path,
                bytes: candidate.output,
                markup: candidate.markup,
            });
        }

        debug!(entries = entries.len(), total = ctx.running_total, "plan approved");
        Ok(ValidatedPlan {
            entries,
            summary: plan.summary.clone(),
            plan_hash,
        })
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::FsStorage;

    const FOOTER: &str = "Created by CrowtherTech";

    fn config(root: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            max_file_bytes: 64,
            max_total_bytes: 100,
            ..PipelineConfig::rooted_at(root)
        }
    }

    fn page(body: &str) -> String {
        format!("<p>{}</p><footer>{}</footer>", body, FOOTER)
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a/./b//c.html").as_deref(), Some("a/b/c.html"));
        assert_eq!(normalize_path("a\\b.css").as_deref(), Some("a/b.css"));
        assert_eq!(normalize_path("../secrets.txt"), None);
        assert_eq!(normalize_path("a/../../b"), None);
        assert_eq!(normalize_path("/etc/passwd"), None);
        assert_eq!(normalize_path("C:\\x"), None);
        assert_eq!(normalize_path("./"), None);
    }

    #[test]
    fn test_rule_order() {
        assert_eq!(
            Validator::new().rule_names(),
            vec![
                "empty_content",
                "file_size",
                "total_size",
                "active_content",
                "region",
                "protected_footer",
                "path_safety"
            ]
        );
    }

    #[test]
    fn test_per_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let validator = Validator::new();

        let exact = Plan::new(vec![FileEntry::binary("a.bin", vec![1u8; 64])], "");
        assert!(validator.validate(&exact, &config, &FsStorage).is_ok());

        let over = Plan::new(vec![FileEntry::binary("a.bin", vec![1u8; 65])], "");
        let err = validator.validate(&over, &config, &FsStorage).unwrap_err();
        assert!(matches!(err, PipelineError::FileTooLarge { size: 65, limit: 64, .. }));
    }

    #[test]
    fn test_total_boundary_identifies_first_crossing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let plan = Plan::new(
            vec![
                FileEntry::binary("a.bin", vec![1u8; 40]),
                FileEntry::binary("b.bin", vec![1u8; 40]),
                FileEntry::binary("c.bin", vec![1u8; 40]),
                FileEntry::binary("d.bin", vec![1u8; 40]),
            ],
            "",
        );
        let err = Validator::new().validate(&plan, &config, &FsStorage).unwrap_err();
        match err {
            PipelineError::TotalTooLarge { index, path, total, .. } => {
                assert_eq!(index, 2);
                assert_eq!(path, "c.bin");
                assert_eq!(total, 120);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_markup_sanitized_and_footer_required() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::rooted_at(dir.path());
        let validator = Validator::new();

        let html = format!("<script>alert(1)</script>{}", page("x"));
        let plan = Plan::new(vec![FileEntry::text("index.html", html)], "");
        let validated = validator.validate(&plan, &config, &FsStorage).unwrap();
        assert_eq!(validated.entries()[0].bytes(), page("x").as_bytes());
        assert!(validated.entries()[0].is_markup());

        let plan = Plan::new(vec![FileEntry::text("index.html", "<p>no footer</p>")], "");
        let err = validator.validate(&plan, &config, &FsStorage).unwrap_err();
        assert!(matches!(err, PipelineError::FooterMissing { index: 0, .. }));
    }

    #[test]
    fn test_footer_removed_by_unclosed_script_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::rooted_at(dir.path());
        let html = format!("<p>x</p><script>{}", FOOTER);
        let plan = Plan::new(vec![FileEntry::text("a.html", html)], "");
        let err = Validator::new().validate(&plan, &config, &FsStorage).unwrap_err();
        assert!(matches!(err, PipelineError::FooterMissing { .. }));
    }

    #[test]
    fn test_external_sources_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::rooted_at(dir.path());
        let html = format!(r#"<iframe src="https://x"></iframe>{}"#, page("x"));
        let plan = Plan::new(
            vec![FileEntry::binary("x.dat", vec![1u8]), FileEntry::text("p.htm", html)],
            "",
        );
        let err = Validator::new().validate(&plan, &config, &FsStorage).unwrap_err();
        assert!(matches!(err, PipelineError::ForbiddenContent { index: 1, .. }));
    }

    #[test]
    fn test_binary_markup_cannot_bypass_checks() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::rooted_at(dir.path());
        let html = r#"<script src="//x"></script>"#.as_bytes().to_vec();
        let plan = Plan::new(vec![FileEntry::binary("evil.html", html)], "");
        let err = Validator::new().validate(&plan, &config, &FsStorage).unwrap_err();
        assert!(matches!(err, PipelineError::ForbiddenContent { .. }));
    }

    #[test]
    fn test_unsafe_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::rooted_at(dir.path());
        let plan = Plan::new(vec![FileEntry::text("../secrets.txt", "x")], "");
        let err = Validator::new().validate(&plan, &config, &FsStorage).unwrap_err();
        assert!(matches!(err, PipelineError::UnsafePath { index: 0, .. }));
    }

    #[test]
    fn test_region_fragment_composed_with_existing_footer() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::rooted_at(dir.path());
        std::fs::create_dir_all(&config.site_dir).unwrap();
        std::fs::write(
            config.site_dir.join("index.html"),
            format!("<!-- AI-START -->old<!-- AI-END --><footer>{}</footer>", FOOTER),
        )
        .unwrap();

        let entry = FileEntry::text("index.html", "<section>new</section>")
            .with_declared_type("html-fragment");
        let validated = Validator::new()
            .validate(&Plan::new(vec![entry], "s"), &config, &FsStorage)
            .unwrap();
        assert_eq!(
            validated.entries()[0].bytes(),
            format!(
                "<!-- AI-START --><section>new</section><!-- AI-END --><footer>{}</footer>",
                FOOTER
            )
            .as_bytes()
        );
    }

    #[test]
    fn test_region_seed_requires_markers() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::rooted_at(dir.path());
        let entry = FileEntry::text("style.css", "body {}").with_declared_type("css-fragment");
        let err = Validator::new()
            .validate(&Plan::new(vec![entry], ""), &config, &FsStorage)
            .unwrap_err();
        assert!(matches!(err, PipelineError::RegionMissing { .. }));

        let seed = FileEntry::text("style.css", "a{} /* AI-CSS-START */ b{} /* AI-CSS-END */")
            .with_declared_type("css-fragment");
        assert!(Validator::new()
            .validate(&Plan::new(vec![seed], ""), &config, &FsStorage)
            .is_ok());
    }

    #[test]
    fn test_normalized_duplicate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::rooted_at(dir.path());
        let plan = Plan::new(
            vec![FileEntry::text("a/b.txt", "1"), FileEntry::text("a/./b.txt", "2")],
            "",
        );
        let err = Validator::new().validate(&plan, &config, &FsStorage).unwrap_err();
        assert!(matches!(err, PipelineError::PlanFormat(_)));
    }

    fn seeded_index(config: &PipelineConfig, outside: &str) {
        FsStorage
            .write(
                &config.site_dir.join("index.html"),
                format!("{}<!-- AI-START -->old<!-- AI-END --><footer>{}</footer>", outside, FOOTER).as_bytes(),
            )
            .unwrap();
    }

    #[test]
    fn test_fragment_with_marker_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::rooted_at(dir.path());
        seeded_index(&config, "");

        let entry = FileEntry::text("index.html", "<p>a</p><!-- AI-END --><p>b</p>")
            .with_declared_type("html-fragment");
        let err = Validator::new()
            .validate(&Plan::new(vec![entry], ""), &config, &FsStorage)
            .unwrap_err();
        match err {
            PipelineError::RegionMalformed { index, reason, .. } => {
                assert_eq!(index, 0);
                assert!(reason.contains("<!-- AI-END -->"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_marker_inside_stripped_script_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::rooted_at(dir.path());
        seeded_index(&config, "");

        // Sanitizing runs before composition, so the marker goes with the script.
        let entry = FileEntry::text("index.html", "<script>/*<!-- AI-END -->*/</script><p>a</p>")
            .with_declared_type("html-fragment");
        let validated = Validator::new()
            .validate(&Plan::new(vec![entry], ""), &config, &FsStorage)
            .unwrap();
        assert_eq!(
            validated.entries()[0].bytes(),
            format!("<!-- AI-START --><p>a</p><!-- AI-END --><footer>{}</footer>", FOOTER).as_bytes()
        );
    }

    #[test]
    fn test_composed_document_bound_by_file_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::rooted_at(dir.path());
        config.max_file_bytes = 200;
        seeded_index(&config, &"x".repeat(120));
        let around = 120 + "<!-- AI-START --><!-- AI-END -->".len() + format!("<footer>{}</footer>", FOOTER).len();

        let fits = FileEntry::text("index.html", "y".repeat(200 - around)).with_declared_type("html-fragment");
        let validated = Validator::new()
            .validate(&Plan::new(vec![fits], ""), &config, &FsStorage)
            .unwrap();
        assert_eq!(validated.entries()[0].bytes().len(), 200);

        let over = FileEntry::text("index.html", "y".repeat(201 - around)).with_declared_type("html-fragment");
        let err = Validator::new()
            .validate(&Plan::new(vec![over], ""), &config, &FsStorage)
            .unwrap_err();
        assert!(matches!(err, PipelineError::FileTooLarge { size: 201, limit: 200, .. }));
    }
}
