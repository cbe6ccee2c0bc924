//! SiteGate Core - Safety-Gated Publishing Pipeline
//!
//! # The Five Guarantees (Non-Negotiable)
//! 1. The Protected Footer Survives Every Mutation
//! 2. Size Ceilings Hold Per File And Per Plan
//! 3. No Externally Sourced Active Content Is Published
//! 4. A Failed Run Leaves The Tree As It Was
//! 5. Generators Suggest, Pipeline Enforces

pub mod audit;
pub mod backup;
pub mod config;
pub mod error;
pub mod hashing;
pub mod logging;
pub mod meta;
pub mod pipeline;
pub mod plan;
pub mod publish;
pub mod region;
pub mod sanitize;
pub mod sitemap;
pub mod validation;

pub use audit::{AuditEntry, AuditLog, Outcome};
pub use backup::{BackupManager, PriorState, RestoreReport, Snapshot};
pub use config::{BackupPolicy, MetaConfig, PipelineConfig, SitemapConfig};
pub use error::{PipelineError, RestoreFailure};
pub use meta::PageMeta;
pub use hashing::{canonical_json, compute_plan_hash, sha256_hex};
pub use pipeline::{GeneratorContext, Pipeline, RunResult};
pub use plan::{EntryContent, EntryKind, FileEntry, Plan};
pub use publish::{AtomicPublisher, FsStorage, Storage};
pub use region::{LocatedRegion, Region, RegionError};
pub use validation::{ValidatedEntry, ValidatedPlan, ValidationRule, Validator};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
