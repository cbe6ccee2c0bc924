//! SiteGate CLI - Trigger surface for schedulers and operators
//!
//! Commands: run, validate, history, context, restore
//! Outputs JSON to stdout
//! Exit codes: 0 ok, 1 runtime/config error, 2 plan rejected or rolled back, 3 restore failed

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use sitegate_core::{logging, Pipeline, PipelineConfig, PipelineError, Plan};

#[derive(Parser)]
#[command(name = "sitegate-cli")]
#[command(about = "SiteGate CLI - safety-gated publishing for generated sites")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the pipeline config (JSON). Defaults apply if the file is absent.
    #[arg(short, long, default_value = "sitegate.json")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and publish a plan
    Run {
        /// Plan file, or `-` for stdin. Raw generator output is accepted.
        #[arg(short, long)]
        plan: PathBuf,
    },

    /// Validate a plan without writing anything
    Validate {
        /// Plan file, or `-` for stdin
        #[arg(short, long)]
        plan: PathBuf,
    },

    /// Show recent runs from the audit log
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Print the context for the next generator request
    Context {
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Restore a retained snapshot into the artifact tree
    Restore {
        /// Snapshot directory under the backup store
        #[arg(short, long)]
        snapshot: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            logging::init("info");
            return fail(&e);
        }
    };
    logging::init(&config.log_level);

    let pipeline = match Pipeline::new(config) {
        Ok(p) => p,
        Err(e) => return fail(&e),
    };

    match cli.command {
        Commands::Run { plan } => {
            let result = match read_plan(&plan) {
                Ok(plan) => pipeline.run_once(plan),
                // Unparseable generator output is still a failed run.
                Err(e @ PipelineError::PlanFormat(_)) => pipeline.record_rejection(e),
                Err(e) => return fail(&e),
            };

            print_json(&serde_json::json!({
                "success": result.is_success(),
                "requiresIntervention": result.requires_intervention(),
                "auditRecorded": result.audit_recorded,
                "run": result.entry,
            }));
            ExitCode::from(result.exit_code())
        }

        Commands::Validate { plan } => {
            let outcome = read_plan(&plan).and_then(|p| pipeline.validate(&p));
            match outcome {
                Ok(validated) => {
                    print_json(&serde_json::json!({
                        "valid": true,
                        "planHash": validated.plan_hash(),
                        "paths": validated.paths(),
                    }));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    print_json(&serde_json::json!({
                        "valid": false,
                        "kind": e.kind(),
                        "entry": e.offending_entry(),
                        "error": e.to_string(),
                    }));
                    ExitCode::from(e.exit_code())
                }
            }
        }

        Commands::History { limit } => match pipeline.audit_log().recent(limit) {
            Ok(entries) => {
                print_json(&entries);
                ExitCode::SUCCESS
            }
            Err(e) => fail(&e),
        },

        Commands::Context { limit } => match pipeline.generator_context(limit) {
            Ok(ctx) => {
                print_json(&ctx);
                ExitCode::SUCCESS
            }
            Err(e) => fail(&e),
        },

        Commands::Restore { snapshot } => match pipeline.restore_snapshot(&snapshot) {
            Ok(report) => {
                print_json(&serde_json::json!({
                    "restored": report.restored,
                    "removed": report.removed,
                    "dirsRemoved": report.dirs_removed,
                }));
                ExitCode::SUCCESS
            }
            Err(e) => fail(&e),
        },
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig, PipelineError> {
    if path.exists() {
        PipelineConfig::load(path)
    } else {
        let root = std::env::current_dir()?;
        Ok(PipelineConfig::rooted_at(&root))
    }
}

fn read_plan(path: &Path) -> Result<Plan, PipelineError> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)?
    };
    Plan::from_generator_output(&raw)
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => println!(r#"{{"error": "failed to render output: {}"}}"#, e),
    }
}

fn fail(err: &PipelineError) -> ExitCode {
    print_json(&serde_json::json!({
        "success": false,
        "kind": err.kind(),
        "error": err.to_string(),
    }));
    ExitCode::from(err.exit_code())
}
