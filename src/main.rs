// src/main.rs
//
// =============================================================================
// DATALAB: COMMAND LINE ENTRY POINT
// =============================================================================
//
// Drives the build core against the local SQLite collaborator.
//
// Modes:
// 1. IMPORT-SOURCE: Load a JSON row array as a datasource.
// 2. VALIDATE:      Check a build document and print its error tree.
// 3. ATTACH:        Choose a matching field for a module, reconciling keys.
// 4. RECHECK:       Re-run the discrepancy check of an attached module.
// 5. ROWS:          Print the joined dataset.
// 6. SAVE / LIST:   Persist a build; list saved DataLabs and sources.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use datalab::config::{self, LabConfig};
use datalab::core::Resolution;
use datalab::session::{FixedPrompter, JoinOutcome, LabSession};
use datalab::store::LocalServer;
use datalab::validator;

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(name = "datalab", version, about = "DataLab build tooling")]
struct Cli {
    /// Lab config (YAML). Defaults apply when the file is missing.
    #[arg(long, global = true, default_value = "datalab.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum PrimaryArg {
    Add,
    Drop,
}

#[derive(Clone, Copy, ValueEnum)]
enum MatchingArg {
    Keep,
    Ignore,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a JSON array of objects as a datasource.
    ImportSource {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        file: PathBuf,
    },

    /// List stored datasources.
    Sources,

    /// Validate a build document.
    Validate {
        #[arg(long)]
        build: PathBuf,
    },

    /// Choose the matching field of a module and reconcile key mismatches.
    Attach {
        #[arg(long)]
        build: PathBuf,
        /// 1-based module number.
        #[arg(long)]
        module: usize,
        #[arg(long)]
        matching: String,
        /// Records only in the new source.
        #[arg(long, value_enum)]
        primary: Option<PrimaryArg>,
        /// Records only in the DataLab.
        #[arg(long = "build-only", value_enum)]
        build_only: Option<MatchingArg>,
        /// Where to write the updated build (default: in place).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Re-run the discrepancy check of an attached module.
    Recheck {
        #[arg(long)]
        build: PathBuf,
        #[arg(long)]
        module: usize,
        #[arg(long, value_enum)]
        primary: Option<PrimaryArg>,
        #[arg(long = "build-only", value_enum)]
        build_only: Option<MatchingArg>,
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Print the joined rows of a build as JSON lines.
    Rows {
        #[arg(long)]
        build: PathBuf,
    },

    /// Validate and persist a build.
    Save {
        #[arg(long)]
        build: PathBuf,
    },

    /// List saved DataLabs.
    List,
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let cfg = LabConfig::load_or_default(&cli.config)?;
    let server = LocalServer::open(&cfg.database)
        .with_context(|| format!("Opening {}", cfg.database.display()))?;

    match cli.command {
        Commands::ImportSource { id, name, file } => {
            let rows = config::load_rows(&file)?;
            server.put_source(&id, name.as_deref().unwrap_or(&id), &rows)?;
            for (field, ty) in server.source_fields(&id)? {
                println!("{field}\t{ty:?}");
            }
            Ok(())
        }
        Commands::Sources => {
            for s in server.list_sources()? {
                println!("{}\t{}\t{} rows", s.id, s.name, s.rows);
            }
            Ok(())
        }
        Commands::Validate { build } => run_validate(build),
        Commands::Attach {
            build,
            module,
            matching,
            primary,
            build_only,
            out,
        } => {
            let step = step_index(module)?;
            let prompter = prompter_for(primary, build_only);
            let doc = config::load_build(&build)?;
            let mut session = LabSession::open(doc, server, prompter, &cfg);
            let outcome = session.choose_matching_field(step, matching).await?;
            report_outcome(module, &outcome);
            config::write_build(out.unwrap_or(build), session.build())?;
            Ok(())
        }
        Commands::Recheck {
            build,
            module,
            primary,
            build_only,
            out,
        } => {
            let step = step_index(module)?;
            let prompter = prompter_for(primary, build_only);
            let doc = config::load_build(&build)?;
            let mut session = LabSession::open(doc, server, prompter, &cfg);
            let outcome = session.manage_discrepancies(step).await?;
            report_outcome(module, &outcome);
            config::write_build(out.unwrap_or(build), session.build())?;
            Ok(())
        }
        Commands::Rows { build } => {
            let doc = config::load_build(&build)?;
            for row in server.rows(&doc)? {
                println!("{}", serde_json::to_string(&row)?);
            }
            Ok(())
        }
        Commands::Save { build } => {
            let doc = config::load_build(&build)?;
            let mut session = LabSession::open(doc, server, FixedPrompter::default(), &cfg);
            match session.save().await {
                Ok(saved) => {
                    println!("{}\t{}", saved.id, saved.name);
                    config::write_build(&build, session.build())?;
                    Ok(())
                }
                Err(e) => {
                    for line in session.errors().lines() {
                        eprintln!("  {line}");
                    }
                    Err(e.into())
                }
            }
        }
        Commands::List => {
            for lab in server.list_datalabs()? {
                println!("{}\t{}\t{}", lab.id, lab.name, lab.updated_at.to_rfc3339());
            }
            Ok(())
        }
    }
}

// ============================================================================
// 3. HELPERS
// ============================================================================

fn run_validate(path: PathBuf) -> Result<()> {
    let build = config::load_build(&path)?;
    let report = validator::validate(&build);
    if report.is_valid {
        println!("'{}' is valid ({} modules)", build.name, build.steps.len());
        return Ok(());
    }
    for line in report.errors.lines() {
        println!("{line}");
    }
    Err(anyhow!("{} problem(s) found", report.errors.count()))
}

fn step_index(module: usize) -> Result<usize> {
    module
        .checked_sub(1)
        .ok_or_else(|| anyhow!("Modules are numbered from 1"))
}

fn prompter_for(primary: Option<PrimaryArg>, build_only: Option<MatchingArg>) -> FixedPrompter {
    let resolution = if primary.is_none() && build_only.is_none() {
        None
    } else {
        Some(Resolution::new(
            primary.map(|p| matches!(p, PrimaryArg::Add)),
            build_only.map(|m| matches!(m, MatchingArg::Keep)),
        ))
    };
    FixedPrompter { resolution }
}

fn report_outcome(module: usize, outcome: &JoinOutcome) {
    match outcome {
        JoinOutcome::Settled => log::info!("Module {} joined without discrepancies", module),
        JoinOutcome::Resolved(r) => log::info!(
            "Module {} discrepancies resolved (new-source-only: {:?}, build-only: {:?})",
            module,
            r.primary_policy(),
            r.matching_policy()
        ),
        JoinOutcome::Cleared => log::info!("Module {} discrepancies no longer apply", module),
        JoinOutcome::Cancelled => {
            log::warn!("Module {} left unresolved; pass --primary / --build-only", module)
        }
        JoinOutcome::Superseded => log::warn!("Module {} check was superseded", module),
    }
}
