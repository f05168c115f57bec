//! # Config Advisor CLI (`cfa`)
//!
//! The `cfa` binary drives the advisor: it scans YAML configuration with an
//! analysis backend, lists and reviews the resulting proposals, applies
//! accepted ones with a drift check and backup, and serves the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! cfa --config ./config/advisor.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cfa init` | Create the SQLite database and schema |
//! | `cfa documents` | List the documents a scan would cover |
//! | `cfa scan [paths...]` | Analyze documents and record proposals |
//! | `cfa runs` / `cfa run <id>` | Inspect analysis runs |
//! | `cfa cancel <id>` | Cancel a running analysis |
//! | `cfa proposals` / `cfa show <id>` | Inspect proposals |
//! | `cfa accept\|reject\|rescan <ids...>` | Review proposals |
//! | `cfa apply <id>` / `cfa rollback <id>` | Write or revert an accepted edit |
//! | `cfa discard <id>` | Delete a proposal |
//! | `cfa check` | Mark accepted proposals with changed documents as stale |
//! | `cfa serve` | Start the HTTP API |

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use config_advisor::config;
use config_advisor::{commands, logging, migrate, server};
use config_advisor::progress::ProgressMode;
use config_advisor_core::lifecycle::ProposalAction;

/// Config Advisor: LLM-assisted review of YAML configuration with safe,
/// reversible edits.
#[derive(Parser)]
#[command(
    name = "cfa",
    about = "Config Advisor: LLM-assisted review of YAML configuration",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/advisor.toml`.
    #[arg(long, global = true, default_value = "./config/advisor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List the documents under the configured root.
    Documents,

    /// Analyze documents and record the proposals found.
    ///
    /// With no paths, every document under the root is analyzed.
    Scan {
        /// Document paths relative to the root.
        paths: Vec<String>,

        /// Progress output on stderr: `off`, `human`, or `json`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long, value_parser = parse_progress)]
        progress: Option<ProgressMode>,
    },

    /// List recent runs, newest first.
    Runs {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show one run.
    Run { id: String },

    /// Cancel a running analysis.
    Cancel { id: String },

    /// List proposals.
    Proposals {
        /// Only proposals from this run.
        #[arg(long)]
        run_id: Option<String>,

        /// Only proposals in this state (pending, accepted, rejected, applied, stale).
        #[arg(long)]
        status: Option<String>,
    },

    /// Show a proposal with its before and after text.
    Show { id: String },

    /// Accept one or more pending proposals.
    Accept {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Reject one or more proposals.
    Reject {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Re-anchor stale excerpt proposals against the current documents.
    Rescan {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Apply an accepted proposal to its document.
    Apply { id: String },

    /// Restore the document an applied proposal changed.
    Rollback { id: String },

    /// Delete a proposal that has not been accepted or applied.
    Discard { id: String },

    /// Re-check accepted proposals against the current documents.
    Check,

    /// Start the HTTP API server.
    Serve,
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    match s {
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => Err(format!("invalid progress mode '{}' (off, human, json)", other)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Documents => {
            commands::run_documents(&cfg).await?;
        }
        Commands::Scan { paths, progress } => {
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            commands::run_scan(&cfg, paths, progress).await?;
        }
        Commands::Runs { limit } => {
            commands::run_runs(&cfg, limit).await?;
        }
        Commands::Run { id } => {
            commands::run_show_run(&cfg, &id).await?;
        }
        Commands::Cancel { id } => {
            commands::run_cancel(&cfg, &id).await?;
        }
        Commands::Proposals { run_id, status } => {
            commands::run_proposals(&cfg, run_id, status).await?;
        }
        Commands::Show { id } => {
            commands::run_show(&cfg, &id).await?;
        }
        Commands::Accept { ids } => {
            commands::run_transition(&cfg, &ids, ProposalAction::Accept).await?;
        }
        Commands::Reject { ids } => {
            commands::run_transition(&cfg, &ids, ProposalAction::Reject).await?;
        }
        Commands::Rescan { ids } => {
            commands::run_transition(&cfg, &ids, ProposalAction::Rescan).await?;
        }
        Commands::Apply { id } => {
            commands::run_apply(&cfg, &id).await?;
        }
        Commands::Rollback { id } => {
            commands::run_rollback(&cfg, &id).await?;
        }
        Commands::Discard { id } => {
            commands::run_discard(&cfg, &id).await?;
        }
        Commands::Check => {
            commands::run_check(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
