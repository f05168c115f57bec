//! # Config Advisor
//!
//! Reviews a directory of YAML configuration (e.g. Home Assistant's
//! `/config`) with an LLM and turns its suggestions into proposals that a
//! person accepts, rejects, and applies. Nothing is written until a proposal
//! is explicitly applied, and every apply is preceded by a drift check and a
//! backup.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │  Documents  │──▶│   Chunker   │──▶│  Analysis   │──▶│ Extractor│
//! │ (FS, YAML)  │   │ (size-bound)│   │  backend    │   │ (strict) │
//! └──────▲──────┘   └─────────────┘   └─────────────┘   └────┬─────┘
//!        │                                                   ▼
//!        │ backup + atomic write                      ┌─────────────┐
//!        └──────────── Safe-apply engine ◀────────────│  Proposals  │
//!                                                     │  (SQLite)   │
//!                                                     └─────────────┘
//! ```
//!
//! The I/O-free pieces (chunking, extraction, state machines, structural
//! validation, store traits) live in the `config-advisor-core` crate.
//!
//! ## Quick Start
//!
//! ```bash
//! cfa init                      # create database
//! cfa scan                      # analyze every YAML file
//! cfa proposals --status pending
//! cfa accept <id>
//! cfa apply <id>                # drift check, backup, atomic write
//! cfa serve                     # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`documents`] | Filesystem document store |
//! | [`analysis`] | Analysis backends (disabled, OpenAI-compatible, replay) |
//! | [`advisor`] | Run dispatch and proposal lifecycle |
//! | [`apply`] | Safe-apply engine and rollback |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite record store |

pub mod advisor;
pub mod analysis;
pub mod apply;
pub mod commands;
pub mod config;
pub mod db;
pub mod documents;
pub mod logging;
pub mod migrate;
pub mod progress;
pub mod server;
pub mod sqlite_store;

use std::sync::Arc;

use anyhow::Result;

use crate::advisor::{Advisor, AdvisorOptions};
use crate::analysis::{create_backend, AnalysisBackend};
use crate::config::Config;
use crate::documents::FsDocumentStore;
use crate::sqlite_store::SqliteRecordStore;

/// Wire the configured document store, SQLite records, and analysis
/// backend into an [`Advisor`]. The schema is created if missing.
pub async fn open_advisor(config: &Config) -> Result<Advisor> {
    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;

    let options = AdvisorOptions::from_config(&config.analysis)?;
    let documents = Arc::new(FsDocumentStore::from_config(&config.documents)?);
    let records = Arc::new(SqliteRecordStore::new(pool));
    let backend: Arc<dyn AnalysisBackend> = Arc::from(create_backend(&config.backend, options.task)?);

    Ok(Advisor::new(documents, records, backend, options))
}
