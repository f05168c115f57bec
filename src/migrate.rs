//! Schema migrations.
//!
//! Every statement is `IF NOT EXISTS`, so `cfa init` can run any number of
//! times. Timestamps are stored as Unix milliseconds; list-valued run fields
//! are stored as JSON text.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes on an open pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            target_documents TEXT NOT NULL DEFAULT '[]',
            chunk_count INTEGER NOT NULL DEFAULT 0,
            chunks_succeeded INTEGER NOT NULL DEFAULT 0,
            chunks_failed INTEGER NOT NULL DEFAULT 0,
            chunk_failures TEXT NOT NULL DEFAULT '[]',
            proposal_count INTEGER NOT NULL DEFAULT 0,
            dropped_count INTEGER NOT NULL DEFAULT 0,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS proposals (
            proposal_id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            target_path TEXT NOT NULL,
            title TEXT NOT NULL,
            category TEXT NOT NULL,
            severity TEXT NOT NULL,
            rationale TEXT NOT NULL,
            edit_kind TEXT NOT NULL,
            original_snapshot TEXT NOT NULL,
            proposed_content TEXT NOT NULL,
            base_hash TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (run_id) REFERENCES runs(run_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS backups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            proposal_id TEXT NOT NULL,
            path TEXT NOT NULL,
            backup_location TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS applied (
            proposal_id TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            backup_location TEXT NOT NULL,
            new_hash TEXT NOT NULL,
            applied_at INTEGER NOT NULL,
            rolled_back_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_proposals_run_id ON proposals(run_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_proposals_status ON proposals(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_backups_proposal_id ON backups(proposal_id)")
        .execute(pool)
        .await?;

    Ok(())
}
