//! SQLite-backed [`RecordStore`] implementation.
//!
//! Compare-and-set operations are single `UPDATE ... WHERE status = ?`
//! statements, checked through `rows_affected`. [`RecordStore::commit_apply`]
//! runs the status change and the applied-record insert in one transaction.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use config_advisor_core::models::{AppliedRecord, BackupRecord, Proposal, ProposalStatus, Run};
use config_advisor_core::store::{ProposalFilter, Rebase, RecordStore};

/// SQLite implementation of [`RecordStore`] over the schema created by
/// [`crate::migrate::apply_schema`].
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_run(row: &SqliteRow) -> Result<Run> {
    let status: String = row.get("status");
    let targets: String = row.get("target_documents");
    let failures: String = row.get("chunk_failures");
    Ok(Run {
        run_id: row.get("run_id"),
        status: status.parse()?,
        started_at: from_millis(row.get("started_at")),
        ended_at: row.get::<Option<i64>, _>("ended_at").map(from_millis),
        target_documents: serde_json::from_str(&targets)
            .context("corrupt runs.target_documents")?,
        chunk_count: row.get::<i64, _>("chunk_count") as usize,
        chunks_succeeded: row.get::<i64, _>("chunks_succeeded") as usize,
        chunks_failed: row.get::<i64, _>("chunks_failed") as usize,
        chunk_failures: serde_json::from_str(&failures).context("corrupt runs.chunk_failures")?,
        proposal_count: row.get::<i64, _>("proposal_count") as usize,
        dropped_count: row.get::<i64, _>("dropped_count") as usize,
        error: row.get("error"),
    })
}

fn row_to_proposal(row: &SqliteRow) -> Result<Proposal> {
    let severity: String = row.get("severity");
    let edit_kind: String = row.get("edit_kind");
    let status: String = row.get("status");
    Ok(Proposal {
        proposal_id: row.get("proposal_id"),
        run_id: row.get("run_id"),
        target_path: row.get("target_path"),
        title: row.get("title"),
        category: row.get("category"),
        severity: severity.parse()?,
        rationale: row.get("rationale"),
        edit_kind: edit_kind.parse()?,
        original_snapshot: row.get("original_snapshot"),
        proposed_content: row.get("proposed_content"),
        base_hash: row.get("base_hash"),
        status: status.parse()?,
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    })
}

fn row_to_backup(row: &SqliteRow) -> BackupRecord {
    BackupRecord {
        proposal_id: row.get("proposal_id"),
        path: row.get("path"),
        backup_location: row.get("backup_location"),
        created_at: from_millis(row.get("created_at")),
    }
}

fn row_to_applied(row: &SqliteRow) -> AppliedRecord {
    AppliedRecord {
        proposal_id: row.get("proposal_id"),
        path: row.get("path"),
        backup_location: row.get("backup_location"),
        new_hash: row.get("new_hash"),
        applied_at: from_millis(row.get("applied_at")),
        rolled_back_at: row.get::<Option<i64>, _>("rolled_back_at").map(from_millis),
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, status, started_at, ended_at, target_documents,
                              chunk_count, chunks_succeeded, chunks_failed, chunk_failures,
                              proposal_count, dropped_count, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.run_id)
        .bind(run.status.as_str())
        .bind(to_millis(run.started_at))
        .bind(run.ended_at.map(to_millis))
        .bind(serde_json::to_string(&run.target_documents)?)
        .bind(run.chunk_count as i64)
        .bind(run.chunks_succeeded as i64)
        .bind(run.chunks_failed as i64)
        .bind(serde_json::to_string(&run.chunk_failures)?)
        .bind(run.proposal_count as i64)
        .bind(run.dropped_count as i64)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_run(&self, run: &Run) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET status = ?, ended_at = ?, target_documents = ?, chunk_count = ?,
                            chunks_succeeded = ?, chunks_failed = ?, chunk_failures = ?,
                            proposal_count = ?, dropped_count = ?, error = ?
            WHERE run_id = ? AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.ended_at.map(to_millis))
        .bind(serde_json::to_string(&run.target_documents)?)
        .bind(run.chunk_count as i64)
        .bind(run.chunks_succeeded as i64)
        .bind(run.chunks_failed as i64)
        .bind(serde_json::to_string(&run.chunk_failures)?)
        .bind(run.proposal_count as i64)
        .bind(run.dropped_count as i64)
        .bind(&run.error)
        .bind(&run.run_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            if self.get_run(&run.run_id).await?.is_none() {
                anyhow::bail!("run {} not found", run.run_id);
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_run).transpose()
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let rows = sqlx::query("SELECT * FROM runs ORDER BY started_at DESC, rowid DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_run).collect()
    }

    async fn insert_proposals(&self, proposals: &[Proposal]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for p in proposals {
            sqlx::query(
                r#"
                INSERT INTO proposals (proposal_id, run_id, target_path, title, category,
                                       severity, rationale, edit_kind, original_snapshot,
                                       proposed_content, base_hash, status, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&p.proposal_id)
            .bind(&p.run_id)
            .bind(&p.target_path)
            .bind(&p.title)
            .bind(&p.category)
            .bind(p.severity.as_str())
            .bind(&p.rationale)
            .bind(p.edit_kind.as_str())
            .bind(&p.original_snapshot)
            .bind(&p.proposed_content)
            .bind(&p.base_hash)
            .bind(p.status.as_str())
            .bind(to_millis(p.created_at))
            .bind(to_millis(p.updated_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_proposal(&self, proposal_id: &str) -> Result<Option<Proposal>> {
        let row = sqlx::query("SELECT * FROM proposals WHERE proposal_id = ?")
            .bind(proposal_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_proposal).transpose()
    }

    async fn list_proposals(&self, filter: &ProposalFilter) -> Result<Vec<Proposal>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM proposals
            WHERE (?1 IS NULL OR run_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(filter.run_id.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_proposal).collect()
    }

    async fn transition_status(
        &self,
        proposal_id: &str,
        from: ProposalStatus,
        to: ProposalStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE proposals SET status = ?, updated_at = ? WHERE proposal_id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(to_millis(Utc::now()))
        .bind(proposal_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn rebase_proposal(
        &self,
        proposal_id: &str,
        from: ProposalStatus,
        to: ProposalStatus,
        rebase: &Rebase,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE proposals
            SET original_snapshot = ?, proposed_content = ?, base_hash = ?, status = ?, updated_at = ?
            WHERE proposal_id = ? AND status = ?
            "#,
        )
        .bind(&rebase.original_snapshot)
        .bind(&rebase.proposed_content)
        .bind(&rebase.base_hash)
        .bind(to.as_str())
        .bind(to_millis(Utc::now()))
        .bind(proposal_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_proposal(&self, proposal_id: &str, expected: ProposalStatus) -> Result<bool> {
        let result = sqlx::query("DELETE FROM proposals WHERE proposal_id = ? AND status = ?")
            .bind(proposal_id)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO backups (proposal_id, path, backup_location, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&record.proposal_id)
        .bind(&record.path)
        .bind(&record.backup_location)
        .bind(to_millis(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_backups(&self, proposal_id: &str) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query("SELECT * FROM backups WHERE proposal_id = ? ORDER BY id ASC")
            .bind(proposal_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_backup).collect())
    }

    async fn commit_apply(&self, record: &AppliedRecord) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE proposals SET status = ?, updated_at = ? WHERE proposal_id = ? AND status = ?",
        )
        .bind(ProposalStatus::Applied.as_str())
        .bind(to_millis(record.applied_at))
        .bind(&record.proposal_id)
        .bind(ProposalStatus::Accepted.as_str())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO applied (proposal_id, path, backup_location, new_hash, applied_at, rolled_back_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(proposal_id) DO UPDATE SET
                path = excluded.path,
                backup_location = excluded.backup_location,
                new_hash = excluded.new_hash,
                applied_at = excluded.applied_at,
                rolled_back_at = excluded.rolled_back_at
            "#,
        )
        .bind(&record.proposal_id)
        .bind(&record.path)
        .bind(&record.backup_location)
        .bind(&record.new_hash)
        .bind(to_millis(record.applied_at))
        .bind(record.rolled_back_at.map(to_millis))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_applied(&self, proposal_id: &str) -> Result<Option<AppliedRecord>> {
        let row = sqlx::query("SELECT * FROM applied WHERE proposal_id = ?")
            .bind(proposal_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_applied))
    }

    async fn mark_rolled_back(&self, proposal_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE applied SET rolled_back_at = ? WHERE proposal_id = ? AND rolled_back_at IS NULL",
        )
        .bind(to_millis(at))
        .bind(proposal_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
