//! Record storage abstraction for Config Advisor.
//!
//! The [`RecordStore`] trait persists runs, proposals, backup records, and
//! applied records. Proposal status changes go through compare-and-set
//! operations so that concurrent callers cannot both win the same
//! transition.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{AppliedRecord, BackupRecord, Proposal, ProposalStatus, Run};

/// Selection criteria for [`RecordStore::list_proposals`].
#[derive(Debug, Clone, Default)]
pub struct ProposalFilter {
    pub run_id: Option<String>,
    pub status: Option<ProposalStatus>,
}

impl ProposalFilter {
    pub fn matches(&self, p: &Proposal) -> bool {
        self.run_id.as_deref().map_or(true, |r| p.run_id == r)
            && self.status.map_or(true, |s| p.status == s)
    }
}

/// New baseline captured when a stale proposal is rescanned.
#[derive(Debug, Clone)]
pub struct Rebase {
    pub original_snapshot: String,
    pub proposed_content: String,
    pub base_hash: String,
}

/// Abstract storage backend for runs and proposals.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_run`](RecordStore::insert_run) / [`update_run`](RecordStore::update_run) | Persist run rows |
/// | [`insert_proposals`](RecordStore::insert_proposals) | Persist extracted proposals |
/// | [`transition_status`](RecordStore::transition_status) | Compare-and-set a proposal's status |
/// | [`rebase_proposal`](RecordStore::rebase_proposal) | Re-baseline a stale proposal |
/// | [`commit_apply`](RecordStore::commit_apply) | Mark applied and record the result together |
/// | [`insert_backup`](RecordStore::insert_backup) | Record a pre-write backup |
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_run(&self, run: &Run) -> Result<()>;

    /// Overwrite the stored row for `run.run_id` unless it is already
    /// `completed` or `failed`. Returns whether the row was written.
    async fn update_run(&self, run: &Run) -> Result<bool>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Most recent runs first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>>;

    async fn insert_proposals(&self, proposals: &[Proposal]) -> Result<()>;

    async fn get_proposal(&self, proposal_id: &str) -> Result<Option<Proposal>>;

    /// Proposals matching `filter`, oldest first.
    async fn list_proposals(&self, filter: &ProposalFilter) -> Result<Vec<Proposal>>;

    /// Set the proposal's status to `to` if it is currently `from`.
    ///
    /// Returns `false` when the proposal is missing or in another state.
    async fn transition_status(
        &self,
        proposal_id: &str,
        from: ProposalStatus,
        to: ProposalStatus,
    ) -> Result<bool>;

    /// Replace the proposal's baseline and set it to `to`, if it is
    /// currently `from`.
    async fn rebase_proposal(
        &self,
        proposal_id: &str,
        from: ProposalStatus,
        to: ProposalStatus,
        rebase: &Rebase,
    ) -> Result<bool>;

    /// Delete a proposal if it is currently `expected`.
    async fn delete_proposal(&self, proposal_id: &str, expected: ProposalStatus) -> Result<bool>;

    async fn insert_backup(&self, record: &BackupRecord) -> Result<()>;

    async fn list_backups(&self, proposal_id: &str) -> Result<Vec<BackupRecord>>;

    /// Move the proposal from `accepted` to `applied` and store `record`,
    /// as one step. Returns `false` (and stores nothing) when the proposal
    /// is no longer `accepted`.
    async fn commit_apply(&self, record: &AppliedRecord) -> Result<bool>;

    async fn get_applied(&self, proposal_id: &str) -> Result<Option<AppliedRecord>>;

    /// Stamp `rolled_back_at` on an applied record that has not been rolled
    /// back yet.
    async fn mark_rolled_back(&self, proposal_id: &str, at: DateTime<Utc>) -> Result<bool>;
}
