//! In-memory [`RecordStore`] implementation for tests.
//!
//! Uses `Vec`s behind `std::sync::RwLock`. Every compare-and-set runs under a
//! single write guard, so it is atomic with respect to other callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::lifecycle::is_terminal_run;
use crate::models::{AppliedRecord, BackupRecord, Proposal, ProposalStatus, Run};

use super::{ProposalFilter, Rebase, RecordStore};

#[derive(Default)]
struct Tables {
    runs: Vec<Run>,
    proposals: Vec<Proposal>,
    backups: Vec<BackupRecord>,
    applied: Vec<AppliedRecord>,
}

/// In-memory record store.
#[derive(Default)]
pub struct InMemoryRecordStore {
    tables: RwLock<Tables>,
    fail_commits: AtomicBool,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `commit_apply` return an error, as a lost database would.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert_run(&self, run: &Run) -> Result<()> {
        let mut t = self.write();
        if t.runs.iter().any(|r| r.run_id == run.run_id) {
            bail!("run {} already exists", run.run_id);
        }
        t.runs.push(run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &Run) -> Result<bool> {
        let mut t = self.write();
        match t.runs.iter_mut().find(|r| r.run_id == run.run_id) {
            Some(slot) if is_terminal_run(slot.status) => Ok(false),
            Some(slot) => {
                *slot = run.clone();
                Ok(true)
            }
            None => bail!("run {} not found", run.run_id),
        }
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.read().runs.iter().find(|r| r.run_id == run_id).cloned())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let t = self.read();
        let mut runs: Vec<Run> = t.runs.iter().rev().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn insert_proposals(&self, proposals: &[Proposal]) -> Result<()> {
        let mut t = self.write();
        for p in proposals {
            if t.proposals.iter().any(|q| q.proposal_id == p.proposal_id) {
                bail!("proposal {} already exists", p.proposal_id);
            }
        }
        t.proposals.extend(proposals.iter().cloned());
        Ok(())
    }

    async fn get_proposal(&self, proposal_id: &str) -> Result<Option<Proposal>> {
        Ok(self
            .read()
            .proposals
            .iter()
            .find(|p| p.proposal_id == proposal_id)
            .cloned())
    }

    async fn list_proposals(&self, filter: &ProposalFilter) -> Result<Vec<Proposal>> {
        Ok(self
            .read()
            .proposals
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn transition_status(
        &self,
        proposal_id: &str,
        from: ProposalStatus,
        to: ProposalStatus,
    ) -> Result<bool> {
        let mut t = self.write();
        match t
            .proposals
            .iter_mut()
            .find(|p| p.proposal_id == proposal_id && p.status == from)
        {
            Some(p) => {
                p.status = to;
                p.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn rebase_proposal(
        &self,
        proposal_id: &str,
        from: ProposalStatus,
        to: ProposalStatus,
        rebase: &Rebase,
    ) -> Result<bool> {
        let mut t = self.write();
        match t
            .proposals
            .iter_mut()
            .find(|p| p.proposal_id == proposal_id && p.status == from)
        {
            Some(p) => {
                p.original_snapshot = rebase.original_snapshot.clone();
                p.proposed_content = rebase.proposed_content.clone();
                p.base_hash = rebase.base_hash.clone();
                p.status = to;
                p.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_proposal(&self, proposal_id: &str, expected: ProposalStatus) -> Result<bool> {
        let mut t = self.write();
        let before = t.proposals.len();
        t.proposals
            .retain(|p| !(p.proposal_id == proposal_id && p.status == expected));
        Ok(t.proposals.len() != before)
    }

    async fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        self.write().backups.push(record.clone());
        Ok(())
    }

    async fn list_backups(&self, proposal_id: &str) -> Result<Vec<BackupRecord>> {
        Ok(self
            .read()
            .backups
            .iter()
            .filter(|b| b.proposal_id == proposal_id)
            .cloned()
            .collect())
    }

    async fn commit_apply(&self, record: &AppliedRecord) -> Result<bool> {
        if self.fail_commits.load(Ordering::SeqCst) {
            bail!("simulated store failure while recording {}", record.proposal_id);
        }
        let mut guard = self.write();
        let t = &mut *guard;
        let Some(p) = t.proposals.iter_mut().find(|p| {
            p.proposal_id == record.proposal_id && p.status == ProposalStatus::Accepted
        }) else {
            return Ok(false);
        };
        p.status = ProposalStatus::Applied;
        p.updated_at = record.applied_at;
        t.applied.retain(|a| a.proposal_id != record.proposal_id);
        t.applied.push(record.clone());
        Ok(true)
    }

    async fn get_applied(&self, proposal_id: &str) -> Result<Option<AppliedRecord>> {
        Ok(self
            .read()
            .applied
            .iter()
            .find(|a| a.proposal_id == proposal_id)
            .cloned())
    }

    async fn mark_rolled_back(&self, proposal_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut t = self.write();
        match t
            .applied
            .iter_mut()
            .find(|a| a.proposal_id == proposal_id && a.rolled_back_at.is_none())
        {
            Some(a) => {
                a.rolled_back_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EditKind, RunStatus, Severity};

    fn proposal(id: &str, run_id: &str, status: ProposalStatus) -> Proposal {
        let now = Utc::now();
        Proposal {
            proposal_id: id.to_string(),
            run_id: run_id.to_string(),
            target_path: "configuration.yaml".into(),
            title: "t".into(),
            category: "performance".into(),
            severity: Severity::Medium,
            rationale: String::new(),
            edit_kind: EditKind::Excerpt,
            original_snapshot: "a: 1".into(),
            proposed_content: "a: 2".into(),
            base_hash: "h".into(),
            status,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_terminal_run_is_not_overwritten() {
        let store = InMemoryRecordStore::new();
        let mut run = Run::new();
        store.insert_run(&run).await.unwrap();

        run.status = RunStatus::Failed;
        run.error = Some("cancelled".into());
        assert!(store.update_run(&run).await.unwrap());

        let mut late = run.clone();
        late.status = RunStatus::Completed;
        late.error = None;
        assert!(!store.update_run(&late).await.unwrap());
        let stored = store.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);

        let mut missing = Run::new();
        missing.status = RunStatus::Running;
        assert!(store.update_run(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = InMemoryRecordStore::new();
        store
            .insert_proposals(&[proposal("p1", "r1", ProposalStatus::Pending)])
            .await
            .unwrap();

        assert!(store
            .transition_status("p1", ProposalStatus::Pending, ProposalStatus::Accepted)
            .await
            .unwrap());
        // Second caller with the same expectation loses.
        assert!(!store
            .transition_status("p1", ProposalStatus::Pending, ProposalStatus::Rejected)
            .await
            .unwrap());
        let p = store.get_proposal("p1").await.unwrap().unwrap();
        assert_eq!(p.status, ProposalStatus::Accepted);
    }

    #[tokio::test]
    async fn test_list_proposals_filters() {
        let store = InMemoryRecordStore::new();
        store
            .insert_proposals(&[
                proposal("p1", "r1", ProposalStatus::Pending),
                proposal("p2", "r1", ProposalStatus::Rejected),
                proposal("p3", "r2", ProposalStatus::Pending),
            ])
            .await
            .unwrap();

        let by_run = ProposalFilter {
            run_id: Some("r1".into()),
            status: None,
        };
        assert_eq!(store.list_proposals(&by_run).await.unwrap().len(), 2);
        let pending = ProposalFilter {
            run_id: None,
            status: Some(ProposalStatus::Pending),
        };
        let ids: Vec<_> = store
            .list_proposals(&pending)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.proposal_id)
            .collect();
        assert_eq!(ids, vec!["p1", "p3"]);
    }

    #[tokio::test]
    async fn test_commit_apply_requires_accepted() {
        let store = InMemoryRecordStore::new();
        store
            .insert_proposals(&[proposal("p1", "r1", ProposalStatus::Pending)])
            .await
            .unwrap();
        let record = AppliedRecord {
            proposal_id: "p1".into(),
            path: "configuration.yaml".into(),
            backup_location: "b".into(),
            new_hash: "n".into(),
            applied_at: Utc::now(),
            rolled_back_at: None,
        };
        assert!(!store.commit_apply(&record).await.unwrap());
        assert!(store.get_applied("p1").await.unwrap().is_none());

        store
            .transition_status("p1", ProposalStatus::Pending, ProposalStatus::Accepted)
            .await
            .unwrap();
        assert!(store.commit_apply(&record).await.unwrap());
        assert_eq!(
            store.get_proposal("p1").await.unwrap().unwrap().status,
            ProposalStatus::Applied
        );
        assert!(store.mark_rolled_back("p1", Utc::now()).await.unwrap());
        assert!(!store.mark_rolled_back("p1", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_checks_expected_status() {
        let store = InMemoryRecordStore::new();
        store
            .insert_proposals(&[proposal("p1", "r1", ProposalStatus::Rejected)])
            .await
            .unwrap();
        assert!(!store.delete_proposal("p1", ProposalStatus::Pending).await.unwrap());
        assert!(store.delete_proposal("p1", ProposalStatus::Rejected).await.unwrap());
        assert!(store.get_proposal("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_runs_newest_first() {
        let store = InMemoryRecordStore::new();
        let mut older = Run::new();
        older.started_at = Utc::now() - chrono::Duration::seconds(10);
        let newer = Run::new();
        store.insert_run(&older).await.unwrap();
        store.insert_run(&newer).await.unwrap();
        let runs = store.list_runs(10).await.unwrap();
        assert_eq!(runs[0].run_id, newer.run_id);
        assert_eq!(store.list_runs(1).await.unwrap().len(), 1);
    }
}
