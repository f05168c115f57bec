//! Safe-apply engine.
//!
//! Writes an accepted proposal to its document. For each apply, under a
//! per-path lock:
//!
//! 1. load the proposal and require `accepted`
//! 2. re-read the document and hash it
//! 3. if the hash differs from the proposal's `base_hash`, mark it `stale`
//!    and stop
//! 4. build the new content and validate its structure
//! 5. back up the current content and record the backup
//! 6. write the new content atomically
//! 7. mark the proposal `applied` together with its [`AppliedRecord`]
//!
//! A failure at any step leaves the document as it was. If step 7 fails
//! after the write, the previous content is written back, so a document is
//! never changed without an `applied` record pointing at its backup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use thiserror::Error;

use config_advisor_core::document::DocumentStore;
use config_advisor_core::lifecycle::{next_proposal_status, ProposalAction};
use config_advisor_core::models::{AppliedRecord, BackupRecord, Proposal, ProposalStatus};
use config_advisor_core::store::RecordStore;
use config_advisor_core::structure::validate_replacement;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("proposal {0} not found")]
    NotFound(String),

    #[error("proposal {id} is {status}, not accepted")]
    NotAccepted { id: String, status: ProposalStatus },

    #[error("proposal {0} has no applied change to roll back")]
    NotApplied(String),

    #[error("{path} changed since proposal {id} was made")]
    Drifted { id: String, path: String },

    #[error("proposed content for {path} is invalid: {reason}")]
    InvalidStructure { path: String, reason: String },

    #[error("cannot read {path}: {message}")]
    Unreadable { path: String, message: String },

    #[error("backup of {path} failed: {message}")]
    BackupFailed { path: String, message: String },

    #[error("write to {path} failed: {message}")]
    WriteFailed { path: String, message: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ApplyError {
    /// Stable machine-readable code, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ApplyError::NotFound(_) => "not_found",
            ApplyError::NotAccepted { .. } => "not_accepted",
            ApplyError::NotApplied(_) => "not_applied",
            ApplyError::Drifted { .. } => "drifted",
            ApplyError::InvalidStructure { .. } => "invalid_structure",
            ApplyError::Unreadable { .. } => "unreadable",
            ApplyError::BackupFailed { .. } => "backup_failed",
            ApplyError::WriteFailed { .. } => "write_failed",
            ApplyError::Store(_) => "store",
        }
    }
}

struct PathGuard<'a> {
    locks: &'a Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    path: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.path)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.path);
        }
    }
}

pub struct ApplyEngine {
    documents: Arc<dyn DocumentStore>,
    records: Arc<dyn RecordStore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ApplyEngine {
    pub fn new(documents: Arc<dyn DocumentStore>, records: Arc<dyn RecordStore>) -> Self {
        Self {
            documents,
            records,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Serialize writers on `path`. The map entry goes away with the last
    /// holder or waiter.
    async fn lock_path(&self, path: &str) -> PathGuard<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_string())
            .or_default()
            .clone();
        PathGuard {
            locks: &self.locks,
            path: path.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn load_accepted(&self, proposal_id: &str) -> Result<Proposal, ApplyError> {
        let proposal = self
            .records
            .get_proposal(proposal_id)
            .await?
            .ok_or_else(|| ApplyError::NotFound(proposal_id.to_string()))?;
        if proposal.status != ProposalStatus::Accepted {
            return Err(ApplyError::NotAccepted {
                id: proposal.proposal_id,
                status: proposal.status,
            });
        }
        Ok(proposal)
    }

    /// Apply an accepted proposal to its document.
    pub async fn apply(&self, proposal_id: &str) -> Result<AppliedRecord, ApplyError> {
        let path = self.load_accepted(proposal_id).await?.target_path;
        let _guard = self.lock_path(&path).await;

        // Another apply on the same path may have finished while we waited.
        let proposal = self.load_accepted(proposal_id).await?;

        let current = self
            .documents
            .read(&path)
            .await
            .map_err(|e| ApplyError::Unreadable {
                path: path.clone(),
                message: format!("{:#}", e),
            })?;

        if current.content_hash != proposal.base_hash {
            let stale = next_proposal_status(ProposalStatus::Accepted, ProposalAction::Drift)
                .map_err(|e| ApplyError::Store(e.into()))?;
            self.records
                .transition_status(proposal_id, ProposalStatus::Accepted, stale)
                .await?;
            tracing::warn!(proposal_id, path = %path, "document drifted; proposal marked stale");
            return Err(ApplyError::Drifted {
                id: proposal_id.to_string(),
                path,
            });
        }

        let new_content =
            proposal
                .render_against(&current.content)
                .ok_or_else(|| ApplyError::InvalidStructure {
                    path: path.clone(),
                    reason: "excerpt does not occur exactly once".to_string(),
                })?;
        validate_replacement(&current.content, &new_content).map_err(|e| {
            ApplyError::InvalidStructure {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;

        let backup_location = self
            .documents
            .backup(&path, &current.content)
            .await
            .map_err(|e| ApplyError::BackupFailed {
                path: path.clone(),
                message: format!("{:#}", e),
            })?;
        self.records
            .insert_backup(&BackupRecord {
                proposal_id: proposal_id.to_string(),
                path: path.clone(),
                backup_location: backup_location.clone(),
                created_at: Utc::now(),
            })
            .await
            .map_err(|e| ApplyError::BackupFailed {
                path: path.clone(),
                message: format!("{:#}", e),
            })?;

        let new_hash = self
            .documents
            .write_atomic(&path, &new_content)
            .await
            .map_err(|e| ApplyError::WriteFailed {
                path: path.clone(),
                message: format!("{:#}", e),
            })?;

        let record = AppliedRecord {
            proposal_id: proposal_id.to_string(),
            path: path.clone(),
            backup_location: backup_location.clone(),
            new_hash,
            applied_at: Utc::now(),
            rolled_back_at: None,
        };

        let outcome = match self.records.commit_apply(&record).await {
            Ok(true) => {
                tracing::info!(
                    proposal_id,
                    path = %path,
                    backup = %backup_location,
                    "proposal applied"
                );
                return Ok(record);
            }
            Ok(false) => {
                let status = self
                    .records
                    .get_proposal(proposal_id)
                    .await?
                    .map(|p| p.status)
                    .unwrap_or(ProposalStatus::Rejected);
                ApplyError::NotAccepted {
                    id: proposal_id.to_string(),
                    status,
                }
            }
            Err(e) => ApplyError::Store(e),
        };

        self.restore(&path, &current.content, &backup_location).await;
        Err(outcome)
    }

    async fn restore(&self, path: &str, previous: &str, backup_location: &str) {
        match self.documents.write_atomic(path, previous).await {
            Ok(_) => tracing::warn!(path, "apply not recorded; previous content restored"),
            Err(e) => tracing::error!(
                path,
                backup = backup_location,
                error = %format!("{:#}", e),
                "apply not recorded and restore failed; recover from backup"
            ),
        }
    }

    /// Put back the content saved before `proposal_id` was applied.
    ///
    /// Refuses when the document no longer has the content the apply wrote.
    /// The content being replaced is itself backed up first.
    pub async fn rollback(&self, proposal_id: &str) -> Result<AppliedRecord, ApplyError> {
        let applied = self
            .records
            .get_applied(proposal_id)
            .await?
            .filter(|a| a.rolled_back_at.is_none())
            .ok_or_else(|| ApplyError::NotApplied(proposal_id.to_string()))?;
        let path = applied.path.clone();
        let _guard = self.lock_path(&path).await;

        let current = self
            .documents
            .read(&path)
            .await
            .map_err(|e| ApplyError::Unreadable {
                path: path.clone(),
                message: format!("{:#}", e),
            })?;
        if current.content_hash != applied.new_hash {
            return Err(ApplyError::Drifted {
                id: proposal_id.to_string(),
                path,
            });
        }

        let previous = self
            .documents
            .read_backup(&applied.backup_location)
            .await
            .map_err(|e| ApplyError::Unreadable {
                path: applied.backup_location.clone(),
                message: format!("{:#}", e),
            })?;

        let location = self
            .documents
            .backup(&path, &current.content)
            .await
            .map_err(|e| ApplyError::BackupFailed {
                path: path.clone(),
                message: format!("{:#}", e),
            })?;
        self.records
            .insert_backup(&BackupRecord {
                proposal_id: proposal_id.to_string(),
                path: path.clone(),
                backup_location: location.clone(),
                created_at: Utc::now(),
            })
            .await
            .map_err(|e| ApplyError::BackupFailed {
                path: path.clone(),
                message: format!("{:#}", e),
            })?;

        self.documents
            .write_atomic(&path, &previous)
            .await
            .map_err(|e| ApplyError::WriteFailed {
                path: path.clone(),
                message: format!("{:#}", e),
            })?;

        let at = Utc::now();
        match self.records.mark_rolled_back(proposal_id, at).await {
            Ok(true) => {}
            Ok(false) => {
                self.restore(&path, &current.content, &location).await;
                return Err(ApplyError::NotApplied(proposal_id.to_string()));
            }
            Err(e) => {
                self.restore(&path, &current.content, &location).await;
                return Err(ApplyError::Store(e));
            }
        }

        tracing::info!(proposal_id, path = %path, "apply rolled back");
        Ok(AppliedRecord {
            rolled_back_at: Some(at),
            ..applied
        })
    }
}
