//! Run and proposal lifecycle.
//!
//! [`Advisor`] is the entry point used by the CLI and the HTTP server. It
//! owns the three collaborators (documents, records, analysis backend) and
//! the [`ApplyEngine`].
//!
//! # Runs
//!
//! A run resolves its documents, reads them once as the baseline, chunks
//! them, and hands the chunks to a coordinator task. Workers analyze chunks
//! concurrently under a semaphore, each call bounded by a timeout. Only the
//! coordinator touches the run row: it counts finished chunks, stores the
//! proposals each chunk yields, and marks the run `completed` once every
//! chunk has succeeded or failed. A failed chunk never fails the run.
//!
//! # Proposals
//!
//! Status changes are compare-and-set against the status that was read, so
//! two callers cannot both move the same proposal.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use config_advisor_core::chunk::{chunk_documents, render_chunk, SizeBudget};
use config_advisor_core::document::{DocumentFilter, DocumentStore};
use config_advisor_core::extract::{extract, Extraction};
use config_advisor_core::lifecycle::{
    check_discard, check_run_transition, next_proposal_status, ProposalAction, TransitionError,
};
use config_advisor_core::models::{
    replace_unique, AppliedRecord, BackupRecord, Chunk, ChunkFailure, Document, EditKind,
    Proposal, ProposalStatus, Run, RunStatus,
};
use config_advisor_core::store::{ProposalFilter, Rebase, RecordStore};
use config_advisor_core::structure::validate_replacement;

use crate::analysis::{build_prompt, AnalysisBackend, AnalysisRequest, AnalysisTask};
use crate::apply::{ApplyEngine, ApplyError};
use crate::config::AnalysisConfig;
use crate::progress::{NoProgress, ScanProgressEvent, ScanProgressReporter};

/// Error recorded on a run that was cancelled.
pub const CANCELLED: &str = "cancelled";

#[derive(Debug, Clone)]
pub struct AdvisorOptions {
    pub budget: SizeBudget,
    pub concurrency: usize,
    pub chunk_timeout: Duration,
    pub task: AnalysisTask,
}

impl Default for AdvisorOptions {
    fn default() -> Self {
        Self {
            budget: SizeBudget::new(4000),
            concurrency: 3,
            chunk_timeout: Duration::from_secs(60),
            task: AnalysisTask::Optimization,
        }
    }
}

impl AdvisorOptions {
    pub fn from_config(config: &AnalysisConfig) -> anyhow::Result<Self> {
        Ok(Self {
            budget: config.budget(),
            concurrency: config.concurrency.max(1),
            chunk_timeout: config.chunk_timeout(),
            task: AnalysisTask::parse(&config.task)?,
        })
    }
}

/// A run could not get as far as dispatching chunks.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no documents resolved for run {run_id}")]
    NoDocuments { run_id: String },

    #[error("run {run_id}: cannot resolve documents: {message}")]
    Resolve { run_id: String, message: String },

    #[error("run {run_id}: cannot read {path}: {message}")]
    Unreadable {
        run_id: String,
        path: String,
        message: String,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("proposal {0} not found")]
    ProposalNotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("action '{0}' cannot be requested directly")]
    UnsupportedAction(ProposalAction),

    #[error("cannot rescan proposal {id}: {reason}")]
    Rescan { id: String, reason: String },

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl AdvisorError {
    /// Stable machine-readable code, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AdvisorError::RunNotFound(_) | AdvisorError::ProposalNotFound(_) => "not_found",
            AdvisorError::Transition(_) => "invalid_transition",
            AdvisorError::UnsupportedAction(_) => "invalid_action",
            AdvisorError::Rescan { .. } => "rescan_failed",
            AdvisorError::Run(RunError::NoDocuments { .. }) => "no_documents",
            AdvisorError::Run(RunError::Resolve { .. }) => "invalid_documents",
            AdvisorError::Run(RunError::Unreadable { .. }) => "unreadable",
            AdvisorError::Run(RunError::Store(_)) => "store",
            AdvisorError::Apply(e) => e.code(),
            AdvisorError::Store(_) => "store",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkFailure {
    pub proposal_id: String,
    pub code: String,
    pub error: String,
}

/// Outcome of [`Advisor::bulk_transition`]. `accepted_count` counts items
/// whose transition went through, whatever the action.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkResult {
    pub accepted_count: usize,
    pub failed_count: usize,
    pub failures: Vec<BulkFailure>,
}

struct ActiveRun {
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

struct Inner {
    documents: Arc<dyn DocumentStore>,
    records: Arc<dyn RecordStore>,
    backend: Arc<dyn AnalysisBackend>,
    engine: ApplyEngine,
    options: AdvisorOptions,
    active: Mutex<HashMap<String, ActiveRun>>,
}

/// A run that has been planned and is ready to dispatch.
struct Planned {
    run: Run,
    documents: Vec<Document>,
    chunks: Vec<Chunk>,
    cancel: watch::Receiver<bool>,
    done: watch::Sender<bool>,
}

struct ChunkOutcome {
    chunk_id: String,
    index: usize,
    result: Result<Vec<Extraction>, String>,
}

#[derive(Clone)]
pub struct Advisor {
    inner: Arc<Inner>,
}

impl Advisor {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        records: Arc<dyn RecordStore>,
        backend: Arc<dyn AnalysisBackend>,
        options: AdvisorOptions,
    ) -> Self {
        let engine = ApplyEngine::new(documents.clone(), records.clone());
        Self {
            inner: Arc::new(Inner {
                documents,
                records,
                backend,
                engine,
                options,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.documents
    }

    // ============ Runs ============

    /// Plan a run and analyze it in the background. Returns the run id as
    /// soon as chunks are dispatched.
    pub async fn start_run(&self, filter: &DocumentFilter) -> Result<String, AdvisorError> {
        let planned = self.plan(filter).await?;
        let run_id = planned.run.run_id.clone();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            Inner::coordinate(inner, planned, Arc::new(NoProgress)).await;
        });
        Ok(run_id)
    }

    /// Plan a run and analyze it to the end.
    pub async fn run_to_completion(
        &self,
        filter: &DocumentFilter,
        progress: Arc<dyn ScanProgressReporter>,
    ) -> Result<Run, AdvisorError> {
        let planned = self.plan(filter).await?;
        Ok(Inner::coordinate(self.inner.clone(), planned, progress).await)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run, AdvisorError> {
        self.inner
            .records
            .get_run(run_id)
            .await?
            .ok_or_else(|| AdvisorError::RunNotFound(run_id.to_string()))
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, AdvisorError> {
        Ok(self.inner.records.list_runs(limit).await?)
    }

    /// Stop dispatching a run's chunks and mark it failed.
    ///
    /// Proposals from chunks that already finished are kept. Runs that are
    /// not active in this process (e.g. left `running` by a crash) are
    /// marked failed directly. If another process is still running one, its
    /// later updates are refused once the row is terminal.
    pub async fn cancel_run(&self, run_id: &str) -> Result<Run, AdvisorError> {
        let run = self.get_run(run_id).await?;
        check_run_transition(run.status, RunStatus::Failed)?;

        let done = {
            let active = self.inner.active.lock().unwrap_or_else(PoisonError::into_inner);
            active.get(run_id).map(|a| {
                let _ = a.cancel.send(true);
                a.done.clone()
            })
        };

        match done {
            Some(mut done) => {
                let _ = done.wait_for(|finished| *finished).await;
            }
            None => {
                let mut run = run;
                run.status = RunStatus::Failed;
                run.ended_at = Some(Utc::now());
                run.error = Some(CANCELLED.to_string());
                if self.inner.records.update_run(&run).await? {
                    tracing::info!(run_id = %run.run_id, "inactive run marked cancelled");
                }
            }
        }

        self.get_run(run_id).await
    }

    async fn plan(&self, filter: &DocumentFilter) -> Result<Planned, RunError> {
        let inner = &self.inner;
        let mut run = Run::new();
        inner.records.insert_run(&run).await?;
        tracing::info!(run_id = %run.run_id, "run created");

        let paths = match inner.documents.list_documents(filter).await {
            Ok(paths) => paths,
            Err(e) => {
                let message = format!("{:#}", e);
                inner.fail_run(&mut run, &message).await?;
                return Err(RunError::Resolve {
                    run_id: run.run_id,
                    message,
                });
            }
        };
        if paths.is_empty() {
            inner.fail_run(&mut run, "no documents resolved").await?;
            return Err(RunError::NoDocuments { run_id: run.run_id });
        }

        let mut documents = Vec::with_capacity(paths.len());
        for path in &paths {
            match inner.documents.read(path).await {
                Ok(doc) => documents.push(doc),
                Err(e) => {
                    let message = format!("{:#}", e);
                    inner
                        .fail_run(&mut run, &format!("cannot read {}: {}", path, message))
                        .await?;
                    return Err(RunError::Unreadable {
                        run_id: run.run_id,
                        path: path.clone(),
                        message,
                    });
                }
            }
        }

        let chunks = chunk_documents(&documents, inner.options.budget);
        check_run_transition(run.status, RunStatus::Running).map_err(anyhow::Error::from)?;
        run.status = RunStatus::Running;
        run.target_documents = paths;
        run.chunk_count = chunks.len();
        inner.records.update_run(&run).await?;
        tracing::info!(
            run_id = %run.run_id,
            documents = documents.len(),
            chunks = chunks.len(),
            "run started"
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                run.run_id.clone(),
                ActiveRun {
                    cancel: cancel_tx,
                    done: done_rx,
                },
            );

        Ok(Planned {
            run,
            documents,
            chunks,
            cancel: cancel_rx,
            done: done_tx,
        })
    }

    // ============ Proposals ============

    pub async fn list_proposals(&self, filter: &ProposalFilter) -> Result<Vec<Proposal>, AdvisorError> {
        Ok(self.inner.records.list_proposals(filter).await?)
    }

    pub async fn get_proposal(&self, proposal_id: &str) -> Result<Proposal, AdvisorError> {
        self.inner
            .records
            .get_proposal(proposal_id)
            .await?
            .ok_or_else(|| AdvisorError::ProposalNotFound(proposal_id.to_string()))
    }

    pub async fn backups(&self, proposal_id: &str) -> Result<Vec<BackupRecord>, AdvisorError> {
        Ok(self.inner.records.list_backups(proposal_id).await?)
    }

    pub async fn applied(&self, proposal_id: &str) -> Result<Option<AppliedRecord>, AdvisorError> {
        Ok(self.inner.records.get_applied(proposal_id).await?)
    }

    /// Accept, reject, or rescan a proposal.
    pub async fn transition_proposal(
        &self,
        proposal_id: &str,
        action: ProposalAction,
    ) -> Result<Proposal, AdvisorError> {
        match action {
            ProposalAction::Accept | ProposalAction::Reject => {
                self.set_status(proposal_id, action).await
            }
            ProposalAction::Rescan => self.rescan(proposal_id).await,
            ProposalAction::Apply | ProposalAction::Drift => {
                Err(AdvisorError::UnsupportedAction(action))
            }
        }
    }

    async fn set_status(
        &self,
        proposal_id: &str,
        action: ProposalAction,
    ) -> Result<Proposal, AdvisorError> {
        // Retry while the status keeps changing under us; each retry
        // re-checks the state machine against the fresh status.
        for _ in 0..5 {
            let current = self.get_proposal(proposal_id).await?;
            let to = next_proposal_status(current.status, action)?;
            if self
                .inner
                .records
                .transition_status(proposal_id, current.status, to)
                .await?
            {
                tracing::info!(proposal_id, from = %current.status, to = %to, "proposal transitioned");
                return self.get_proposal(proposal_id).await;
            }
        }
        let current = self.get_proposal(proposal_id).await?;
        Err(TransitionError::Proposal {
            from: current.status,
            action,
        }
        .into())
    }

    /// Re-baseline a stale excerpt proposal against the document as it is
    /// now, returning it to `pending`.
    async fn rescan(&self, proposal_id: &str) -> Result<Proposal, AdvisorError> {
        let proposal = self.get_proposal(proposal_id).await?;
        let to = next_proposal_status(proposal.status, ProposalAction::Rescan)?;
        let fail = |reason: String| AdvisorError::Rescan {
            id: proposal_id.to_string(),
            reason,
        };

        if proposal.edit_kind != EditKind::Excerpt {
            return Err(fail(
                "full-document replacements cannot be rescanned; start a new run".to_string(),
            ));
        }

        let doc = self
            .inner
            .documents
            .read(&proposal.target_path)
            .await
            .map_err(|e| fail(format!("{:#}", e)))?;
        let rendered = replace_unique(
            &doc.content,
            &proposal.original_snapshot,
            &proposal.proposed_content,
        )
        .ok_or_else(|| fail("excerpt no longer occurs exactly once".to_string()))?;
        validate_replacement(&doc.content, &rendered).map_err(|e| fail(e.to_string()))?;

        let rebase = Rebase {
            original_snapshot: proposal.original_snapshot.clone(),
            proposed_content: proposal.proposed_content.clone(),
            base_hash: doc.content_hash,
        };
        if !self
            .inner
            .records
            .rebase_proposal(proposal_id, proposal.status, to, &rebase)
            .await?
        {
            let current = self.get_proposal(proposal_id).await?;
            return Err(TransitionError::Proposal {
                from: current.status,
                action: ProposalAction::Rescan,
            }
            .into());
        }

        tracing::info!(proposal_id, path = %proposal.target_path, "stale proposal rescanned");
        self.get_proposal(proposal_id).await
    }

    /// Apply `action` to each proposal independently. Successes are kept
    /// when other items fail.
    pub async fn bulk_transition(&self, proposal_ids: &[String], action: ProposalAction) -> BulkResult {
        let mut result = BulkResult::default();
        for id in proposal_ids {
            match self.transition_proposal(id, action).await {
                Ok(_) => result.accepted_count += 1,
                Err(e) => {
                    result.failed_count += 1;
                    result.failures.push(BulkFailure {
                        proposal_id: id.clone(),
                        code: e.code().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        result
    }

    pub async fn apply_proposal(&self, proposal_id: &str) -> Result<AppliedRecord, AdvisorError> {
        Ok(self.inner.engine.apply(proposal_id).await?)
    }

    pub async fn rollback_proposal(&self, proposal_id: &str) -> Result<AppliedRecord, AdvisorError> {
        Ok(self.inner.engine.rollback(proposal_id).await?)
    }

    /// Mark accepted proposals whose document changed since their run as
    /// stale. Returns the ids that were marked.
    pub async fn revalidate(&self) -> Result<Vec<String>, AdvisorError> {
        let accepted = self
            .inner
            .records
            .list_proposals(&ProposalFilter {
                run_id: None,
                status: Some(ProposalStatus::Accepted),
            })
            .await?;
        let stale = next_proposal_status(ProposalStatus::Accepted, ProposalAction::Drift)?;

        let mut hashes: HashMap<String, Option<String>> = HashMap::new();
        let mut marked = Vec::new();
        for proposal in accepted {
            if !hashes.contains_key(&proposal.target_path) {
                let hash = match self.inner.documents.read(&proposal.target_path).await {
                    Ok(doc) => Some(doc.content_hash),
                    Err(e) => {
                        tracing::warn!(
                            path = %proposal.target_path,
                            error = %format!("{:#}", e),
                            "cannot read document during revalidation"
                        );
                        None
                    }
                };
                hashes.insert(proposal.target_path.clone(), hash);
            }
            let Some(Some(hash)) = hashes.get(&proposal.target_path) else {
                continue;
            };
            if *hash != proposal.base_hash
                && self
                    .inner
                    .records
                    .transition_status(&proposal.proposal_id, ProposalStatus::Accepted, stale)
                    .await?
            {
                tracing::info!(
                    proposal_id = %proposal.proposal_id,
                    path = %proposal.target_path,
                    "document drifted; proposal marked stale"
                );
                marked.push(proposal.proposal_id);
            }
        }
        Ok(marked)
    }

    /// Delete a proposal that is neither accepted nor applied.
    pub async fn discard_proposal(&self, proposal_id: &str) -> Result<(), AdvisorError> {
        let proposal = self.get_proposal(proposal_id).await?;
        check_discard(proposal.status)?;
        if !self
            .inner
            .records
            .delete_proposal(proposal_id, proposal.status)
            .await?
        {
            let current = self.get_proposal(proposal_id).await?;
            return Err(TransitionError::Discard(current.status).into());
        }
        tracing::info!(proposal_id, "proposal discarded");
        Ok(())
    }
}

impl Inner {
    async fn fail_run(&self, run: &mut Run, error: &str) -> anyhow::Result<()> {
        check_run_transition(run.status, RunStatus::Failed)?;
        run.status = RunStatus::Failed;
        run.ended_at = Some(Utc::now());
        run.error = Some(error.to_string());
        self.records.update_run(run).await?;
        tracing::warn!(run_id = %run.run_id, error, "run failed");
        Ok(())
    }

    async fn coordinate(
        inner: Arc<Inner>,
        planned: Planned,
        progress: Arc<dyn ScanProgressReporter>,
    ) -> Run {
        let Planned {
            mut run,
            documents,
            chunks,
            mut cancel,
            done,
        } = planned;
        let total = chunks.len() as u64;
        progress.report(ScanProgressEvent::Planned {
            run_id: run.run_id.clone(),
            documents: documents.len() as u64,
            chunks: total,
        });

        let baseline: Arc<HashMap<String, Document>> = Arc::new(
            documents
                .iter()
                .map(|d| (d.path.clone(), d.clone()))
                .collect(),
        );
        let documents = Arc::new(documents);
        let semaphore = Arc::new(Semaphore::new(inner.options.concurrency.max(1)));
        let mut outstanding: BTreeMap<usize, String> = BTreeMap::new();
        let mut workers = JoinSet::new();

        for chunk in chunks {
            outstanding.insert(chunk.index, chunk.chunk_id.clone());
            let inner = inner.clone();
            let semaphore = semaphore.clone();
            let documents = documents.clone();
            let baseline = baseline.clone();
            let run_id = run.run_id.clone();
            workers.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => inner.analyze_chunk(&run_id, &chunk, &documents, &baseline).await,
                    Err(_) => Err(CANCELLED.to_string()),
                };
                ChunkOutcome {
                    chunk_id: chunk.chunk_id,
                    index: chunk.index,
                    result,
                }
            });
        }

        let mut cancelled = false;
        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(Ok(outcome)) => {
                        outstanding.remove(&outcome.index);
                        let ok = inner.record_outcome(&mut run, outcome).await;
                        progress.report(ScanProgressEvent::ChunkFinished {
                            run_id: run.run_id.clone(),
                            n: run.chunks_finished() as u64,
                            total,
                            ok,
                        });
                    }
                    Some(Err(e)) => {
                        tracing::error!(run_id = %run.run_id, error = %e, "analysis worker aborted");
                    }
                },
                Ok(()) = cancel.changed() => {
                    if *cancel.borrow() {
                        workers.abort_all();
                        cancelled = true;
                        break;
                    }
                }
            }
        }

        if cancelled {
            // Chunks that finished before the abort still report; aborted ones
            // come back as cancelled join errors.
            while let Some(joined) = workers.join_next().await {
                if let Ok(outcome) = joined {
                    outstanding.remove(&outcome.index);
                    let ok = inner.record_outcome(&mut run, outcome).await;
                    progress.report(ScanProgressEvent::ChunkFinished {
                        run_id: run.run_id.clone(),
                        n: run.chunks_finished() as u64,
                        total,
                        ok,
                    });
                }
            }
        } else {
            // Workers that died without reporting still count as finished.
            for (index, chunk_id) in std::mem::take(&mut outstanding) {
                let outcome = ChunkOutcome {
                    chunk_id,
                    index,
                    result: Err("analysis worker aborted".to_string()),
                };
                inner.record_outcome(&mut run, outcome).await;
            }
        }

        let (status, error) = if cancelled {
            (RunStatus::Failed, Some(CANCELLED.to_string()))
        } else {
            (RunStatus::Completed, None)
        };
        if let Err(e) = check_run_transition(run.status, status) {
            tracing::error!(run_id = %run.run_id, error = %e, "unexpected run state");
        }
        run.status = status;
        run.error = error;
        run.ended_at = Some(Utc::now());
        match inner.records.update_run(&run).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(run_id = %run.run_id, "run already ended elsewhere; final state not recorded");
            }
            Err(e) => {
                tracing::error!(run_id = %run.run_id, error = %format!("{:#}", e), "failed to record run end");
            }
        }
        tracing::info!(
            run_id = %run.run_id,
            status = %run.status,
            chunks_succeeded = run.chunks_succeeded,
            chunks_failed = run.chunks_failed,
            proposals = run.proposal_count,
            dropped = run.dropped_count,
            "run finished"
        );

        inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&run.run_id);
        let _ = done.send(true);
        run
    }

    async fn analyze_chunk(
        &self,
        run_id: &str,
        chunk: &Chunk,
        documents: &[Document],
        baseline: &HashMap<String, Document>,
    ) -> Result<Vec<Extraction>, String> {
        let request = AnalysisRequest {
            run_id: run_id.to_string(),
            chunk_index: chunk.index,
            chunk_id: chunk.chunk_id.clone(),
            prompt: build_prompt(&render_chunk(chunk, documents), self.options.task),
        };
        let timeout = self.options.chunk_timeout;
        let output = match tokio::time::timeout(timeout, self.backend.analyze(&request)).await {
            Err(_) => return Err(format!("timed out after {:?}", timeout)),
            Ok(Err(e)) => return Err(format!("{:#}", e)),
            Ok(Ok(output)) => output,
        };
        extract(chunk, run_id, &output, baseline).map_err(|e| e.to_string())
    }

    /// Fold one chunk's outcome into `run` and persist it. Returns whether
    /// the chunk succeeded.
    async fn record_outcome(&self, run: &mut Run, outcome: ChunkOutcome) -> bool {
        let result = match outcome.result {
            Ok(extractions) => {
                let mut proposals = Vec::new();
                let mut dropped = 0;
                for extraction in extractions {
                    let kind = extraction.kind();
                    match extraction {
                        Extraction::Proposal(p) => proposals.push(p),
                        Extraction::Unattributable { path, title } => {
                            dropped += 1;
                            tracing::warn!(
                                run_id = %run.run_id,
                                chunk = outcome.index,
                                kind,
                                path = path.as_deref().unwrap_or("-"),
                                title = %title,
                                "dropped edit block"
                            );
                        }
                        Extraction::InvalidStructure {
                            path,
                            title,
                            reason,
                        } => {
                            dropped += 1;
                            tracing::warn!(
                                run_id = %run.run_id,
                                chunk = outcome.index,
                                kind,
                                path = path.as_deref().unwrap_or("-"),
                                title = %title,
                                reason = %reason,
                                "dropped edit block"
                            );
                        }
                    }
                }
                match self.records.insert_proposals(&proposals).await {
                    Ok(()) => {
                        run.proposal_count += proposals.len();
                        run.dropped_count += dropped;
                        Ok(())
                    }
                    Err(e) => Err(format!("failed to store proposals: {:#}", e)),
                }
            }
            Err(error) => Err(error),
        };

        let ok = match result {
            Ok(()) => {
                run.chunks_succeeded += 1;
                true
            }
            Err(error) => {
                tracing::warn!(
                    run_id = %run.run_id,
                    chunk = outcome.index,
                    chunk_id = %outcome.chunk_id,
                    error = %error,
                    "chunk failed"
                );
                run.chunks_failed += 1;
                run.chunk_failures.push(ChunkFailure {
                    chunk_id: outcome.chunk_id,
                    index: outcome.index,
                    error,
                });
                false
            }
        };

        if let Err(e) = self.records.update_run(run).await {
            tracing::error!(run_id = %run.run_id, error = %format!("{:#}", e), "failed to update run");
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use config_advisor_core::document::MemoryDocumentStore;
    use config_advisor_core::store::memory::InMemoryRecordStore;

    const CONFIG: &str = "logger:\n  default: info\nrecorder:\n  purge_keep_days: 30\n";
    const LIGHTS: &str = "light:\n  - platform: group\n    name: Kitchen\n";

    /// Answers by chunk index; chunks without an answer get `default`.
    struct ScriptedBackend {
        answers: HashMap<usize, Result<String, String>>,
        default: Result<String, String>,
        delay: Option<Duration>,
    }

    impl ScriptedBackend {
        fn always(answer: &str) -> Self {
            Self {
                answers: HashMap::new(),
                default: Ok(answer.to_string()),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl AnalysisBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn analyze(&self, request: &AnalysisRequest) -> anyhow::Result<String> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let answer = self.answers.get(&request.chunk_index).unwrap_or(&self.default);
            answer.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn edit(path: &str, before: &str, after: &str) -> serde_json::Value {
        serde_json::json!({
            "file_path": path,
            "title": format!("Change {}", before),
            "impact": "high",
            "category": "performance",
            "before": before,
            "after": after,
        })
    }

    fn answer(edits: &[serde_json::Value]) -> String {
        format!("```json\n{}\n```", serde_json::Value::Array(edits.to_vec()))
    }

    struct Fixture {
        docs: Arc<MemoryDocumentStore>,
        records: Arc<InMemoryRecordStore>,
        advisor: Advisor,
    }

    fn fixture_with(backend: ScriptedBackend, options: AdvisorOptions) -> Fixture {
        let docs = Arc::new(MemoryDocumentStore::with_documents([
            ("configuration.yaml", CONFIG),
            ("lights.yaml", LIGHTS),
        ]));
        let records = Arc::new(InMemoryRecordStore::new());
        let advisor = Advisor::new(docs.clone(), records.clone(), Arc::new(backend), options);
        Fixture {
            docs,
            records,
            advisor,
        }
    }

    fn fixture(backend: ScriptedBackend) -> Fixture {
        fixture_with(backend, AdvisorOptions::default())
    }

    async fn scan(f: &Fixture) -> Run {
        f.advisor
            .run_to_completion(&DocumentFilter::all(), Arc::new(NoProgress))
            .await
            .unwrap()
    }

    async fn proposals(f: &Fixture, run: &Run) -> Vec<Proposal> {
        f.advisor
            .list_proposals(&ProposalFilter {
                run_id: Some(run.run_id.clone()),
                status: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_produces_pending_proposals() {
        let f = fixture(ScriptedBackend::always(&answer(&[
            edit("configuration.yaml", "default: info", "default: warning"),
            edit("lights.yaml", "name: Kitchen", "name: Kitchen Lights"),
            edit("automations.yaml", "a", "b"),
        ])));
        let run = scan(&f).await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.target_documents, vec!["configuration.yaml", "lights.yaml"]);
        assert_eq!(run.chunk_count, 1);
        assert_eq!(run.chunks_succeeded, 1);
        assert_eq!(run.proposal_count, 2);
        assert_eq!(run.dropped_count, 1);
        assert!(run.ended_at.is_some());

        let stored = f.advisor.get_run(&run.run_id).await.unwrap();
        assert_eq!(stored, run);
        let ps = proposals(&f, &run).await;
        assert_eq!(ps.len(), 2);
        assert!(ps.iter().all(|p| p.status == ProposalStatus::Pending));
    }

    #[tokio::test]
    async fn test_failed_chunks_do_not_fail_the_run() {
        let options = AdvisorOptions {
            // One document per chunk.
            budget: SizeBudget::new(20).with_reserve(0.0),
            ..Default::default()
        };
        let mut backend = ScriptedBackend::always("[]");
        backend
            .answers
            .insert(0, Err("upstream unavailable".to_string()));
        backend.answers.insert(
            1,
            Ok(answer(&[edit("lights.yaml", "name: Kitchen", "name: Pantry")])),
        );
        let f = fixture_with(backend, options);
        let run = scan(&f).await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.chunks_failed + run.chunks_succeeded, run.chunk_count);
        assert!(run.chunks_failed >= 1);
        assert_eq!(run.chunk_failures[0].index, 0);
        assert!(run.chunk_failures[0].error.contains("upstream unavailable"));
        assert_eq!(run.proposal_count, 1);
    }

    #[tokio::test]
    async fn test_malformed_output_fails_the_chunk() {
        let f = fixture(ScriptedBackend::always("I could not find anything to change."));
        let run = scan(&f).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.chunks_failed, 1);
        assert!(run.chunk_failures[0].error.contains("malformed"));
    }

    #[tokio::test]
    async fn test_chunk_timeout_is_recorded() {
        let options = AdvisorOptions {
            chunk_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let mut backend = ScriptedBackend::always("[]");
        backend.delay = Some(Duration::from_secs(30));
        let f = fixture_with(backend, options);
        let run = scan(&f).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.chunks_failed, 1);
        assert!(run.chunk_failures[0].error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_input_errors_fail_the_run() {
        let records = Arc::new(InMemoryRecordStore::new());
        let advisor = Advisor::new(
            Arc::new(MemoryDocumentStore::new()),
            records.clone(),
            Arc::new(ScriptedBackend::always("[]")),
            AdvisorOptions::default(),
        );
        let err = advisor.start_run(&DocumentFilter::all()).await.unwrap_err();
        assert_eq!(err.code(), "no_documents");
        let runs = advisor.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);

        let f = fixture(ScriptedBackend::always("[]"));
        let err = f
            .advisor
            .start_run(&DocumentFilter::paths(["missing.yaml"]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_documents");
    }

    #[tokio::test]
    async fn test_start_run_returns_before_analysis() {
        let mut backend = ScriptedBackend::always("[]");
        backend.delay = Some(Duration::from_millis(50));
        let f = fixture(backend);
        let run_id = f.advisor.start_run(&DocumentFilter::all()).await.unwrap();
        assert_eq!(f.advisor.get_run(&run_id).await.unwrap().status, RunStatus::Running);

        for _ in 0..100 {
            if f.advisor.get_run(&run_id).await.unwrap().status == RunStatus::Completed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("run did not complete");
    }

    #[tokio::test]
    async fn test_cancel_run() {
        let mut backend = ScriptedBackend::always("[]");
        backend.delay = Some(Duration::from_secs(30));
        let f = fixture(backend);
        let run_id = f.advisor.start_run(&DocumentFilter::all()).await.unwrap();

        let run = f.advisor.cancel_run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some(CANCELLED));

        let err = f.advisor.cancel_run(&run_id).await.unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
        assert_eq!(f.advisor.cancel_run("nope").await.unwrap_err().code(), "not_found");
    }

    /// Chunk 0 answers with one edit and cancels the run on its way out;
    /// every other chunk hangs.
    struct CancelAfterFirst {
        advisor: Arc<std::sync::OnceLock<Advisor>>,
        answer: String,
    }

    #[async_trait]
    impl AnalysisBackend for CancelAfterFirst {
        fn name(&self) -> &str {
            "cancel-after-first"
        }

        async fn analyze(&self, request: &AnalysisRequest) -> anyhow::Result<String> {
            if request.chunk_index != 0 {
                tokio::time::sleep(Duration::from_secs(30)).await;
                return Ok("[]".to_string());
            }
            if let Some(advisor) = self.advisor.get().cloned() {
                let run_id = request.run_id.clone();
                tokio::spawn(async move {
                    let _ = advisor.cancel_run(&run_id).await;
                });
            }
            Ok(self.answer.clone())
        }
    }

    #[tokio::test]
    async fn test_cancel_keeps_finished_chunks() {
        // The finished chunk and the cancel signal race; repeat to cover both
        // orders.
        for _ in 0..20 {
            let slot = Arc::new(std::sync::OnceLock::new());
            let backend = CancelAfterFirst {
                advisor: slot.clone(),
                answer: answer(&[edit("configuration.yaml", "default: info", "default: warning")]),
            };
            let docs = Arc::new(MemoryDocumentStore::with_documents([
                ("configuration.yaml", CONFIG),
                ("lights.yaml", LIGHTS),
            ]));
            let options = AdvisorOptions {
                // One document per chunk.
                budget: SizeBudget::new(20).with_reserve(0.0),
                ..Default::default()
            };
            let advisor = Advisor::new(
                docs,
                Arc::new(InMemoryRecordStore::new()),
                Arc::new(backend),
                options,
            );
            let _ = slot.set(advisor.clone());

            let run_id = advisor.start_run(&DocumentFilter::all()).await.unwrap();
            let mut run = advisor.get_run(&run_id).await.unwrap();
            for _ in 0..500 {
                if run.status == RunStatus::Failed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                run = advisor.get_run(&run_id).await.unwrap();
            }

            assert_eq!(run.status, RunStatus::Failed);
            assert_eq!(run.error.as_deref(), Some(CANCELLED));
            assert_eq!(run.chunk_count, 2);
            assert_eq!(run.chunks_succeeded, 1);
            assert_eq!(run.proposal_count, 1);
            let kept = advisor
                .list_proposals(&ProposalFilter {
                    run_id: Some(run_id.clone()),
                    status: None,
                })
                .await
                .unwrap();
            assert_eq!(kept.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_accept_apply_and_terminal_states() {
        let f = fixture(ScriptedBackend::always(&answer(&[edit(
            "configuration.yaml",
            "default: info",
            "default: warning",
        )])));
        let run = scan(&f).await;
        let id = proposals(&f, &run).await[0].proposal_id.clone();

        let p = f
            .advisor
            .transition_proposal(&id, ProposalAction::Accept)
            .await
            .unwrap();
        assert_eq!(p.status, ProposalStatus::Accepted);

        f.advisor.apply_proposal(&id).await.unwrap();
        assert!(f
            .docs
            .content("configuration.yaml")
            .unwrap()
            .contains("default: warning"));

        let err = f
            .advisor
            .transition_proposal(&id, ProposalAction::Reject)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
        let err = f
            .advisor
            .transition_proposal(&id, ProposalAction::Apply)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_action");
        assert_eq!(f.advisor.discard_proposal(&id).await.unwrap_err().code(), "invalid_transition");
    }

    #[tokio::test]
    async fn test_bulk_accept_reports_each_item() {
        let f = fixture(ScriptedBackend::always(&answer(&[
            edit("configuration.yaml", "default: info", "default: warning"),
            edit("lights.yaml", "name: Kitchen", "name: Pantry"),
        ])));
        let run = scan(&f).await;
        let mut ids: Vec<String> = proposals(&f, &run)
            .await
            .into_iter()
            .map(|p| p.proposal_id)
            .collect();
        ids.push("does-not-exist".to_string());

        let result = f.advisor.bulk_transition(&ids, ProposalAction::Accept).await;
        assert_eq!(result.accepted_count, 2);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.failures[0].proposal_id, "does-not-exist");
        assert_eq!(result.failures[0].code, "not_found");
        let accepted = f
            .records
            .list_proposals(&ProposalFilter {
                run_id: None,
                status: Some(ProposalStatus::Accepted),
            })
            .await
            .unwrap();
        assert_eq!(accepted.len(), 2);
    }

    #[tokio::test]
    async fn test_bulk_accept_with_applied_item() {
        let f = fixture(ScriptedBackend::always(&answer(&[
            edit("configuration.yaml", "default: info", "default: warning"),
            edit("configuration.yaml", "purge_keep_days: 30", "purge_keep_days: 10"),
            edit("lights.yaml", "name: Kitchen", "name: Pantry"),
        ])));
        let run = scan(&f).await;
        let ps = proposals(&f, &run).await;
        assert_eq!(ps.len(), 3);
        let applied = ps
            .iter()
            .find(|p| p.target_path == "lights.yaml")
            .unwrap()
            .proposal_id
            .clone();
        f.advisor
            .transition_proposal(&applied, ProposalAction::Accept)
            .await
            .unwrap();
        f.advisor.apply_proposal(&applied).await.unwrap();

        let ids: Vec<String> = ps.iter().map(|p| p.proposal_id.clone()).collect();
        let result = f.advisor.bulk_transition(&ids, ProposalAction::Accept).await;
        assert_eq!(result.accepted_count, 2);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.failures[0].proposal_id, applied);
        assert_eq!(result.failures[0].code, "invalid_transition");
        assert_eq!(
            f.advisor.get_proposal(&applied).await.unwrap().status,
            ProposalStatus::Applied
        );
    }

    #[tokio::test]
    async fn test_revalidate_and_rescan() {
        let f = fixture(ScriptedBackend::always(&answer(&[
            edit("configuration.yaml", "default: info", "default: warning"),
            serde_json::json!({
                "file_path": "lights.yaml",
                "title": "Rename",
                "content": "light:\n  - platform: group\n    name: Pantry\n",
            }),
        ])));
        let run = scan(&f).await;
        let ids: Vec<String> = proposals(&f, &run)
            .await
            .into_iter()
            .map(|p| p.proposal_id)
            .collect();
        f.advisor.bulk_transition(&ids, ProposalAction::Accept).await;

        f.docs.put("configuration.yaml", format!("{}http: {{}}\n", CONFIG));
        f.docs.put("lights.yaml", format!("{}    icon: mdi:lamp\n", LIGHTS));
        let mut marked = f.advisor.revalidate().await.unwrap();
        marked.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(marked, expected);

        let excerpt = f.advisor.get_proposal(&ids[0]).await.unwrap();
        assert_eq!(excerpt.edit_kind, EditKind::Excerpt);
        let rescanned = f
            .advisor
            .transition_proposal(&ids[0], ProposalAction::Rescan)
            .await
            .unwrap();
        assert_eq!(rescanned.status, ProposalStatus::Pending);
        assert_ne!(rescanned.base_hash, excerpt.base_hash);

        let err = f
            .advisor
            .transition_proposal(&ids[1], ProposalAction::Rescan)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "rescan_failed");
        assert_eq!(
            f.advisor.get_proposal(&ids[1]).await.unwrap().status,
            ProposalStatus::Stale
        );
    }

    #[tokio::test]
    async fn test_discard_rules() {
        let f = fixture(ScriptedBackend::always(&answer(&[
            edit("configuration.yaml", "default: info", "default: warning"),
            edit("lights.yaml", "name: Kitchen", "name: Pantry"),
        ])));
        let run = scan(&f).await;
        let ids: Vec<String> = proposals(&f, &run)
            .await
            .into_iter()
            .map(|p| p.proposal_id)
            .collect();

        f.advisor.discard_proposal(&ids[0]).await.unwrap();
        assert_eq!(f.advisor.get_proposal(&ids[0]).await.unwrap_err().code(), "not_found");

        f.advisor
            .transition_proposal(&ids[1], ProposalAction::Accept)
            .await
            .unwrap();
        assert_eq!(
            f.advisor.discard_proposal(&ids[1]).await.unwrap_err().code(),
            "invalid_transition"
        );
    }
}
