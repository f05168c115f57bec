//! CLI command implementations.
//!
//! Each `run_*` function backs one `cfa` subcommand. Results go to stdout
//! with `println!`; diagnostics go through `tracing` to stderr.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use config_advisor_core::document::{DocumentFilter, DocumentStore};
use config_advisor_core::lifecycle::ProposalAction;
use config_advisor_core::models::{Proposal, ProposalStatus, Run};
use config_advisor_core::store::ProposalFilter;

use crate::config::Config;
use crate::documents::FsDocumentStore;
use crate::open_advisor;
use crate::progress::{ProgressMode, ScanProgressReporter};

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn print_run(run: &Run) {
    println!("--- Run ---");
    println!("run_id:       {}", run.run_id);
    println!("status:       {}", run.status);
    println!("started_at:   {}", format_ts(run.started_at));
    if let Some(ended) = run.ended_at {
        println!("ended_at:     {}", format_ts(ended));
    }
    println!("documents:    {}", run.target_documents.len());
    println!(
        "chunks:       {} ({} succeeded, {} failed)",
        run.chunk_count, run.chunks_succeeded, run.chunks_failed
    );
    println!("proposals:    {}", run.proposal_count);
    println!("dropped:      {}", run.dropped_count);
    if let Some(ref error) = run.error {
        println!("error:        {}", error);
    }
    for failure in &run.chunk_failures {
        println!("  chunk {} ({}): {}", failure.index, failure.chunk_id, failure.error);
    }
}

fn print_proposal_line(p: &Proposal) {
    println!(
        "{}  {:<8}  {:<6}  {:<24}  {}",
        p.proposal_id,
        p.status.as_str(),
        p.severity.as_str(),
        p.target_path,
        p.title
    );
}

/// `cfa documents`: list the documents a full scan would cover.
pub async fn run_documents(config: &Config) -> Result<()> {
    let store = FsDocumentStore::from_config(&config.documents)?;
    let paths = store.list_documents(&DocumentFilter::all()).await?;
    for path in &paths {
        println!("{}", path);
    }
    println!("{} documents under {}", paths.len(), store.root().display());
    Ok(())
}

/// `cfa scan`: analyze documents and wait for the run to finish.
pub async fn run_scan(config: &Config, paths: Vec<String>, progress: ProgressMode) -> Result<()> {
    let advisor = open_advisor(config).await?;
    let reporter: Arc<dyn ScanProgressReporter> = Arc::from(progress.reporter());
    let run = advisor
        .run_to_completion(&DocumentFilter::paths(paths), reporter)
        .await?;
    print_run(&run);
    Ok(())
}

/// `cfa runs`: recent runs, newest first.
pub async fn run_runs(config: &Config, limit: usize) -> Result<()> {
    let advisor = open_advisor(config).await?;
    let runs = advisor.list_runs(limit).await?;
    if runs.is_empty() {
        println!("No runs.");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<9}  {}  chunks {}/{}  proposals {}",
            run.run_id,
            run.status.as_str(),
            format_ts(run.started_at),
            run.chunks_finished(),
            run.chunk_count,
            run.proposal_count
        );
    }
    Ok(())
}

/// `cfa run <id>`: one run in detail.
pub async fn run_show_run(config: &Config, run_id: &str) -> Result<()> {
    let advisor = open_advisor(config).await?;
    print_run(&advisor.get_run(run_id).await?);
    Ok(())
}

/// `cfa cancel <id>`.
pub async fn run_cancel(config: &Config, run_id: &str) -> Result<()> {
    let advisor = open_advisor(config).await?;
    let run = advisor.cancel_run(run_id).await?;
    println!("Run {} is {}.", run.run_id, run.status);
    Ok(())
}

/// `cfa proposals`: list proposals, optionally by run and status.
pub async fn run_proposals(
    config: &Config,
    run_id: Option<String>,
    status: Option<String>,
) -> Result<()> {
    let status = status
        .as_deref()
        .map(str::parse::<ProposalStatus>)
        .transpose()?;
    let advisor = open_advisor(config).await?;
    let proposals = advisor
        .list_proposals(&ProposalFilter { run_id, status })
        .await?;
    for p in &proposals {
        print_proposal_line(p);
    }
    println!("{} proposals", proposals.len());
    Ok(())
}

/// `cfa show <id>`: a proposal with its edit and history.
pub async fn run_show(config: &Config, proposal_id: &str) -> Result<()> {
    let advisor = open_advisor(config).await?;
    let p = advisor.get_proposal(proposal_id).await?;

    println!("--- Proposal ---");
    println!("id:           {}", p.proposal_id);
    println!("run_id:       {}", p.run_id);
    println!("title:        {}", p.title);
    println!("path:         {}", p.target_path);
    println!("status:       {}", p.status);
    println!("severity:     {}", p.severity);
    println!("category:     {}", p.category);
    println!("edit:         {}", p.edit_kind);
    println!("base_hash:    {}", p.base_hash);
    println!("created_at:   {}", format_ts(p.created_at));
    println!("updated_at:   {}", format_ts(p.updated_at));
    println!();

    if !p.rationale.is_empty() {
        println!("--- Rationale ---");
        println!("{}", p.rationale);
        println!();
    }

    println!("--- Before ---");
    println!("{}", p.original_snapshot.trim_end());
    println!();
    println!("--- After ---");
    println!("{}", p.proposed_content.trim_end());
    println!();

    let backups = advisor.backups(proposal_id).await?;
    if !backups.is_empty() {
        println!("--- Backups ({}) ---", backups.len());
        for b in &backups {
            println!("{}  {}", format_ts(b.created_at), b.backup_location);
        }
    }
    if let Some(applied) = advisor.applied(proposal_id).await? {
        println!("applied_at:   {}", format_ts(applied.applied_at));
        if let Some(at) = applied.rolled_back_at {
            println!("rolled_back:  {}", format_ts(at));
        }
    }
    Ok(())
}

/// `cfa accept|reject|rescan <id>...`.
///
/// A single id fails the command on error. Several ids are handled one by
/// one; the summary lists each failure.
pub async fn run_transition(config: &Config, ids: &[String], action: ProposalAction) -> Result<()> {
    let advisor = open_advisor(config).await?;
    if let [id] = ids {
        let p = advisor.transition_proposal(id, action).await?;
        println!("Proposal {} is {}.", p.proposal_id, p.status);
        return Ok(());
    }

    let result = advisor.bulk_transition(ids, action).await;
    println!(
        "{}: {} succeeded, {} failed",
        action, result.accepted_count, result.failed_count
    );
    for failure in &result.failures {
        println!("  {}  {}: {}", failure.proposal_id, failure.code, failure.error);
    }
    if result.failed_count > 0 {
        bail!("{} of {} proposals failed to {}", result.failed_count, ids.len(), action);
    }
    Ok(())
}

/// `cfa apply <id>`.
pub async fn run_apply(config: &Config, proposal_id: &str) -> Result<()> {
    let advisor = open_advisor(config).await?;
    let record = advisor.apply_proposal(proposal_id).await?;
    println!("Applied {} to {}.", record.proposal_id, record.path);
    println!("backup:       {}", record.backup_location);
    println!("new_hash:     {}", record.new_hash);
    Ok(())
}

/// `cfa rollback <id>`.
pub async fn run_rollback(config: &Config, proposal_id: &str) -> Result<()> {
    let advisor = open_advisor(config).await?;
    let record = advisor.rollback_proposal(proposal_id).await?;
    println!(
        "Restored {} from {}.",
        record.path, record.backup_location
    );
    Ok(())
}

/// `cfa discard <id>`.
pub async fn run_discard(config: &Config, proposal_id: &str) -> Result<()> {
    let advisor = open_advisor(config).await?;
    advisor.discard_proposal(proposal_id).await?;
    println!("Discarded {}.", proposal_id);
    Ok(())
}

/// `cfa check`: mark accepted proposals whose documents changed as stale.
pub async fn run_check(config: &Config) -> Result<()> {
    let advisor = open_advisor(config).await?;
    let stale = advisor.revalidate().await?;
    for id in &stale {
        println!("stale  {}", id);
    }
    println!("{} accepted proposals marked stale", stale.len());
    Ok(())
}
