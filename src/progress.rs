//! Scan progress reporting.
//!
//! Reports progress during `cfa scan` so users can see how many chunks are
//! left. Progress is written to **stderr**, which keeps stdout parseable
//! for scripts.

use std::io::Write;

/// A single progress event for a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanProgressEvent {
    /// Documents resolved and chunked; dispatch is about to start.
    Planned {
        run_id: String,
        documents: u64,
        chunks: u64,
    },
    /// A chunk reached a terminal state: `n` of `total` are done.
    ChunkFinished {
        run_id: String,
        n: u64,
        total: u64,
        ok: bool,
    },
}

/// Receives progress events from the run coordinator.
pub trait ScanProgressReporter: Send + Sync {
    fn report(&self, event: ScanProgressEvent);
}

/// Human-friendly progress on stderr: "scan 1a2b3c4d  analyzing  3 / 12 chunks".
pub struct StderrProgress;

impl ScanProgressReporter for StderrProgress {
    fn report(&self, event: ScanProgressEvent) {
        let line = match &event {
            ScanProgressEvent::Planned {
                run_id,
                documents,
                chunks,
            } => format!(
                "scan {}  {} documents in {} chunks\n",
                short_id(run_id),
                format_number(*documents),
                format_number(*chunks)
            ),
            ScanProgressEvent::ChunkFinished {
                run_id,
                n,
                total,
                ok,
            } => format!(
                "scan {}  analyzing  {} / {} chunks{}\n",
                short_id(run_id),
                format_number(*n),
                format_number(*total),
                if *ok { "" } else { "  (chunk failed)" }
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ScanProgressReporter for JsonProgress {
    fn report(&self, event: ScanProgressEvent) {
        let obj = match &event {
            ScanProgressEvent::Planned {
                run_id,
                documents,
                chunks,
            } => serde_json::json!({
                "event": "progress",
                "run_id": run_id,
                "phase": "planned",
                "documents": documents,
                "chunks": chunks
            }),
            ScanProgressEvent::ChunkFinished {
                run_id,
                n,
                total,
                ok,
            } => serde_json::json!({
                "event": "progress",
                "run_id": run_id,
                "phase": "analyzing",
                "n": n,
                "total": total,
                "ok": ok
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ScanProgressReporter for NoProgress {
    fn report(&self, _event: ScanProgressEvent) {}
}

fn short_id(run_id: &str) -> &str {
    run_id.get(..8).unwrap_or(run_id)
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ScanProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
