//! Core data models used throughout Config Advisor.
//!
//! These types represent the documents, chunks, runs, proposals, and backup
//! records that flow through the analysis and apply pipeline.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `content`. Used as a document's `content_hash`.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A path-addressable unit of configuration text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Relative, `/`-separated path. Unique within a document store.
    pub path: String,
    pub content: String,
    pub content_hash: String,
}

impl Document {
    /// Build a document and compute its hash from `content`.
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        let content_hash = content_hash(&content);
        Self {
            path: path.into(),
            content,
            content_hash,
        }
    }
}

/// One contiguous byte range of a document, as placed into a [`Chunk`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub document_path: String,
    pub byte_range: Range<usize>,
    /// 1-based ordinal of this piece within its document.
    pub part: usize,
    /// Number of pieces the document was split into (1 when unsplit).
    pub part_count: usize,
}

impl Segment {
    pub fn is_whole_document(&self) -> bool {
        self.part_count == 1
    }
}

/// A bounded grouping of document segments sent to analysis as one request.
///
/// Chunks are ephemeral: built per run and discarded after extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic identifier derived from the chunk's segments.
    pub chunk_id: String,
    /// Position of this chunk within its chunking, starting at 0.
    pub index: usize,
    pub segments: Vec<Segment>,
    pub token_estimate: usize,
}

impl Chunk {
    /// Returns true if any segment of this chunk belongs to `path`.
    pub fn covers(&self, path: &str) -> bool {
        self.segments.iter().any(|s| s.document_path == path)
    }

    /// Distinct document paths covered by this chunk, in segment order.
    pub fn paths(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for s in &self.segments {
            if !out.contains(&s.document_path.as_str()) {
                out.push(&s.document_path);
            }
        }
        out
    }
}

/// Lifecycle state of a [`Run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A chunk that timed out or errored during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub chunk_id: String,
    pub index: usize,
    pub error: String,
}

/// One analysis session over a set of documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub target_documents: Vec<String>,
    pub chunk_count: usize,
    pub chunks_succeeded: usize,
    pub chunks_failed: usize,
    pub chunk_failures: Vec<ChunkFailure>,
    pub proposal_count: usize,
    pub dropped_count: usize,
    /// Why the run failed (e.g. "no documents resolved", "cancelled").
    pub error: Option<String>,
}

impl Run {
    /// A fresh run in `pending` state.
    pub fn new() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            target_documents: Vec::new(),
            chunk_count: 0,
            chunks_succeeded: 0,
            chunks_failed: 0,
            chunk_failures: Vec::new(),
            proposal_count: 0,
            dropped_count: 0,
            error: None,
        }
    }

    /// Number of chunks that reached a terminal state (success or failure).
    pub fn chunks_finished(&self) -> usize {
        self.chunks_succeeded + self.chunks_failed
    }
}

impl Default for Run {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of a [`Proposal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
    Applied,
    Stale,
}

/// How much impact a proposal claims to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Whether a proposal replaces the whole document or a single excerpt of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditKind {
    /// `original_snapshot` is the full document; `proposed_content` replaces it.
    Replace,
    /// `original_snapshot` occurs exactly once in the document and is
    /// substituted by `proposed_content`.
    Excerpt,
}

/// One structured, file-scoped candidate edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: String,
    pub run_id: String,
    pub target_path: String,
    pub title: String,
    pub category: String,
    pub severity: Severity,
    pub rationale: String,
    pub edit_kind: EditKind,
    pub original_snapshot: String,
    pub proposed_content: String,
    /// Hash of the target document at run start.
    pub base_hash: String,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    /// Compute the full document text this proposal would produce when
    /// applied to `current`.
    ///
    /// Returns `None` for an excerpt edit whose excerpt does not occur exactly
    /// once in `current`.
    pub fn render_against(&self, current: &str) -> Option<String> {
        match self.edit_kind {
            EditKind::Replace => Some(self.proposed_content.clone()),
            EditKind::Excerpt => {
                replace_unique(current, &self.original_snapshot, &self.proposed_content)
            }
        }
    }
}

/// Replace the single occurrence of `needle` in `haystack`.
///
/// Returns `None` when `needle` is empty, absent, or occurs more than once.
pub fn replace_unique(haystack: &str, needle: &str, replacement: &str) -> Option<String> {
    if needle.is_empty() {
        return None;
    }
    let start = haystack.find(needle)?;
    // Overlapping occurrences count as ambiguous too.
    let next = start + haystack[start..].chars().next().map_or(1, char::len_utf8);
    if haystack[next..].contains(needle) {
        return None;
    }
    let mut out = String::with_capacity(haystack.len() - needle.len() + replacement.len());
    out.push_str(&haystack[..start]);
    out.push_str(replacement);
    out.push_str(&haystack[start + needle.len()..]);
    Some(out)
}

/// Immutable record of the backup taken right before a proposal was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub proposal_id: String,
    pub path: String,
    pub backup_location: String,
    pub created_at: DateTime<Utc>,
}

/// Result of a successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRecord {
    pub proposal_id: String,
    pub path: String,
    pub backup_location: String,
    pub new_hash: String,
    pub applied_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($ty::$variant),)+
                    other => anyhow::bail!("unknown {}: '{}'", stringify!($ty), other),
                }
            }
        }
    };
}

str_enum!(RunStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

str_enum!(ProposalStatus {
    Pending => "pending",
    Accepted => "accepted",
    Rejected => "rejected",
    Applied => "applied",
    Stale => "stale",
});

str_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
});

str_enum!(EditKind {
    Replace => "replace",
    Excerpt => "excerpt",
});
