//! Budgeted document chunker.
//!
//! Packs [`Document`]s into [`Chunk`]s that fit an analysis size budget.
//! Documents are visited in path order and appended to the current chunk
//! while they fit; a document larger than the whole budget is split at its
//! top-level YAML block boundaries and each piece becomes its own chunk.
//!
//! # Algorithm
//!
//! 1. Derive the usable budget: `max_tokens × (1 − reserve_fraction)`.
//! 2. Estimate tokens per document with a 4 chars/token ratio.
//! 3. Append whole documents to the current chunk until the next one would
//!    overflow; then flush and start a new chunk.
//! 4. An oversized document is cut at top-level block starts (a line that
//!    begins at column 0 and is not a comment, blank, or document marker).
//!    Leading comment and marker lines stay with the block they precede.
//! 5. A single block that is still too large falls back to line boundaries.
//!    A single line is never split, even if it exceeds the budget.
//!
//! # Guarantees
//!
//! - Every byte of every input document lands in exactly one segment.
//! - Output is a pure function of `(documents, budget)`: chunk ids are
//!   derived from segment coordinates, not random.
//! - No input → no chunks.
//!
//! # Example
//!
//! ```rust
//! use config_advisor_core::chunk::{chunk_documents, SizeBudget};
//! use config_advisor_core::models::Document;
//!
//! let docs = vec![Document::new("a.yaml", "x: 1\n"), Document::new("b.yaml", "y: 2\n")];
//! let chunks = chunk_documents(&docs, SizeBudget::new(700));
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].segments.len(), 2);
//! ```

use std::ops::Range;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{Chunk, Document, Segment};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Share of the budget held back for framing and the response.
pub const DEFAULT_RESERVE_FRACTION: f64 = 0.2;

/// Size limit for a single analysis request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeBudget {
    /// Maximum tokens per analysis request, framing included.
    pub max_tokens: usize,
    /// Fraction of `max_tokens` reserved for framing and response overhead.
    pub reserve_fraction: f64,
}

impl SizeBudget {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            reserve_fraction: DEFAULT_RESERVE_FRACTION,
        }
    }

    pub fn with_reserve(mut self, reserve_fraction: f64) -> Self {
        self.reserve_fraction = reserve_fraction;
        self
    }

    /// Tokens left for document content once the reserve is removed.
    /// Never less than 1.
    pub fn usable_tokens(&self) -> usize {
        let reserve = if self.reserve_fraction.is_finite() {
            self.reserve_fraction.clamp(0.0, 0.99)
        } else {
            DEFAULT_RESERVE_FRACTION
        };
        let usable = (self.max_tokens as f64 * (1.0 - reserve)).floor() as usize;
        usable.max(1)
    }

    fn usable_bytes(&self) -> usize {
        self.usable_tokens() * CHARS_PER_TOKEN
    }
}

/// Rough token estimate for `bytes` of text.
pub fn estimate_tokens(bytes: usize) -> usize {
    bytes.div_ceil(CHARS_PER_TOKEN)
}

/// Split `documents` into analysis-sized chunks.
///
/// Duplicate paths are ignored after their first occurrence (in path order),
/// so each path is covered exactly once.
pub fn chunk_documents(documents: &[Document], budget: SizeBudget) -> Vec<Chunk> {
    let mut docs: Vec<&Document> = documents.iter().collect();
    docs.sort_by(|a, b| a.path.cmp(&b.path));
    docs.dedup_by(|a, b| a.path == b.path);

    let usable = budget.usable_tokens();
    let mut builder = ChunkBuilder::default();

    for doc in docs {
        let tokens = estimate_tokens(doc.content.len());
        if tokens <= usable {
            if builder.current_tokens + tokens > usable {
                builder.flush();
            }
            builder.push(Segment {
                document_path: doc.path.clone(),
                byte_range: 0..doc.content.len(),
                part: 1,
                part_count: 1,
            });
            continue;
        }

        builder.flush();
        let pieces = split_document(&doc.content, budget.usable_bytes());
        let part_count = pieces.len();
        for (i, range) in pieces.into_iter().enumerate() {
            builder.push(Segment {
                document_path: doc.path.clone(),
                byte_range: range,
                part: i + 1,
                part_count,
            });
            builder.flush();
        }
    }

    builder.flush();
    builder.chunks
}

#[derive(Default)]
struct ChunkBuilder {
    chunks: Vec<Chunk>,
    current: Vec<Segment>,
    current_tokens: usize,
}

impl ChunkBuilder {
    fn push(&mut self, segment: Segment) {
        self.current_tokens += estimate_tokens(segment.byte_range.len());
        self.current.push(segment);
    }

    fn flush(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let segments = std::mem::take(&mut self.current);
        let token_estimate = std::mem::take(&mut self.current_tokens);
        self.chunks.push(Chunk {
            chunk_id: chunk_id_for(&segments),
            index: self.chunks.len(),
            segments,
            token_estimate,
        });
    }
}

fn chunk_id_for(segments: &[Segment]) -> String {
    let mut hasher = Sha256::new();
    for s in segments {
        hasher.update(s.document_path.as_bytes());
        hasher.update(format!(":{}-{};", s.byte_range.start, s.byte_range.end).as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("chunk-{}", &digest[..16])
}

/// Split an oversized document into contiguous byte ranges of at most
/// `max_bytes`, cutting only at block or line boundaries.
fn split_document(text: &str, max_bytes: usize) -> Vec<Range<usize>> {
    let mut pieces = Vec::new();
    let mut current: Option<Range<usize>> = None;

    for block in top_level_blocks(text) {
        if let Some(cur) = current.as_mut() {
            if block.end - cur.start <= max_bytes {
                cur.end = block.end;
                continue;
            }
        }
        if let Some(cur) = current.take() {
            pieces.push(cur);
        }
        if block.len() <= max_bytes {
            current = Some(block);
        } else {
            pieces.extend(split_lines(text, block, max_bytes));
        }
    }

    if let Some(cur) = current {
        pieces.push(cur);
    }
    if pieces.is_empty() {
        pieces.push(0..text.len());
    }
    pieces
}

/// Byte ranges of the top-level blocks of a YAML text. The ranges are
/// contiguous and cover the whole text.
fn top_level_blocks(text: &str) -> Vec<Range<usize>> {
    let mut starts = vec![0usize];
    let mut leading_comment: Option<usize> = None;
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        let first = line.as_bytes()[0];
        if line.trim().is_empty() {
            // A blank line detaches any comment run from the next block.
            leading_comment = None;
            continue;
        }
        if first == b'#' || line.starts_with("---") || line.starts_with("...") {
            if leading_comment.is_none() {
                leading_comment = Some(line_start);
            }
            continue;
        }
        if first == b' ' || first == b'\t' {
            leading_comment = None;
            continue;
        }

        let boundary = leading_comment.take().unwrap_or(line_start);
        if boundary > *starts.last().unwrap_or(&0) {
            starts.push(boundary);
        }
    }

    let mut blocks = Vec::with_capacity(starts.len());
    for (i, start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(text.len());
        if end > *start {
            blocks.push(*start..end);
        }
    }
    blocks
}

/// Greedily pack the lines of `block` into ranges of at most `max_bytes`.
/// A line longer than `max_bytes` becomes a range of its own.
fn split_lines(text: &str, block: Range<usize>, max_bytes: usize) -> Vec<Range<usize>> {
    let mut pieces = Vec::new();
    let mut current: Option<Range<usize>> = None;
    let mut offset = block.start;

    for line in text[block.clone()].split_inclusive('\n') {
        let line_range = offset..offset + line.len();
        offset = line_range.end;

        match current.as_mut() {
            Some(cur) if line_range.end - cur.start <= max_bytes => cur.end = line_range.end,
            _ => {
                if let Some(cur) = current.take() {
                    pieces.push(cur);
                }
                current = Some(line_range);
            }
        }
    }

    if let Some(cur) = current {
        pieces.push(cur);
    }
    pieces
}

/// Assemble the analysis text for `chunk`.
///
/// Each segment is framed with its path and, for split documents, its part
/// ordinal and byte range so the backend can attribute edits to a file.
/// Segments whose document is missing from `documents` are skipped.
pub fn render_chunk(chunk: &Chunk, documents: &[Document]) -> String {
    let mut parts = vec![
        "# Configuration Analysis Request".to_string(),
        String::new(),
        "## Summary".to_string(),
        format!("- Documents in this request: {}", chunk.paths().len()),
        format!("- Estimated tokens: {}", chunk.token_estimate),
        String::new(),
        "## Files to Analyze".to_string(),
        String::new(),
    ];

    for segment in &chunk.segments {
        let Some(doc) = documents.iter().find(|d| d.path == segment.document_path) else {
            continue;
        };
        let Some(body) = doc.content.get(segment.byte_range.clone()) else {
            continue;
        };
        if segment.is_whole_document() {
            parts.push(format!("### {}", segment.document_path));
        } else {
            parts.push(format!(
                "### {} (part {}/{}, bytes {}..{})",
                segment.document_path,
                segment.part,
                segment.part_count,
                segment.byte_range.start,
                segment.byte_range.end
            ));
        }
        parts.push("```yaml".to_string());
        parts.push(body.trim_end_matches('\n').to_string());
        parts.push("```".to_string());
        parts.push(String::new());
    }

    parts.join("\n")
}
