//! Proposal extraction from raw analysis output.
//!
//! The analysis backend is asked (via [`RESPONSE_DIRECTIVE`]) to answer with
//! a JSON array of edit objects. [`extract`] turns that answer into a list of
//! [`Extraction`]s: either a validated [`Proposal`] or a dropped block with
//! the reason it was dropped.
//!
//! Extraction is strict. Anything ambiguous is rejected rather than guessed:
//! a block must name a path the chunk actually covers, carry exactly one
//! content form, and produce a document that passes
//! [`validate_replacement`](crate::structure::validate_replacement).
//!
//! This module performs no I/O and no logging; the caller decides what to
//! record about dropped blocks.

use std::collections::HashMap;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::models::{
    replace_unique, Chunk, Document, EditKind, Proposal, ProposalStatus, Severity,
};
use crate::structure::validate_replacement;

/// Instructions appended to every analysis request describing the expected
/// answer format.
pub const RESPONSE_DIRECTIVE: &str = r####"## Response Format
Respond only with a JSON array (optionally inside a single ```json fenced block) of edit objects. Each object has:
- "file_path": the exact path of the file to change, as given in a "###" header above
- "title": short title of the change
- "description": what is wrong and how the change fixes it
- "reasoning": why the change improves the configuration
- "impact": "high", "medium", or "low"
- "category": "performance", "maintainability", "best_practices", "security", or "deprecated"
and exactly one of:
- "before" and "after": an exact YAML excerpt copied from the file (it must occur exactly once) and its replacement
- "content": the complete new text of the file
Return [] if there is nothing to change."####;

const DEFAULT_TITLE: &str = "Optimization suggestion";
const DEFAULT_CATEGORY: &str = "optimization";

/// The analysis output as a whole could not be interpreted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("malformed analysis output: {0}")]
    Malformed(String),
}

/// Outcome for one edit block of the analysis output.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Proposal(Proposal),
    /// The block targets a path that is not part of the chunk.
    Unattributable { path: Option<String>, title: String },
    /// The block is attributable but its content is unusable.
    InvalidStructure {
        path: Option<String>,
        title: String,
        reason: String,
    },
}

impl Extraction {
    /// Short machine label for logging and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Extraction::Proposal(_) => "proposal",
            Extraction::Unattributable { .. } => "unattributable",
            Extraction::InvalidStructure { .. } => "invalid_structure",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawEdit {
    #[serde(default, alias = "path", alias = "target_path")]
    file_path: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "rationale")]
    description: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default, alias = "severity")]
    impact: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    before: Option<String>,
    #[serde(default)]
    after: Option<String>,
    #[serde(default, alias = "yaml")]
    content: Option<String>,
}

/// Interpret `output` produced for `chunk` during run `run_id`.
///
/// `baseline` maps each path to the document as it was read at run start;
/// proposals capture its hash as their `base_hash`.
pub fn extract(
    chunk: &Chunk,
    run_id: &str,
    output: &str,
    baseline: &HashMap<String, Document>,
) -> Result<Vec<Extraction>, ExtractError> {
    let items = locate_json_array(output)?;
    Ok(items
        .into_iter()
        .map(|item| extract_one(chunk, run_id, item, baseline))
        .collect())
}

fn extract_one(
    chunk: &Chunk,
    run_id: &str,
    item: Value,
    baseline: &HashMap<String, Document>,
) -> Extraction {
    let raw: RawEdit = match serde_json::from_value(item) {
        Ok(raw) => raw,
        Err(e) => {
            return Extraction::InvalidStructure {
                path: None,
                title: DEFAULT_TITLE.to_string(),
                reason: format!("not an edit object: {}", e),
            }
        }
    };

    let title = non_empty(raw.title.as_deref())
        .unwrap_or(DEFAULT_TITLE)
        .to_string();
    let path = raw.file_path.as_deref().map(normalize_path);

    let doc = match path.as_deref() {
        Some(p) if chunk.covers(p) => baseline.get(p),
        _ => None,
    };
    let Some(doc) = doc else {
        return Extraction::Unattributable { path, title };
    };

    let invalid = |reason: String| Extraction::InvalidStructure {
        path: Some(doc.path.clone()),
        title: title.clone(),
        reason,
    };

    let severity = match non_empty(raw.impact.as_deref()) {
        None => Severity::Medium,
        Some(s) => match s.parse::<Severity>() {
            Ok(sev) => sev,
            Err(_) => return invalid(format!("unknown severity '{}'", s)),
        },
    };

    let (edit_kind, original_snapshot, proposed_content, rendered) =
        match (raw.before, raw.after, raw.content) {
            (None, None, Some(content)) => (
                EditKind::Replace,
                doc.content.clone(),
                content.clone(),
                content,
            ),
            (Some(before), Some(after), None) => match locate_excerpt(&doc.content, &before, &after)
            {
                Some((snapshot, replacement, rendered)) => {
                    (EditKind::Excerpt, snapshot, replacement, rendered)
                }
                None => return invalid("excerpt does not occur exactly once".to_string()),
            },
            _ => return invalid("expected either before/after or content".to_string()),
        };

    if rendered == doc.content {
        return invalid("edit does not change the document".to_string());
    }
    if let Err(e) = validate_replacement(&doc.content, &rendered) {
        return invalid(e.to_string());
    }

    let rationale = match (
        non_empty(raw.description.as_deref()),
        non_empty(raw.reasoning.as_deref()),
    ) {
        (Some(d), Some(r)) => format!("{}\n\n{}", d, r),
        (Some(d), None) => d.to_string(),
        (None, Some(r)) => r.to_string(),
        (None, None) => String::new(),
    };

    let now = Utc::now();
    Extraction::Proposal(Proposal {
        proposal_id: uuid::Uuid::new_v4().to_string(),
        run_id: run_id.to_string(),
        target_path: doc.path.clone(),
        title,
        category: non_empty(raw.category.as_deref())
            .unwrap_or(DEFAULT_CATEGORY)
            .to_lowercase(),
        severity,
        rationale,
        edit_kind,
        original_snapshot,
        proposed_content,
        base_hash: doc.content_hash.clone(),
        status: ProposalStatus::Pending,
        created_at: now,
        updated_at: now,
    })
}

/// Find `before` exactly once in `content`. Trailing newlines on the excerpt
/// are trimmed as a second attempt. Returns the excerpt and replacement as
/// matched plus the rendered document.
fn locate_excerpt(content: &str, before: &str, after: &str) -> Option<(String, String, String)> {
    if let Some(rendered) = replace_unique(content, before, after) {
        return Some((before.to_string(), after.to_string(), rendered));
    }
    let (b, a) = (before.trim_end_matches('\n'), after.trim_end_matches('\n'));
    if b.len() == before.len() {
        return None;
    }
    replace_unique(content, b, a).map(|rendered| (b.to_string(), a.to_string(), rendered))
}

fn normalize_path(path: &str) -> String {
    let p = path.trim().replace('\\', "/");
    let mut p = p.as_str();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p.to_string()
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Accept a bare JSON array or one fenced block containing one.
fn locate_json_array(output: &str) -> Result<Vec<Value>, ExtractError> {
    let trimmed = output.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| ExtractError::Malformed(format!("invalid json array: {}", e)));
    }

    let blocks = fenced_blocks(trimmed);
    match blocks.as_slice() {
        [] => Err(ExtractError::Malformed("no json array found".to_string())),
        [body] => serde_json::from_str(body.trim())
            .map_err(|e| ExtractError::Malformed(format!("invalid json array: {}", e))),
        _ => Err(ExtractError::Malformed(format!(
            "expected one fenced json block, found {}",
            blocks.len()
        ))),
    }
}

/// Bodies of fenced code blocks labelled `json` (or unlabelled).
fn fenced_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut open: Option<(bool, Vec<&str>)> = None;

    for line in text.lines() {
        let t = line.trim();
        match open.take() {
            None => {
                if let Some(label) = t.strip_prefix("```") {
                    let label = label.trim();
                    let is_json = label.is_empty() || label.eq_ignore_ascii_case("json");
                    open = Some((is_json, Vec::new()));
                }
            }
            Some((is_json, body)) if t == "```" => {
                if is_json {
                    blocks.push(body.join("\n"));
                }
            }
            Some((is_json, mut body)) => {
                body.push(line);
                open = Some((is_json, body));
            }
        }
    }
    blocks
}
