//! YAML structural validation.
//!
//! A replacement document is only acceptable if it parses, survives a
//! serialize/re-parse round trip unchanged, and keeps the top-level layout
//! of the document it replaces: the same number of YAML documents, the same
//! top-level shape (mapping, sequence, scalar), and every top-level mapping
//! key of the original.
//!
//! Home Assistant style local tags (`!include`, `!secret`, `!input`) parse as
//! tagged values and are compared like any other value.

use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;

/// Why a text failed structural validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StructureError {
    #[error("yaml parse error: {0}")]
    Parse(String),

    #[error("document {index} does not round-trip through the yaml serializer")]
    RoundTrip { index: usize },

    #[error("expected {expected} yaml document(s), found {found}")]
    DocumentCount { expected: usize, found: usize },

    #[error("document {index}: top-level shape changed from {expected} to {found}")]
    ShapeChanged {
        index: usize,
        expected: Shape,
        found: Shape,
    },

    #[error("document {index}: top-level key '{key}' was removed")]
    MissingKey { index: usize, key: String },
}

/// Coarse kind of a top-level YAML node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Null,
    Scalar,
    Sequence,
    Mapping,
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Shape::Null => "null",
            Shape::Scalar => "scalar",
            Shape::Sequence => "sequence",
            Shape::Mapping => "mapping",
        })
    }
}

/// Shape of `value`, looking through tags.
pub fn shape_of(value: &Value) -> Shape {
    match value {
        Value::Null => Shape::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => Shape::Scalar,
        Value::Sequence(_) => Shape::Sequence,
        Value::Mapping(_) => Shape::Mapping,
        Value::Tagged(tagged) => shape_of(&tagged.value),
    }
}

/// Parse every YAML document in `text`.
///
/// A text with no documents (empty, or comments only) yields an empty list.
pub fn parse(text: &str) -> Result<Vec<Value>, StructureError> {
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(de).map_err(|e| StructureError::Parse(e.to_string()))?;
        docs.push(value);
    }
    Ok(docs)
}

/// Check that `text` parses and that every document survives a round trip.
pub fn validate(text: &str) -> Result<Vec<Value>, StructureError> {
    let docs = parse(text)?;
    for (index, value) in docs.iter().enumerate() {
        check_round_trip(index, value)?;
    }
    Ok(docs)
}

/// Validate `replacement` as a stand-in for `original`.
///
/// If `original` itself does not parse, only `replacement`'s own validity is
/// checked.
pub fn validate_replacement(original: &str, replacement: &str) -> Result<(), StructureError> {
    let new_docs = validate(replacement)?;
    let Ok(old_docs) = parse(original) else {
        return Ok(());
    };

    if old_docs.len() != new_docs.len() {
        return Err(StructureError::DocumentCount {
            expected: old_docs.len(),
            found: new_docs.len(),
        });
    }

    for (index, (old, new)) in old_docs.iter().zip(&new_docs).enumerate() {
        let (expected, found) = (shape_of(old), shape_of(new));
        if expected != found {
            return Err(StructureError::ShapeChanged {
                index,
                expected,
                found,
            });
        }
        if let (Some(old_map), Some(new_map)) = (as_mapping(old), as_mapping(new)) {
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    return Err(StructureError::MissingKey {
                        index,
                        key: key_label(key),
                    });
                }
            }
        }
    }
    Ok(())
}

fn check_round_trip(index: usize, value: &Value) -> Result<(), StructureError> {
    let serialized =
        serde_yaml::to_string(value).map_err(|_| StructureError::RoundTrip { index })?;
    let reparsed: Value =
        serde_yaml::from_str(&serialized).map_err(|_| StructureError::RoundTrip { index })?;
    if &reparsed == value {
        return Ok(());
    }
    // NaN never compares equal; fall back to a textual fixpoint.
    match serde_yaml::to_string(&reparsed) {
        Ok(again) if again == serialized => Ok(()),
        _ => Err(StructureError::RoundTrip { index }),
    }
}

fn as_mapping(value: &Value) -> Option<&serde_yaml::Mapping> {
    match value {
        Value::Mapping(m) => Some(m),
        Value::Tagged(tagged) => as_mapping(&tagged.value),
        _ => None,
    }
}

fn key_label(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|_| format!("{:?}", other)),
    }
}
