//! # Config Advisor Core
//!
//! Shared, I/O-free logic for Config Advisor: data models, the budgeted
//! document chunker, the YAML structural validator, the proposal extractor,
//! the proposal and run state machines, and the storage traits.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. The native crate
//! wires these pieces to SQLite, the filesystem, and analysis backends.

pub mod chunk;
pub mod document;
pub mod extract;
pub mod lifecycle;
pub mod models;
pub mod store;
pub mod structure;
