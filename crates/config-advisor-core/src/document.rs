//! Document access abstraction.
//!
//! The [`DocumentStore`] trait is the only way the rest of the system reads
//! or writes configuration text. The native crate provides a filesystem
//! implementation; [`MemoryDocumentStore`] backs tests and can be told to
//! fail writes or backups.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{content_hash, Document};

/// Which documents a run should cover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFilter {
    /// Explicit document paths. Empty means every document the store lists.
    #[serde(default)]
    pub paths: Vec<String>,
}

impl DocumentFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

/// Read/write access to path-addressable configuration documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Paths matching `filter`, sorted. Explicit paths that do not exist are
    /// an error.
    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<String>>;

    /// Current content and hash of `path`.
    async fn read(&self, path: &str) -> Result<Document>;

    /// Replace the content of `path` in one step. Returns the new hash.
    async fn write_atomic(&self, path: &str, content: &str) -> Result<String>;

    /// Store a copy of `content` taken from `path`. Returns the backup
    /// location.
    async fn backup(&self, path: &str, content: &str) -> Result<String>;

    /// Content of a backup previously returned by [`DocumentStore::backup`].
    async fn read_backup(&self, location: &str) -> Result<String>;
}

/// A stored backup in a [`MemoryDocumentStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBackup {
    pub path: String,
    pub location: String,
    pub content: String,
}

/// In-memory document store for tests.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<BTreeMap<String, String>>,
    backups: RwLock<Vec<MemoryBackup>>,
    fail_writes: AtomicBool,
    fail_backups: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents<I, P, C>(docs: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        let store = Self::new();
        for (path, content) in docs {
            store.put(path, content);
        }
        store
    }

    /// Set `path` to `content` directly, as an outside editor would.
    pub fn put(&self, path: impl Into<String>, content: impl Into<String>) {
        self.docs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), content.into());
    }

    pub fn content(&self, path: &str) -> Option<String> {
        self.docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    pub fn backups(&self) -> Vec<MemoryBackup> {
        self.backups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make every subsequent `write_atomic` fail without touching content.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_backups(&self, fail: bool) {
        self.fail_backups.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<String>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        if filter.paths.is_empty() {
            return Ok(docs.keys().cloned().collect());
        }
        let mut out = Vec::with_capacity(filter.paths.len());
        for path in &filter.paths {
            if !docs.contains_key(path) {
                bail!("document not found: {}", path);
            }
            out.push(path.clone());
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn read(&self, path: &str) -> Result<Document> {
        match self.content(path) {
            Some(content) => Ok(Document::new(path, content)),
            None => bail!("document not found: {}", path),
        }
    }

    async fn write_atomic(&self, path: &str, content: &str) -> Result<String> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("simulated write failure for {}", path);
        }
        self.put(path, content);
        Ok(content_hash(content))
    }

    async fn backup(&self, path: &str, content: &str) -> Result<String> {
        if self.fail_backups.load(Ordering::SeqCst) {
            bail!("simulated backup failure for {}", path);
        }
        let mut backups = self.backups.write().unwrap_or_else(PoisonError::into_inner);
        let location = format!("memory://backups/{}.{}.bak", path, backups.len());
        backups.push(MemoryBackup {
            path: path.to_string(),
            location: location.clone(),
            content: content.to_string(),
        });
        Ok(location)
    }

    async fn read_backup(&self, location: &str) -> Result<String> {
        match self.backups().into_iter().find(|b| b.location == location) {
            Some(b) => Ok(b.content),
            None => bail!("backup not found: {}", location),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_all_and_explicit() {
        let store = MemoryDocumentStore::with_documents([("b.yaml", "b: 1\n"), ("a.yaml", "a: 1\n")]);
        assert_eq!(
            store.list_documents(&DocumentFilter::all()).await.unwrap(),
            vec!["a.yaml", "b.yaml"]
        );
        assert_eq!(
            store
                .list_documents(&DocumentFilter::paths(["b.yaml"]))
                .await
                .unwrap(),
            vec!["b.yaml"]
        );
        assert!(store
            .list_documents(&DocumentFilter::paths(["missing.yaml"]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_content() {
        let store = MemoryDocumentStore::with_documents([("a.yaml", "a: 1\n")]);
        store.set_fail_writes(true);
        assert!(store.write_atomic("a.yaml", "a: 2\n").await.is_err());
        assert_eq!(store.content("a.yaml").as_deref(), Some("a: 1\n"));

        store.set_fail_writes(false);
        let hash = store.write_atomic("a.yaml", "a: 2\n").await.unwrap();
        assert_eq!(hash, store.read("a.yaml").await.unwrap().content_hash);
    }

    #[tokio::test]
    async fn test_backups_are_distinct() {
        let store = MemoryDocumentStore::new();
        let l1 = store.backup("a.yaml", "one").await.unwrap();
        let l2 = store.backup("a.yaml", "two").await.unwrap();
        assert_ne!(l1, l2);
        assert_eq!(store.backups().len(), 2);
        assert_eq!(store.read_backup(&l1).await.unwrap(), "one");
        assert!(store.read_backup("memory://nope").await.is_err());
    }
}
