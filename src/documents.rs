//! Filesystem [`DocumentStore`].
//!
//! Walks a configuration directory (e.g. a Home Assistant `/config`) and
//! exposes its YAML files by relative, `/`-separated path.
//!
//! # Filtering
//!
//! A file is listed when its relative path matches an include glob and no
//! exclude glob. Secrets, device registries, and Home Assistant's internal
//! `.storage` directory are always excluded, as is the backup directory.
//!
//! # Writes
//!
//! `write_atomic` writes to a temporary file in the target's directory,
//! fsyncs it, copies the original permissions, and renames it over the
//! target. A reader sees the old or the new content, never a mix.
//!
//! Backups are written to `<backup_dir>/<path>.<UTC timestamp>.bak` with
//! `create_new`, so an existing backup is never overwritten.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use config_advisor_core::document::{DocumentFilter, DocumentStore};
use config_advisor_core::models::{content_hash, Document};

use crate::config::DocumentsConfig;

/// Patterns that are never listed, regardless of configuration.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/secrets.yaml",
    "**/known_devices.yaml",
    "**/.storage/**",
    "**/.git/**",
];

struct Inner {
    root: PathBuf,
    backup_dir: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

/// Document store rooted at a directory on the local filesystem.
#[derive(Clone)]
pub struct FsDocumentStore {
    inner: Arc<Inner>,
}

impl FsDocumentStore {
    pub fn new(
        root: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        include_globs: &[String],
        exclude_globs: &[String],
        follow_symlinks: bool,
    ) -> Result<Self> {
        let root = absolute(&root.into())?;
        let backup_dir = absolute(&backup_dir.into())?;

        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(exclude_globs.iter().cloned());

        Ok(Self {
            inner: Arc::new(Inner {
                root,
                backup_dir,
                include: build_globset(include_globs)?,
                exclude: build_globset(&excludes)?,
                follow_symlinks,
            }),
        })
    }

    pub fn from_config(config: &DocumentsConfig) -> Result<Self> {
        Self::new(
            &config.root,
            &config.backup_dir,
            &config.include_globs,
            &config.exclude_globs,
            config.follow_symlinks,
        )
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn backup_dir(&self) -> &Path {
        &self.inner.backup_dir
    }
}

impl Inner {
    /// Map a relative document path onto the root, rejecting anything that
    /// could escape it.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if path.is_empty() {
            bail!("empty document path");
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => bail!("invalid document path: {}", path),
            }
        }
        Ok(self.root.join(rel))
    }

    fn is_selected(&self, rel: &str) -> bool {
        self.include.is_match(rel) && !self.exclude.is_match(rel)
    }

    fn walk(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            bail!("documents root does not exist: {}", self.root.display());
        }

        let backup_dir = self.backup_dir.clone();
        let walker = WalkDir::new(&self.root)
            .follow_links(self.follow_symlinks)
            .into_iter()
            .filter_entry(move |e| !e.path().starts_with(&backup_dir));

        let mut paths = Vec::new();
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            let rel = to_slash(relative);
            if self.is_selected(&rel) {
                paths.push(rel);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn list(&self, filter: &DocumentFilter) -> Result<Vec<String>> {
        if filter.paths.is_empty() {
            return self.walk();
        }

        let mut paths = Vec::with_capacity(filter.paths.len());
        for requested in &filter.paths {
            let rel = requested.trim_start_matches("./").to_string();
            let full = self.resolve(&rel)?;
            if !full.is_file() {
                bail!("document not found: {}", rel);
            }
            if self.exclude.is_match(&rel) || full.starts_with(&self.backup_dir) {
                bail!("document is excluded from analysis: {}", rel);
            }
            paths.push(rel);
        }
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    fn write_atomic(&self, path: &str, content: &str) -> Result<String> {
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .ok_or_else(|| anyhow!("document has no parent directory: {}", path))?;

        let mut tmp = NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;

        if let Ok(meta) = fs::metadata(&target) {
            fs::set_permissions(tmp.path(), meta.permissions())?;
        }

        tmp.persist(&target)
            .map_err(|e| anyhow!("Failed to replace {}: {}", target.display(), e.error))?;

        #[cfg(unix)]
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }

        Ok(content_hash(content))
    }

    fn backup(&self, path: &str, content: &str) -> Result<String> {
        // Validates the path even though nothing is written under root.
        self.resolve(path)?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let base = self.backup_dir.join(format!("{}.{}", path, stamp));
        if let Some(parent) = base.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create backup dir {}", parent.display()))?;
        }

        for attempt in 0..100u32 {
            let dest = if attempt == 0 {
                PathBuf::from(format!("{}.bak", base.display()))
            } else {
                PathBuf::from(format!("{}-{}.bak", base.display(), attempt))
            };
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&dest) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create {}", dest.display()))
                }
            };
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            return Ok(dest.display().to_string());
        }
        bail!("could not allocate a backup file for {}", path)
    }

    fn read_backup(&self, location: &str) -> Result<String> {
        let path = PathBuf::from(location);
        if !path.starts_with(&self.backup_dir)
            || path.components().any(|c| c == Component::ParentDir)
        {
            bail!("backup location is outside the backup directory: {}", location);
        }
        fs::read_to_string(&path).with_context(|| format!("Failed to read backup {}", location))
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<String>> {
        let inner = self.inner.clone();
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || inner.list(&filter)).await?
    }

    async fn read(&self, path: &str) -> Result<Document> {
        let full = self.inner.resolve(path)?;
        let content = tokio::fs::read_to_string(&full)
            .await
            .with_context(|| format!("Failed to read document {}", path))?;
        Ok(Document::new(path, content))
    }

    async fn write_atomic(&self, path: &str, content: &str) -> Result<String> {
        let inner = self.inner.clone();
        let (path, content) = (path.to_string(), content.to_string());
        tokio::task::spawn_blocking(move || inner.write_atomic(&path, &content)).await?
    }

    async fn backup(&self, path: &str, content: &str) -> Result<String> {
        let inner = self.inner.clone();
        let (path, content) = (path.to_string(), content.to_string());
        tokio::task::spawn_blocking(move || inner.backup(&path, &content)).await?
    }

    async fn read_backup(&self, location: &str) -> Result<String> {
        let inner = self.inner.clone();
        let location = location.to_string();
        tokio::task::spawn_blocking(move || inner.read_backup(&location)).await?
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
