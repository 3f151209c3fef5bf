//! Directory listing adapters.
//!
//! A lister answers one question: what is directly inside `relative_path` of a
//! share. Failures are per call; the crawler decides what a failure means.

use super::{ShareDescriptor, ShareKind};
use crate::index::EntryKind;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// One child reported by a [`DirectoryLister`]
#[derive(Debug, Clone, PartialEq)]
pub struct ListedEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Stable file identity when the backend exposes one
    pub inode: Option<u64>,
}

#[async_trait]
pub trait DirectoryLister: Send + Sync {
    /// List the direct children of `relative_path` ("/" is the share root).
    async fn list(&self, share: &ShareDescriptor, relative_path: &str) -> Result<Vec<ListedEntry>>;

    /// Upper bound on directories listed concurrently, if the backend needs one.
    fn max_concurrency(&self) -> Option<usize> {
        None
    }
}

/// Lists directories on a locally reachable filesystem.
#[derive(Debug, Default, Clone)]
pub struct LocalLister;

impl LocalLister {
    /// Map a share-relative path onto the share root, refusing to escape it.
    fn resolve(root: &Path, relative_path: &str) -> Result<PathBuf> {
        let relative = Path::new(relative_path.trim_start_matches('/'));
        let mut resolved = root.to_path_buf();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => anyhow::bail!("Path escapes share root: {}", relative_path),
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl DirectoryLister for LocalLister {
    async fn list(&self, share: &ShareDescriptor, relative_path: &str) -> Result<Vec<ListedEntry>> {
        let dir = Self::resolve(&share.root, relative_path)?;
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .with_context(|| format!("Failed to iterate directory: {}", dir.display()))?
        {
            let path = entry.path();
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    debug!(name = ?raw, dir = %dir.display(), "Skipping non UTF-8 name");
                    continue;
                }
            };

            // Follows symlinks; dangling links fail here and are skipped
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            let kind = if metadata.is_dir() {
                EntryKind::Directory
            } else if metadata.is_file() {
                EntryKind::File
            } else {
                continue;
            };

            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

            entries.push(ListedEntry {
                name,
                kind,
                size: if kind == EntryKind::File { metadata.len() } else { 0 },
                modified: DateTime::<Utc>::from(modified),
                inode: inode_of(&metadata),
            });
        }

        Ok(entries)
    }
}

#[cfg(unix)]
fn inode_of(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn inode_of(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Lists an SMB export through its local mount point.
///
/// SMB servers throttle aggressive clients, so recursion is capped.
#[derive(Debug, Clone)]
pub struct MountedSmbLister {
    inner: LocalLister,
    concurrency: usize,
}

impl MountedSmbLister {
    pub fn new(concurrency: usize) -> Self {
        Self {
            inner: LocalLister,
            concurrency: concurrency.max(1),
        }
    }
}

#[async_trait]
impl DirectoryLister for MountedSmbLister {
    async fn list(&self, share: &ShareDescriptor, relative_path: &str) -> Result<Vec<ListedEntry>> {
        self.inner.list(share, relative_path).await
    }

    fn max_concurrency(&self) -> Option<usize> {
        Some(self.concurrency)
    }
}

/// Lister lookup by share type, resolved once at startup
#[derive(Clone)]
pub struct Listers {
    local: Arc<dyn DirectoryLister>,
    smb: Arc<dyn DirectoryLister>,
}

impl Listers {
    pub fn new(local: Arc<dyn DirectoryLister>, smb: Arc<dyn DirectoryLister>) -> Self {
        Self { local, smb }
    }

    /// Default adapters: local disk plus mounted SMB with the given cap
    pub fn standard(smb_concurrency: usize) -> Self {
        Self::new(
            Arc::new(LocalLister),
            Arc::new(MountedSmbLister::new(smb_concurrency)),
        )
    }

    /// Use one lister for every share type
    pub fn uniform(lister: Arc<dyn DirectoryLister>) -> Self {
        Self::new(lister.clone(), lister)
    }

    pub fn for_kind(&self, kind: ShareKind) -> Arc<dyn DirectoryLister> {
        match kind {
            ShareKind::Local => self.local.clone(),
            ShareKind::Smb => self.smb.clone(),
        }
    }
}
