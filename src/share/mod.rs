//! Share descriptors and the collaborators the index core consumes.
//!
//! Share configuration storage and the per-backend listing adapters live
//! outside the index engine; the engine only sees them through
//! [`ShareRegistry`] and [`DirectoryLister`].

pub mod lister;

pub use lister::{DirectoryLister, ListedEntry, Listers, LocalLister, MountedSmbLister};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::RwLock;

/// Backing store of a share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareKind {
    Local,
    Smb,
}

/// Everything the index core needs to know about a configured share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareDescriptor {
    pub id: String,
    pub kind: ShareKind,
    /// Local directory, or the mount point of an SMB export
    pub root: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SMB server host (informational, connection is handled by the mount)
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ShareDescriptor {
    pub fn local(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            kind: ShareKind::Local,
            root: root.into(),
            enabled: true,
            host: None,
            username: None,
        }
    }
}

/// Read access to share configuration records
pub trait ShareRegistry: Send + Sync {
    fn get(&self, share_id: &str) -> Option<ShareDescriptor>;
    fn list(&self) -> Vec<ShareDescriptor>;
}

/// In-memory share registry seeded from the config file.
///
/// Records can be changed at runtime, which is how share removal and
/// disabling reach the incremental updater.
#[derive(Debug, Default)]
pub struct StaticShareRegistry {
    shares: RwLock<Vec<ShareDescriptor>>,
}

impl StaticShareRegistry {
    pub fn new(shares: Vec<ShareDescriptor>) -> Self {
        Self {
            shares: RwLock::new(shares),
        }
    }

    /// Insert a share, replacing any record with the same id
    pub fn upsert(&self, share: ShareDescriptor) {
        let mut shares = self.shares.write().unwrap_or_else(|e| e.into_inner());
        shares.retain(|s| s.id != share.id);
        shares.push(share);
    }

    pub fn remove(&self, share_id: &str) -> bool {
        let mut shares = self.shares.write().unwrap_or_else(|e| e.into_inner());
        let before = shares.len();
        shares.retain(|s| s.id != share_id);
        shares.len() != before
    }

    pub fn set_enabled(&self, share_id: &str, enabled: bool) -> bool {
        let mut shares = self.shares.write().unwrap_or_else(|e| e.into_inner());
        match shares.iter_mut().find(|s| s.id == share_id) {
            Some(share) => {
                share.enabled = enabled;
                true
            }
            None => false,
        }
    }
}

impl ShareRegistry for StaticShareRegistry {
    fn get(&self, share_id: &str) -> Option<ShareDescriptor> {
        self.shares
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|s| s.id == share_id)
            .cloned()
    }

    fn list(&self) -> Vec<ShareDescriptor> {
        self.shares
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
