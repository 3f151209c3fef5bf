pub mod changes;
pub mod crawler;
pub mod entry;
pub mod fingerprint;
pub mod persistence;
pub mod tokenizer;

pub use changes::{Delta, DEFAULT_CHANGE_THRESHOLD};
pub use crawler::{CrawlMode, Crawler, CrawlerConfig, Snapshot, MAX_CRAWL_DEPTH};
pub use entry::{
    ChangeCounts, EntryKind, FingerprintMap, IndexEntry, IndexMetadata, IndexStatus, ShareIndex,
};
pub use fingerprint::{entries_digest, fingerprint, fingerprint_entry, rebuild_fingerprints};
pub use persistence::{ArtifactState, DiskInspection, PersistenceManager};
pub use tokenizer::tokenize;
