//! share_search - name/metadata search over local and SMB file shares
//!
//! Each configured share gets an in-memory index of its files and folders,
//! persisted to disk with atomic writes and kept fresh by periodic
//! incremental cycles. [`IndexRegistry`] is the single entry point used by
//! the HTTP layer.

pub mod config;
pub mod error;
pub mod index;
pub mod indexer;
pub mod registry;
pub mod search;
pub mod share;
pub mod telemetry;
pub mod utils;
pub mod web;

pub use config::Config;
pub use error::{IndexError, Result};
pub use registry::IndexRegistry;
