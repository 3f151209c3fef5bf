//! Configuration management for share_search
//!
//! Supports loading configuration from TOML files with CLI overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::share::ShareDescriptor;

/// Telemetry / OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Enable OpenTelemetry trace export (default: false)
    /// Can be overridden by env var SSI_TRACING_ENABLED or OTEL_SDK_DISABLED
    #[serde(default)]
    pub enabled: bool,

    /// OTLP exporter endpoint (default: http://localhost:4317)
    /// Can be overridden by env var OTEL_EXPORTER_OTLP_ENDPOINT
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,

    /// Service name reported to the collector (default: share_search)
    /// Can be overridden by env var OTEL_SERVICE_NAME
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "share_search".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            service_name: default_service_name(),
        }
    }
}

impl TelemetryConfig {
    /// Apply environment variable overrides.
    /// Env vars take precedence over TOML config values.
    pub fn with_env_overrides(mut self) -> Self {
        // OTEL_SDK_DISABLED=true → disabled (official OTel convention)
        if let Ok(val) = std::env::var("OTEL_SDK_DISABLED") {
            if val.eq_ignore_ascii_case("true") {
                self.enabled = false;
            }
        }
        // SSI_TRACING_ENABLED=false → disabled (project-specific kill-switch)
        if let Ok(val) = std::env::var("SSI_TRACING_ENABLED") {
            self.enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }
        if let Ok(val) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            if !val.is_empty() {
                self.otlp_endpoint = val;
            }
        }
        if let Ok(val) = std::env::var("OTEL_SERVICE_NAME") {
            if !val.is_empty() {
                self.service_name = val;
            }
        }
        self
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Shares to index
    #[serde(default)]
    pub shares: Vec<ShareDescriptor>,
}

/// Server-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the HTTP API to
    #[serde(default = "default_address")]
    pub address: String,

    /// Build every enabled share at startup when no usable index is on disk
    #[serde(default = "default_true")]
    pub auto_index: bool,
}

/// Index-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Directory holding persisted indexes (default: platform data dir)
    #[serde(default)]
    pub index_dir: Option<PathBuf>,

    /// Persisted or in-memory indexes older than this are rebuilt (default: 1 day)
    #[serde(default = "default_max_cache_age_secs")]
    pub max_cache_age_secs: u64,

    /// Entries processed per crawl batch; also the listing fan-out for local shares
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Deepest directory level visited below a share root
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Concurrent directory listings against an SMB share
    #[serde(default = "default_smb_concurrency")]
    pub smb_concurrency: usize,

    /// Glob patterns matched against entry names; matching directories are not descended
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    #[serde(default)]
    pub incremental: IncrementalConfig,
}

/// Periodic change detection settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IncrementalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between cycles for each share (default: 120)
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Change ratio above which a full rebuild replaces the incremental patch
    #[serde(default = "default_full_rebuild_threshold")]
    pub full_rebuild_threshold: f64,
}

fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_cache_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_batch_size() -> usize {
    50
}

fn default_max_depth() -> usize {
    crate::index::MAX_CRAWL_DEPTH
}

fn default_smb_concurrency() -> usize {
    3
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        ".DS_Store".to_string(),
        "Thumbs.db".to_string(),
        "desktop.ini".to_string(),
        "@eaDir".to_string(),
        "$RECYCLE.BIN".to_string(),
        "System Volume Information".to_string(),
    ]
}

fn default_check_interval_secs() -> u64 {
    120
}

fn default_full_rebuild_threshold() -> f64 {
    crate::index::DEFAULT_CHANGE_THRESHOLD
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            auto_index: true,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_dir: None,
            max_cache_age_secs: default_max_cache_age_secs(),
            batch_size: default_batch_size(),
            max_depth: default_max_depth(),
            smb_concurrency: default_smb_concurrency(),
            exclude_patterns: default_exclude_patterns(),
            incremental: IncrementalConfig::default(),
        }
    }
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_check_interval_secs(),
            full_rebuild_threshold: default_full_rebuild_threshold(),
        }
    }
}

impl IndexConfig {
    /// Configured index directory, or `<data_local_dir>/share_search/indexes`
    pub fn resolved_index_dir(&self) -> PathBuf {
        if let Some(dir) = &self.index_dir {
            return dir.clone();
        }
        dirs::data_local_dir()
            .map(|d| d.join("share_search").join("indexes"))
            .unwrap_or_else(|| PathBuf::from(".share_search").join("indexes"))
    }

    pub fn max_cache_age(&self) -> Duration {
        Duration::from_secs(self.max_cache_age_secs)
    }
}

impl IncrementalConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    /// Reject settings that would make every cycle escalate or never fire
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.check_interval_secs > 0,
            "check_interval_secs must be greater than zero"
        );
        anyhow::ensure!(
            self.full_rebuild_threshold.is_finite() && self.full_rebuild_threshold >= 0.0,
            "full_rebuild_threshold must be a non-negative number, got {}",
            self.full_rebuild_threshold
        );
        Ok(())
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .index
            .incremental
            .validate()
            .with_context(|| format!("Invalid [index.incremental] in {}", path.display()))?;
        for share in &config.shares {
            crate::error::validate_share_id(&share.id)
                .with_context(|| format!("Invalid share in {}", path.display()))?;
        }

        Ok(config)
    }

    /// Try to load configuration from default locations
    ///
    /// Search order:
    /// 1. SSI_CONFIG environment variable
    /// 2. ./share_search.toml (current directory)
    /// 3. ~/.config/share_search/config.toml (user config)
    pub fn from_default_locations() -> Result<Option<(Self, PathBuf)>> {
        // Check environment variable first
        if let Ok(env_path) = std::env::var("SSI_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                let config = Self::from_file(&path)?;
                return Ok(Some((config, path)));
            }
        }

        // Check current directory
        let local_path = PathBuf::from("share_search.toml");
        if local_path.exists() {
            let config = Self::from_file(&local_path)?;
            return Ok(Some((config, local_path)));
        }

        // Check user config directory
        if let Some(config_dir) = dirs::config_dir() {
            let user_path = config_dir.join("share_search").join("config.toml");
            if user_path.exists() {
                let config = Self::from_file(&user_path)?;
                return Ok(Some((config, user_path)));
            }
        }

        Ok(None)
    }

    /// Generate a template configuration file
    pub fn generate_template() -> String {
        r#"# Share Search Configuration
# Generated template - customize as needed

[server]
# Address to bind the HTTP API to
address = "0.0.0.0:8080"

# Build indexes for enabled shares at startup if nothing usable is on disk
auto_index = true

[index]
# Where persisted indexes live (default: platform data directory)
# index_dir = "/var/lib/share_search/indexes"

# Indexes older than this are rebuilt instead of loaded (seconds, default: 1 day)
max_cache_age_secs = 86400

# Entries processed per crawl batch
batch_size = 50

# Deepest directory level crawled below a share root (at most 20)
max_depth = 20

# Concurrent directory listings against SMB shares
smb_concurrency = 3

# Entry names to skip; matching directories are not descended
exclude_patterns = [
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "@eaDir",
    "$RECYCLE.BIN",
    "System Volume Information",
]

[index.incremental]
# Periodically detect and apply filesystem changes
enabled = true

# Seconds between change checks for each share
check_interval_secs = 120

# Fraction of changed entries above which a full rebuild is done instead
full_rebuild_threshold = 0.3

# Shares to index. SMB shares are crawled through their local mount point.
# [[shares]]
# id = "media"
# kind = "local"
# root = "/srv/media"
#
# [[shares]]
# id = "nas"
# kind = "smb"
# root = "/mnt/nas"
# host = "nas.local"
# username = "guest"

[telemetry]
# Enable OpenTelemetry trace export (default: false)
# Set to true to enable OTLP export (console logging is always active)
# Env overrides: OTEL_SDK_DISABLED=true, SSI_TRACING_ENABLED=true
enabled = false

# OTLP gRPC exporter endpoint (default: http://localhost:4317)
# Env override: OTEL_EXPORTER_OTLP_ENDPOINT
otlp_endpoint = "http://localhost:4317"

# Service name reported to the collector
# Env override: OTEL_SERVICE_NAME
service_name = "share_search"
"#
        .to_string()
    }

    /// Write template config to the specified path
    pub fn write_template(path: &Path) -> Result<()> {
        let template = Self::generate_template();

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        std::fs::write(path, template)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Merge CLI overrides into the configuration
    pub fn with_overrides(
        mut self,
        address: Option<String>,
        index_dir: Option<PathBuf>,
        no_auto_index: bool,
    ) -> Self {
        if let Some(addr) = address {
            self.server.address = addr;
        }
        if let Some(dir) = index_dir {
            self.index.index_dir = Some(dir);
        }
        if no_auto_index {
            self.server.auto_index = false;
        }
        self
    }
}
