//! Configuration file handling
//!
//! Backvault reads a single TOML file with one table per concern. Every field has a
//! default, so a minimal file only needs API credentials and the directories to back
//! up:
//!
//! ```toml
//! [api]
//! client_id = "..."
//! client_secret = "..."
//!
//! [backup]
//! directories = ["/srv/data"]
//! ```

use crate::classifier::DEFAULT_MAX_FILE_SIZE;
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::restore::{RestoreOptions, DEFAULT_RESTORE_WORKERS};
use crate::service::BackupServiceConfig;
use crate::transform::compression::DEFAULT_LEVEL;
use crate::transform::{CompressionAlgorithm, TransformConfig};
use crate::{BackupError, Result};
use backvault_retry::RetryPolicy;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "backvault.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Remote directory uploads land in; empty means the account default
    pub directory_id: String,
    /// Per-attempt timeout in seconds
    pub timeout: u64,
    pub retry_count: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            directory_id: String::new(),
            timeout: 30,
            retry_count: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub directories: Vec<PathBuf>,
    /// Base-name globs (`*`, `?`) or path prefixes to skip
    pub exclude_patterns: Vec<String>,
    pub max_file_size: u64,
    /// Worker count; 0 means one per CPU
    pub concurrent: usize,
    pub queue_capacity: usize,
    pub compression: CompressionSettings,
    pub encryption: EncryptionSettings,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            exclude_patterns: Vec::new(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            concurrent: 5,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            compression: CompressionSettings::default(),
            encryption: EncryptionSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    pub enabled: bool,
    pub level: u32,
    /// `gzip`, `zlib` or `deflate`
    pub format: String,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: DEFAULT_LEVEL,
            format: "gzip".to_string(),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionSettings {
    pub enabled: bool,
    pub password: String,
}

impl std::fmt::Debug for EncryptionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionSettings")
            .field("enabled", &self.enabled)
            .field("password", &if self.password.is_empty() { "" } else { "<redacted>" })
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    pub concurrent: usize,
    pub keep_transformed: bool,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            concurrent: DEFAULT_RESTORE_WORKERS,
            keep_transformed: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub directory: PathBuf,
    pub format: String,
    /// Number of report files kept
    pub retention: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./reports"),
            format: "json".to_string(),
            retention: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// `json` or `text`
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl LogConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// Days of history kept by cleanup
    pub retention_days: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./backup.db"),
            retention_days: 90,
        }
    }
}

impl Config {
    /// Read a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| BackupError::io(path, e))?;
        toml::from_str(&content)
            .map_err(|e| BackupError::config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Load `path` if given, else `backvault.toml` in the working directory if
    /// present, else the defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    Self::load(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| BackupError::config(format!("failed to serialize config: {e}")))?;
        fs::write(path, content).map_err(|e| BackupError::io(path, e))
    }

    /// Settings needed to talk to the remote API
    pub fn validate_api(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(BackupError::config("api.base_url is required"));
        }
        if self.api.client_id.trim().is_empty() {
            return Err(BackupError::config(
                "api.client_id is required (config file or BACKVAULT_CLIENT_ID)",
            ));
        }
        if self.api.client_secret.trim().is_empty() {
            return Err(BackupError::config(
                "api.client_secret is required (config file or BACKVAULT_CLIENT_SECRET)",
            ));
        }
        Ok(())
    }

    /// Settings that shape uploaded content
    pub fn validate_transform(&self) -> Result<()> {
        if self.backup.compression.enabled {
            self.compression_algorithm()?;
        }
        if self.backup.encryption.enabled && self.backup.encryption.password.is_empty() {
            return Err(BackupError::config(
                "backup.encryption.password is required when encryption is enabled",
            ));
        }
        Ok(())
    }

    /// Full validation for a watch-style run over the configured directories
    pub fn validate(&self) -> Result<()> {
        self.validate_api()?;
        if self.backup.directories.is_empty() {
            return Err(BackupError::config(
                "at least one backup directory must be specified",
            ));
        }
        self.exclude_set()?;
        self.validate_transform()
    }

    fn compression_algorithm(&self) -> Result<CompressionAlgorithm> {
        let format = self.backup.compression.format.trim();
        match format.parse::<CompressionAlgorithm>() {
            Ok(CompressionAlgorithm::None) | Err(_) => Err(BackupError::config(format!(
                "unknown compression format '{format}' (expected gzip, zlib or deflate)"
            ))),
            Ok(algorithm) => Ok(algorithm),
        }
    }

    pub fn transform_config(&self) -> Result<TransformConfig> {
        self.validate_transform()?;

        let mut config = if self.backup.compression.enabled {
            TransformConfig::new(self.compression_algorithm()?, self.backup.compression.level)
        } else {
            TransformConfig::default()
        };
        if self.backup.encryption.enabled {
            config = config.with_password(self.backup.encryption.password.clone());
        }
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.api.retry_count)
    }

    #[cfg(feature = "http")]
    pub fn http_network_config(&self) -> crate::network::HttpNetworkConfig {
        crate::network::HttpNetworkConfig {
            base_url: self.api.base_url.clone(),
            client_id: self.api.client_id.clone(),
            client_secret: self.api.client_secret.clone(),
            directory_id: Some(self.api.directory_id.clone()).filter(|d| !d.is_empty()),
            timeout: Duration::from_secs(self.api.timeout.max(1)),
            retry: self.retry_policy(),
        }
    }

    pub fn service_config(&self) -> BackupServiceConfig {
        BackupServiceConfig {
            max_file_size: self.backup.max_file_size,
            workers: self.backup.concurrent,
            queue_capacity: self.backup.queue_capacity,
        }
    }

    pub fn restore_options(&self) -> RestoreOptions {
        RestoreOptions {
            workers: if self.restore.concurrent == 0 {
                num_cpus::get()
            } else {
                self.restore.concurrent
            },
            keep_transformed: self.restore.keep_transformed,
        }
    }

    pub fn history_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.database.retention_days))
    }

    /// Compile `backup.exclude_patterns` once for use during a walk
    pub fn exclude_set(&self) -> Result<ExcludeSet> {
        ExcludeSet::new(&self.backup.exclude_patterns)
    }
}

/// Compiled exclude patterns.
///
/// A path is excluded when its file name matches one of the globs, when one of its
/// components equals a pattern verbatim, or when it lies under a pattern used as a
/// path prefix.
#[derive(Debug, Clone)]
pub struct ExcludeSet {
    globs: GlobSet,
    patterns: Vec<String>,
}

impl ExcludeSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = Glob::new(pattern).map_err(|e| {
                BackupError::config(format!("invalid exclude pattern '{pattern}': {e}"))
            })?;
            builder.add(glob);
        }
        let globs = builder
            .build()
            .map_err(|e| BackupError::config(format!("invalid exclude patterns: {e}")))?;

        Ok(Self {
            globs,
            patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        if let Some(name) = path.file_name() {
            if self.globs.is_match(name) {
                return true;
            }
        }
        self.patterns.iter().any(|pattern| {
            path.components()
                .any(|c| c.as_os_str().to_string_lossy() == pattern.as_str())
                || path.starts_with(pattern)
        })
    }
}
