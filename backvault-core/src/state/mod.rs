/*!
Durable per-file backup state and backup history.

The [`StateStore`] trait is the seam between the pipeline and its persistence
engine. Two implementations ship with the crate:

- [`MemoryStateStore`]: maps behind a reader/writer lock, for tests and one-shot runs
- [`SqliteStateStore`]: `file_states` and `backup_records` tables in a SQLite file
*/

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStateStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStateStore;

use crate::event::Operation;
use crate::transform::TransformFlags;
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Outcome of the last backup attempt for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Success,
    Failed,
    Deleted,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Success => "success",
            BackupStatus::Failed => "failed",
            BackupStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(BackupStatus::Success),
            "failed" => Ok(BackupStatus::Failed),
            "deleted" => Ok(BackupStatus::Deleted),
            other => Err(BackupError::validation(format!("unknown status '{other}'"))),
        }
    }
}

/// Last known backup state of a single path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBackupState {
    pub last_checksum: String,
    pub last_backup_time: DateTime<Utc>,
    pub backup_count: u64,
    pub status: BackupStatus,
}

impl FileBackupState {
    /// True when the stored copy already matches `checksum`
    pub fn is_current(&self, checksum: &str) -> bool {
        self.status == BackupStatus::Success && self.last_checksum == checksum
    }
}

/// One row of backup history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub file_path: PathBuf,
    pub file_id: String,
    pub checksum: String,
    pub original_size: u64,
    pub transformed_size: u64,
    pub transform_flags: TransformFlags,
    pub backup_time: DateTime<Utc>,
    pub status: BackupStatus,
    pub error_message: Option<String>,
    pub operation: Operation,
}

/// Filter for [`StateStore::search`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
    /// Substring the record path must contain
    pub path_contains: Option<String>,
    pub status: Option<BackupStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Maximum rows returned; `None` means [`SearchCriteria::DEFAULT_LIMIT`]
    pub limit: Option<usize>,
}

impl SearchCriteria {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }

    /// Whether `record` passes every filter (the limit is not considered)
    pub fn matches(&self, record: &BackupRecord) -> bool {
        if let Some(fragment) = &self.path_contains {
            if !record.file_path.to_string_lossy().contains(fragment.as_str()) {
                return false;
            }
        }
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if self.start_time.is_some_and(|t| record.backup_time < t) {
            return false;
        }
        if self.end_time.is_some_and(|t| record.backup_time > t) {
            return false;
        }
        true
    }
}

/// Aggregate counters over the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStats {
    /// Paths with a recorded state
    pub total_files: u64,
    pub successful_files: u64,
    pub failed_files: u64,
    pub deleted_files: u64,
    /// Sum over successful history rows
    pub total_original_size: u64,
    pub total_transformed_size: u64,
    /// History rows written in the last 24 hours
    pub recent_backups_24h: u64,
}

/// Persistence seam for backup state
///
/// Implementations must tolerate concurrent callers. The pipeline serialises work
/// per path, so two writes for the same path never race.
#[cfg_attr(test, mockall::automock)]
pub trait StateStore: Send + Sync {
    /// Current state of `path`, if any
    fn get(&self, path: &Path) -> Result<Option<FileBackupState>>;

    /// Replace the state of `path`
    fn set(&self, path: &Path, state: FileBackupState) -> Result<()>;

    /// Insert a history row; an existing row with the same path and checksum is replaced
    fn record(&self, record: BackupRecord) -> Result<()>;

    /// History rows matching `criteria`, newest first
    fn search(&self, criteria: &SearchCriteria) -> Result<Vec<BackupRecord>>;

    /// History of a single path, newest first
    fn history(&self, path: &Path, limit: usize) -> Result<Vec<BackupRecord>>;

    fn stats(&self) -> Result<BackupStats>;

    /// Forget `deleted` states last touched before `older_than`
    ///
    /// # Returns
    /// Number of states removed
    fn purge_deleted(&self, older_than: DateTime<Utc>) -> Result<usize>;

    /// Drop successful history rows written before `older_than`
    ///
    /// # Returns
    /// Number of rows removed
    fn cleanup_records(&self, older_than: DateTime<Utc>) -> Result<usize>;
}
