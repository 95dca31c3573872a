/*!
Filesystem change events consumed by the backup pipeline.

Events are produced outside this crate (a watcher, a directory walk) and handed to
[`BackupService::submit_change`](crate::service::BackupService::submit_change).
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Kind of change observed on a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Modify,
    Delete,
    Rename,
    Chmod,
    /// Explicit request, e.g. a one-shot backup of a directory
    Manual,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Modify => "modify",
            Operation::Delete => "delete",
            Operation::Rename => "rename",
            Operation::Chmod => "chmod",
            Operation::Manual => "manual",
        }
    }

    /// Operations that change content and are always worth a look
    pub fn is_content_change(&self) -> bool {
        matches!(
            self,
            Operation::Create | Operation::Modify | Operation::Manual
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = crate::BackupError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Operation::Create),
            "modify" | "write" => Ok(Operation::Modify),
            "delete" | "remove" => Ok(Operation::Delete),
            "rename" => Ok(Operation::Rename),
            "chmod" => Ok(Operation::Chmod),
            "manual" => Ok(Operation::Manual),
            other => Err(crate::BackupError::validation(format!(
                "unknown operation '{other}'"
            ))),
        }
    }
}

/// A single observed change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub operation: Operation,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
    pub is_directory: bool,
}

impl ChangeEvent {
    /// Build an event stamped with the current time
    pub fn new(path: impl Into<PathBuf>, operation: Operation, size: u64) -> Self {
        Self {
            path: path.into(),
            operation,
            timestamp: Utc::now(),
            size,
            is_directory: false,
        }
    }

    /// Build an event for a directory
    pub fn directory(path: impl Into<PathBuf>, operation: Operation) -> Self {
        Self {
            is_directory: true,
            ..Self::new(path, operation, 0)
        }
    }

    /// Build a `manual` event from the file currently on disk
    pub fn manual_for(path: &Path) -> crate::Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| crate::BackupError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            operation: Operation::Manual,
            timestamp: Utc::now(),
            size: metadata.len(),
            is_directory: metadata.is_dir(),
        })
    }
}

/// A unit of work owned by the queue until one worker receives it
pub type BackupTask = ChangeEvent;
