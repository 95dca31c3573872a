/*!
Change classification: decides whether an event is worth queueing.
*/

use crate::event::{ChangeEvent, Operation};
use crate::state::{BackupStatus, FileBackupState};
use tracing::{debug, warn};

/// Default upper bound on file size (1 GiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Gate in front of the task queue
#[derive(Debug, Clone, Copy)]
pub struct ChangeClassifier {
    max_file_size: u64,
}

impl Default for ChangeClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_SIZE)
    }
}

impl ChangeClassifier {
    pub fn new(max_file_size: u64) -> Self {
        Self { max_file_size }
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Whether `event` needs a backup task, given the path's current state
    ///
    /// Content changes are always accepted; the worker's checksum comparison
    /// filters out no-op writes later. Metadata-only changes (`chmod`, `rename`)
    /// are accepted only when there is no good backup on record.
    pub fn should_backup(&self, event: &ChangeEvent, state: Option<&FileBackupState>) -> bool {
        if event.is_directory {
            debug!(path = %event.path.display(), "Skipping directory");
            return false;
        }

        if event.size > self.max_file_size {
            warn!(
                path = %event.path.display(),
                size = event.size,
                max_size = self.max_file_size,
                "File too large for backup"
            );
            return false;
        }

        if event.operation.is_content_change() || event.operation == Operation::Delete {
            return true;
        }

        // Metadata-only changes matter for files not yet safely stored
        match state {
            None => true,
            Some(s) => matches!(s.status, BackupStatus::Failed | BackupStatus::Deleted),
        }
    }
}
