use super::{BackupRecord, BackupStats, BackupStatus, FileBackupState, SearchCriteria, StateStore};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<PathBuf, FileBackupState>,
    records: Vec<BackupRecord>,
}

/// In-memory [`StateStore`]; contents are lost when dropped
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: RwLock<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn newest_first(mut rows: Vec<BackupRecord>, limit: usize) -> Vec<BackupRecord> {
        rows.sort_by(|a, b| b.backup_time.cmp(&a.backup_time));
        rows.truncate(limit);
        rows
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, path: &Path) -> Result<Option<FileBackupState>> {
        Ok(self.inner.read().states.get(path).cloned())
    }

    fn set(&self, path: &Path, state: FileBackupState) -> Result<()> {
        self.inner.write().states.insert(path.to_path_buf(), state);
        Ok(())
    }

    fn record(&self, record: BackupRecord) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .records
            .retain(|r| !(r.file_path == record.file_path && r.checksum == record.checksum));
        inner.records.push(record);
        Ok(())
    }

    fn search(&self, criteria: &SearchCriteria) -> Result<Vec<BackupRecord>> {
        let rows = self
            .inner
            .read()
            .records
            .iter()
            .filter(|r| criteria.matches(r))
            .cloned()
            .collect();
        Ok(Self::newest_first(rows, criteria.effective_limit()))
    }

    fn history(&self, path: &Path, limit: usize) -> Result<Vec<BackupRecord>> {
        let rows = self
            .inner
            .read()
            .records
            .iter()
            .filter(|r| r.file_path == path)
            .cloned()
            .collect();
        Ok(Self::newest_first(rows, limit))
    }

    fn stats(&self) -> Result<BackupStats> {
        let inner = self.inner.read();
        let mut stats = BackupStats {
            total_files: inner.states.len() as u64,
            ..Default::default()
        };

        for state in inner.states.values() {
            match state.status {
                BackupStatus::Success => stats.successful_files += 1,
                BackupStatus::Failed => stats.failed_files += 1,
                BackupStatus::Deleted => stats.deleted_files += 1,
            }
        }

        let recent_cutoff = Utc::now() - Duration::hours(24);
        for record in &inner.records {
            if record.status == BackupStatus::Success {
                stats.total_original_size += record.original_size;
                stats.total_transformed_size += record.transformed_size;
            }
            if record.backup_time > recent_cutoff {
                stats.recent_backups_24h += 1;
            }
        }

        Ok(stats)
    }

    fn purge_deleted(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write();
        let before = inner.states.len();
        inner.states.retain(|_, s| {
            !(s.status == BackupStatus::Deleted && s.last_backup_time < older_than)
        });
        Ok(before - inner.states.len())
    }

    fn cleanup_records(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write();
        let before = inner.records.len();
        inner
            .records
            .retain(|r| !(r.status == BackupStatus::Success && r.backup_time < older_than));
        Ok(before - inner.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_memory_store_contract() {
        exercise_store(&MemoryStateStore::new());
    }

    #[test]
    fn test_concurrent_writers() {
        let store = Arc::new(MemoryStateStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let path = PathBuf::from(format!("/t/{i}/{j}"));
                        store.set(&path, state("c", BackupStatus::Success, 1)).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.stats().unwrap().total_files, 400);
    }
}
