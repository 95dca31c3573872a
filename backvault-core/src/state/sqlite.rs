//! SQLite-backed [`StateStore`].

use super::{BackupRecord, BackupStats, BackupStatus, FileBackupState, SearchCriteria, StateStore};
use crate::event::Operation;
use crate::transform::{CompressionAlgorithm, TransformFlags};
use crate::{BackupError, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS backup_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_path TEXT NOT NULL,
        file_id TEXT,
        checksum TEXT NOT NULL,
        original_size INTEGER NOT NULL,
        compressed_size INTEGER,
        is_compressed BOOLEAN DEFAULT FALSE,
        compression TEXT NOT NULL DEFAULT 'none',
        encrypted BOOLEAN NOT NULL DEFAULT FALSE,
        backup_time TEXT NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        operation TEXT,
        UNIQUE(file_path, checksum)
    );
    CREATE TABLE IF NOT EXISTS file_states (
        file_path TEXT PRIMARY KEY,
        last_checksum TEXT,
        last_backup TEXT,
        backup_count INTEGER DEFAULT 0,
        status TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_backup_records_file_path ON backup_records(file_path);
    CREATE INDEX IF NOT EXISTS idx_backup_records_status ON backup_records(status);
    CREATE INDEX IF NOT EXISTS idx_backup_records_backup_time ON backup_records(backup_time);
";

const RECORD_COLUMNS: &str = "file_path, file_id, checksum, original_size, compressed_size, \
     compression, encrypted, backup_time, status, error_message, operation";

/// Fixed-width UTC timestamps so text comparison orders correctly
fn to_db_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_db_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_column<T>(index: usize, raw: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = BackupError>,
{
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e)))
}

fn db_error(context: &str, e: rusqlite::Error) -> BackupError {
    BackupError::state_store(format!("{context}: {e}"))
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<BackupRecord> {
    let file_path: String = row.get(0)?;
    let compression: String = row.get(5)?;
    let backup_time: String = row.get(7)?;
    let status: String = row.get(8)?;
    let operation: Option<String> = row.get(10)?;

    Ok(BackupRecord {
        file_path: PathBuf::from(file_path),
        file_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        checksum: row.get(2)?,
        original_size: row.get::<_, i64>(3)? as u64,
        transformed_size: row.get::<_, Option<i64>>(4)?.unwrap_or_default() as u64,
        transform_flags: TransformFlags {
            compression: parse_column::<CompressionAlgorithm>(5, &compression)?,
            encrypted: row.get(6)?,
        },
        backup_time: from_db_time(&backup_time)?,
        status: parse_column(8, &status)?,
        error_message: row.get(9)?,
        operation: match operation {
            Some(op) => parse_column(10, &op)?,
            None => Operation::Manual,
        },
    })
}

/// [`StateStore`] persisted in a SQLite database file
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
        }

        let conn = Connection::open(path).map_err(|e| db_error("failed to open database", e))?;
        let store = Self::with_connection(conn)?;
        info!(path = %path.display(), "Opened state database");
        Ok(store)
    }

    /// Database that lives only as long as this value
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_error("failed to open database", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .map_err(|e| db_error("failed to set pragmas", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| db_error("failed to initialize schema", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query_records(&self, sql: &str, args: Vec<rusqlite::types::Value>) -> Result<Vec<BackupRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| db_error("failed to prepare query", e))?;
        let rows = stmt
            .query_map(params_from_iter(args), record_from_row)
            .map_err(|e| db_error("failed to query backup records", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_error("failed to read backup record", e))
    }
}

impl StateStore for SqliteStateStore {
    fn get(&self, path: &Path) -> Result<Option<FileBackupState>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT last_checksum, last_backup, backup_count, status FROM file_states WHERE file_path = ?1",
            params![path_text(path)],
            |row| {
                let last_backup: String = row.get(1)?;
                let status: String = row.get(3)?;
                Ok(FileBackupState {
                    last_checksum: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    last_backup_time: from_db_time(&last_backup)?,
                    backup_count: row.get::<_, i64>(2)? as u64,
                    status: parse_column(3, &status)?,
                })
            },
        )
        .optional()
        .map_err(|e| db_error("failed to load file state", e))
    }

    fn set(&self, path: &Path, state: FileBackupState) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO file_states (file_path, last_checksum, last_backup, backup_count, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    path_text(path),
                    state.last_checksum,
                    to_db_time(&state.last_backup_time),
                    state.backup_count as i64,
                    state.status.as_str(),
                ],
            )
            .map_err(|e| db_error("failed to update file state", e))?;
        Ok(())
    }

    fn record(&self, record: BackupRecord) -> Result<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO backup_records ({RECORD_COLUMNS}, is_compressed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        );
        self.conn
            .lock()
            .execute(
                &sql,
                params![
                    path_text(&record.file_path),
                    record.file_id,
                    record.checksum,
                    record.original_size as i64,
                    record.transformed_size as i64,
                    record.transform_flags.compression.as_str(),
                    record.transform_flags.encrypted,
                    to_db_time(&record.backup_time),
                    record.status.as_str(),
                    record.error_message,
                    record.operation.as_str(),
                    !record.transform_flags.compression.is_none(),
                ],
            )
            .map_err(|e| db_error("failed to insert backup record", e))?;
        Ok(())
    }

    fn search(&self, criteria: &SearchCriteria) -> Result<Vec<BackupRecord>> {
        use rusqlite::types::Value;

        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM backup_records WHERE 1=1");
        let mut args: Vec<Value> = Vec::new();

        if let Some(fragment) = &criteria.path_contains {
            sql.push_str(" AND instr(file_path, ?) > 0");
            args.push(Value::Text(fragment.clone()));
        }
        if let Some(status) = criteria.status {
            sql.push_str(" AND status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(start) = &criteria.start_time {
            sql.push_str(" AND backup_time >= ?");
            args.push(Value::Text(to_db_time(start)));
        }
        if let Some(end) = &criteria.end_time {
            sql.push_str(" AND backup_time <= ?");
            args.push(Value::Text(to_db_time(end)));
        }
        sql.push_str(" ORDER BY backup_time DESC LIMIT ?");
        args.push(Value::Integer(criteria.effective_limit() as i64));

        debug!(query = %sql, "Searching backup records");
        self.query_records(&sql, args)
    }

    fn history(&self, path: &Path, limit: usize) -> Result<Vec<BackupRecord>> {
        use rusqlite::types::Value;

        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM backup_records WHERE file_path = ? ORDER BY backup_time DESC LIMIT ?"
        );
        self.query_records(
            &sql,
            vec![Value::Text(path_text(path)), Value::Integer(limit as i64)],
        )
    }

    fn stats(&self) -> Result<BackupStats> {
        let conn = self.conn.lock();
        let mut stats = BackupStats::default();

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM file_states GROUP BY status")
            .map_err(|e| db_error("failed to prepare stats query", e))?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| db_error("failed to count file states", e))?;
        for entry in counts {
            let (status, count) = entry.map_err(|e| db_error("failed to read status count", e))?;
            let count = count as u64;
            stats.total_files += count;
            match status.parse::<BackupStatus>() {
                Ok(BackupStatus::Success) => stats.successful_files += count,
                Ok(BackupStatus::Failed) => stats.failed_files += count,
                Ok(BackupStatus::Deleted) => stats.deleted_files += count,
                Err(_) => {}
            }
        }

        let (original, transformed): (Option<i64>, Option<i64>) = conn
            .query_row(
                "SELECT SUM(original_size), SUM(compressed_size) FROM backup_records WHERE status = 'success'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| db_error("failed to sum backup sizes", e))?;
        stats.total_original_size = original.unwrap_or_default() as u64;
        stats.total_transformed_size = transformed.unwrap_or_default() as u64;

        let recent: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM backup_records WHERE backup_time > ?1",
                params![to_db_time(&(Utc::now() - Duration::hours(24)))],
                |row| row.get(0),
            )
            .map_err(|e| db_error("failed to count recent backups", e))?;
        stats.recent_backups_24h = recent as u64;

        Ok(stats)
    }

    fn purge_deleted(&self, older_than: DateTime<Utc>) -> Result<usize> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM file_states WHERE status = 'deleted' AND last_backup < ?1",
                params![to_db_time(&older_than)],
            )
            .map_err(|e| db_error("failed to purge deleted states", e))
    }

    fn cleanup_records(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM backup_records WHERE status = 'success' AND backup_time < ?1",
                params![to_db_time(&older_than)],
            )
            .map_err(|e| db_error("failed to clean up old records", e))?;

        if removed > 0 {
            conn.execute_batch("VACUUM")
                .map_err(|e| db_error("failed to vacuum database", e))?;
            info!(removed, "Cleaned up old backup records");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_sqlite_store_contract() {
        exercise_store(&SqliteStateStore::in_memory().unwrap());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("backup.db");
        let path = Path::new("/srv/a.bin");

        {
            let store = SqliteStateStore::open(&db_path).unwrap();
            store.set(path, state("abc", BackupStatus::Success, 4)).unwrap();
            let mut row = record("/srv/a.bin", "abc", BackupStatus::Success, 0);
            row.transform_flags = TransformFlags {
                compression: CompressionAlgorithm::Gzip,
                encrypted: true,
            };
            store.record(row).unwrap();
        }

        let store = SqliteStateStore::open(&db_path).unwrap();
        let loaded = store.get(path).unwrap().unwrap();
        assert_eq!(loaded.backup_count, 4);
        assert_eq!(loaded.last_checksum, "abc");

        let history = store.history(path, 5).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].transform_flags.compression, CompressionAlgorithm::Gzip);
        assert!(history[0].transform_flags.encrypted);
    }

    #[test]
    fn test_search_treats_wildcards_literally() {
        let store = SqliteStateStore::in_memory().unwrap();
        store.record(record("/x/100%.txt", "a", BackupStatus::Success, 0)).unwrap();
        store.record(record("/x/1000.txt", "b", BackupStatus::Success, 0)).unwrap();

        let rows = store
            .search(&SearchCriteria {
                path_contains: Some("100%".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].checksum, "a");
    }
}
