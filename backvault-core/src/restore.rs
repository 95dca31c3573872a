/*!
Manifest-driven restore.

Entries are restored independently by a bounded number of concurrent workers. For
every entry the target is `target_dir / basename(file_path)`:

1. an existing file whose checksum matches is left alone and counted as restored;
2. otherwise the object is downloaded, passed through the inverse transform described
   by the entry's flags, verified against the recorded checksum, and written through a
   temporary file that is renamed into place.

A failing entry records a [`RestoreError`] and the run carries on.
*/

use crate::checksum::{hash_file, verify};
use crate::manifest::{ManifestEntry, RestoreManifest, DEFAULT_FILE_MODE};
use crate::network::NetworkAdapter;
use crate::transform::{TransformFlags, TransformPipeline};
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Default number of concurrent restore workers
pub const DEFAULT_RESTORE_WORKERS: usize = 5;

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub workers: usize,
    /// Write downloaded bytes verbatim, skipping the inverse transform and verification
    pub keep_transformed: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_RESTORE_WORKERS,
            keep_transformed: false,
        }
    }
}

/// A single entry that could not be restored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreError {
    #[serde(rename = "file_path")]
    pub path: PathBuf,
    #[serde(rename = "file_id")]
    pub remote_id: String,
    #[serde(rename = "error")]
    pub message: String,
    pub time: DateTime<Utc>,
}

/// Aggregate state of a restore run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreProgress {
    pub total: usize,
    pub restored: usize,
    pub failed: usize,
    /// Restored entries that were already present with the right checksum
    pub skipped: usize,
    pub total_size: u64,
    pub restored_size: u64,
    pub started_at: DateTime<Utc>,
    pub errors: Vec<RestoreError>,
}

impl Default for RestoreProgress {
    fn default() -> Self {
        Self {
            total: 0,
            restored: 0,
            failed: 0,
            skipped: 0,
            total_size: 0,
            restored_size: 0,
            started_at: Utc::now(),
            errors: Vec::new(),
        }
    }
}

impl RestoreProgress {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.restored as f64 / self.total as f64 * 100.0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.restored + self.failed == self.total
    }
}

/// Summary persisted after every manifest restore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    pub restore_id: String,
    pub backup_id: String,
    pub target_dir: PathBuf,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds
    pub duration: f64,
    pub total_files: usize,
    pub restored_files: usize,
    pub skipped_files: usize,
    pub failed_files: usize,
    pub total_size: u64,
    pub restored_size: u64,
    pub success_rate: f64,
    pub errors: Vec<RestoreError>,
}

enum EntryOutcome {
    Restored,
    AlreadyPresent,
}

/// Restore orchestrator
pub struct RestoreService {
    network: Arc<dyn NetworkAdapter>,
    pipeline: TransformPipeline,
    options: RestoreOptions,
    progress: RwLock<RestoreProgress>,
}

impl std::fmt::Debug for RestoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreService")
            .field("pipeline", &self.pipeline)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RestoreService {
    /// `pipeline` supplies the password for encrypted entries
    pub fn new(network: Arc<dyn NetworkAdapter>, pipeline: TransformPipeline, options: RestoreOptions) -> Self {
        Self {
            network,
            pipeline,
            options,
            progress: RwLock::new(RestoreProgress::default()),
        }
    }

    /// Snapshot of the current (or last) run
    pub fn get_progress(&self) -> RestoreProgress {
        self.progress.read().clone()
    }

    /// Load `manifest_path` and restore it into `target_dir`
    pub async fn restore_from_manifest(&self, manifest_path: &Path, target_dir: &Path) -> Result<RestoreProgress> {
        let manifest = RestoreManifest::load(manifest_path)?;
        self.restore(&manifest, target_dir).await
    }

    /// Restore every entry of `manifest` into `target_dir`
    ///
    /// Per-entry failures are collected in the returned progress; only problems with
    /// the target directory or the final report fail the call.
    pub async fn restore(&self, manifest: &RestoreManifest, target_dir: &Path) -> Result<RestoreProgress> {
        fs::create_dir_all(target_dir).map_err(|e| BackupError::io(target_dir, e))?;

        *self.progress.write() = RestoreProgress {
            total: manifest.files.len(),
            total_size: manifest.total_size(),
            ..Default::default()
        };

        let workers = self.options.workers.max(1);
        info!(
            backup_id = %manifest.backup_id,
            files = manifest.files.len(),
            target_dir = %target_dir.display(),
            workers,
            "Starting restore from manifest"
        );

        stream::iter(&manifest.files)
            .for_each_concurrent(workers, |entry| async move {
                match self.restore_entry(entry, target_dir).await {
                    Ok(outcome) => self.mark_restored(entry, outcome),
                    Err(e) => self.mark_failed(entry, e),
                }
            })
            .await;

        let progress = self.get_progress();
        self.write_report(manifest, target_dir, &progress)?;
        Ok(progress)
    }

    /// Restore one object to `target_path`
    pub async fn restore_file(&self, remote_id: &str, target_path: &Path, flags: TransformFlags) -> Result<u64> {
        info!(remote_id, target = %target_path.display(), "Restoring single file");
        self.fetch_and_write(remote_id, target_path, flags, None, DEFAULT_FILE_MODE)
            .await
    }

    async fn restore_entry(&self, entry: &ManifestEntry, target_dir: &Path) -> Result<EntryOutcome> {
        let file_name = entry.file_path.file_name().ok_or_else(|| {
            BackupError::invalid_manifest(format!("no file name in '{}'", entry.file_path.display()))
        })?;
        let target = target_dir.join(file_name);

        if matches_checksum(&target, &entry.checksum).await {
            debug!(path = %target.display(), "File already present with correct checksum, skipping");
            return Ok(EntryOutcome::AlreadyPresent);
        }

        self.fetch_and_write(
            &entry.file_id,
            &target,
            entry.flags(),
            Some(&entry.checksum),
            entry.mode(),
        )
        .await?;
        Ok(EntryOutcome::Restored)
    }

    async fn fetch_and_write(
        &self,
        remote_id: &str,
        target: &Path,
        flags: TransformFlags,
        expected_checksum: Option<&str>,
        mode: u32,
    ) -> Result<u64> {
        let downloaded = self.network.download(remote_id).await?;

        #[cfg(feature = "metrics")]
        crate::observability::BackupMetrics::global().record_download();

        let keep_transformed = self.options.keep_transformed;
        let pipeline = self.pipeline.clone();
        let expected = expected_checksum.filter(|c| !c.is_empty()).map(str::to_string);
        let target = target.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<u64> {
            let content = if keep_transformed || flags.is_identity() {
                downloaded.to_vec()
            } else {
                pipeline.decode_with(&downloaded, flags)?
            };

            if !keep_transformed {
                if let Some(expected) = &expected {
                    verify(&content, expected)?;
                }
            }

            write_atomic(&target, &content, mode)?;
            debug!(path = %target.display(), size = content.len(), "Wrote restored file");
            Ok(content.len() as u64)
        })
        .await
        .map_err(|e| BackupError::io("<restore>", std::io::Error::other(e)))?
    }

    fn mark_restored(&self, entry: &ManifestEntry, outcome: EntryOutcome) {
        let mut progress = self.progress.write();
        progress.restored += 1;
        progress.restored_size += entry.size;
        if matches!(outcome, EntryOutcome::AlreadyPresent) {
            progress.skipped += 1;
        } else {
            info!(path = %entry.file_path.display(), size = entry.size, "File restored");
        }
    }

    fn mark_failed(&self, entry: &ManifestEntry, err: BackupError) {
        error!(
            path = %entry.file_path.display(),
            remote_id = %entry.file_id,
            error = %err,
            "Failed to restore file"
        );

        let mut progress = self.progress.write();
        progress.failed += 1;
        progress.errors.push(RestoreError {
            path: entry.file_path.clone(),
            remote_id: entry.file_id.clone(),
            message: err.to_string(),
            time: Utc::now(),
        });
    }

    fn write_report(&self, manifest: &RestoreManifest, target_dir: &Path, progress: &RestoreProgress) -> Result<PathBuf> {
        let end_time = Utc::now();
        let stamp = end_time.format("%Y%m%d-%H%M%S");
        let report = RestoreReport {
            restore_id: format!("restore-{stamp}"),
            backup_id: manifest.backup_id.clone(),
            target_dir: target_dir.to_path_buf(),
            start_time: progress.started_at,
            end_time,
            duration: (end_time - progress.started_at)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or_default(),
            total_files: progress.total,
            restored_files: progress.restored,
            skipped_files: progress.skipped,
            failed_files: progress.failed,
            total_size: progress.total_size,
            restored_size: progress.restored_size,
            success_rate: progress.success_rate(),
            errors: progress.errors.clone(),
        };

        let path = target_dir.join(format!("restore-report-{stamp}.json"));
        let data = serde_json::to_vec_pretty(&report)?;
        fs::write(&path, data).map_err(|e| BackupError::io(&path, e))?;

        info!(
            report = %path.display(),
            restored = progress.restored,
            skipped = progress.skipped,
            failed = progress.failed,
            duration_secs = report.duration,
            "Restore completed"
        );
        Ok(path)
    }
}

/// True when `path` is a regular file hashing to `checksum`
async fn matches_checksum(path: &Path, checksum: &str) -> bool {
    if checksum.is_empty() || !path.is_file() {
        return false;
    }

    let owned = path.to_path_buf();
    match tokio::task::spawn_blocking(move || hash_file(&owned)).await {
        Ok(Ok(existing)) => existing.eq_ignore_ascii_case(checksum),
        _ => false,
    }
}

/// Write `data` to a temporary sibling of `target` and rename it into place
fn write_atomic(target: &Path, data: &[u8], mode: u32) -> Result<()> {
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| BackupError::io(parent, e))?;
    temp.write_all(data).map_err(|e| BackupError::io(temp.path(), e))?;
    temp.as_file().sync_all().map_err(|e| BackupError::io(temp.path(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(mode))
            .map_err(|e| BackupError::io(temp.path(), e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    temp.persist(target).map_err(|e| BackupError::io(target, e.error))?;
    Ok(())
}
