/*!
Backup outcome reporting.

Workers hand every finished task to a [`Reporter`]. [`BackupReporter`] aggregates the
results of a run into a [`BackupReport`], persisting it as JSON
(`backup-<timestamp>.json`) in the report directory when one is configured.
*/

use crate::event::Operation;
use crate::transform::TransformFlags;
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Results are flushed to disk after every this many additions
pub const AUTO_SAVE_INTERVAL: usize = 100;

const REPORT_PREFIX: &str = "backup-";
const REPORT_EXTENSION: &str = "json";

/// Outcome of one backup task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupResult {
    #[serde(rename = "file_path")]
    pub path: PathBuf,
    #[serde(rename = "file_id", default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub operation: Operation,
    pub success: bool,
    #[serde(rename = "error_message", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(rename = "size")]
    pub original_size: u64,
    #[serde(default)]
    pub transformed_size: u64,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub transform_flags: TransformFlags,
}

impl BackupResult {
    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }
}

/// Sink for task outcomes
pub trait Reporter: Send + Sync {
    fn add_result(&self, result: BackupResult);
}

/// Aggregate of one backup run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupReport {
    pub id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub total_files: u64,
    pub successful: u64,
    pub failed: u64,
    /// Original bytes of successful results
    pub total_size: u64,
    /// Seconds between start and finish
    #[serde(default)]
    pub duration: f64,
    pub results: Vec<BackupResult>,
    #[serde(default)]
    pub statistics: Map<String, Value>,
}

impl BackupReport {
    fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            id: format!("{REPORT_PREFIX}{}", start_time.format("%Y%m%d-%H%M%S")),
            start_time,
            end_time: None,
            total_files: 0,
            successful: 0,
            failed: 0,
            total_size: 0,
            duration: 0.0,
            results: Vec::new(),
            statistics: Map::new(),
        }
    }

    fn add(&mut self, result: BackupResult) {
        self.total_files += 1;
        if result.success {
            self.successful += 1;
            self.total_size += result.original_size;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
    }

    /// Percentage of successful results, 0 when empty
    pub fn success_rate(&self) -> f64 {
        if self.total_files == 0 {
            0.0
        } else {
            self.successful as f64 / self.total_files as f64 * 100.0
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.{REPORT_EXTENSION}", self.id)
    }

    /// Read a report previously written by [`BackupReporter`]
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| BackupError::io(path, e))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Human readable byte count (`1.5 KB`, `3.0 MB`, ...)
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {suffix}B", bytes as f64 / div as f64)
}

/// [`Reporter`] that aggregates a run and persists it as JSON
#[derive(Debug)]
pub struct BackupReporter {
    report_dir: Option<PathBuf>,
    retention: usize,
    current: RwLock<Option<BackupReport>>,
    /// Serializes writes of report files
    writing: Mutex<()>,
}

impl BackupReporter {
    /// Reporter writing into `report_dir`, keeping at most `retention` report files
    pub fn new(report_dir: impl Into<PathBuf>, retention: usize) -> Result<Self> {
        let report_dir = report_dir.into();
        fs::create_dir_all(&report_dir).map_err(|e| BackupError::io(&report_dir, e))?;
        Ok(Self {
            report_dir: Some(report_dir),
            retention,
            current: RwLock::new(None),
            writing: Mutex::new(()),
        })
    }

    /// Reporter that never touches the filesystem
    pub fn in_memory() -> Self {
        Self {
            report_dir: None,
            retention: 0,
            current: RwLock::new(None),
            writing: Mutex::new(()),
        }
    }

    pub fn report_dir(&self) -> Option<&Path> {
        self.report_dir.as_deref()
    }

    /// Begin a fresh report, saving the previous one first
    pub fn start_new_report(&self) {
        let mut current = self.current.write();
        if let Some(previous) = current.as_ref() {
            if let Err(e) = self.save(previous) {
                warn!(error = %e, report_id = %previous.id, "Failed to save previous report");
            }
        }

        let report = BackupReport::new(Utc::now());
        info!(report_id = %report.id, "Started new backup report");
        *current = Some(report);
    }

    /// Close the current report, merge `stats` into its statistics, and save it
    ///
    /// # Returns
    /// A copy of the finished report
    pub fn finish_report(&self, stats: Map<String, Value>) -> Result<BackupReport> {
        let mut current = self.current.write();
        let report = current
            .as_mut()
            .ok_or_else(|| BackupError::validation("no active report to finish"))?;

        let end_time = Utc::now();
        report.end_time = Some(end_time);
        report.duration = (end_time - report.start_time)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        report.statistics = stats;

        if report.total_files > 0 {
            report
                .statistics
                .insert("success_rate".into(), Value::from(report.success_rate()));
            let average = if report.successful > 0 {
                report.total_size / report.successful
            } else {
                0
            };
            report.statistics.insert("average_size".into(), Value::from(average));
            let per_second = if report.duration > 0.0 {
                report.total_files as f64 / report.duration
            } else {
                report.total_files as f64
            };
            report
                .statistics
                .insert("files_per_second".into(), Value::from(per_second));
        }

        self.save(report)?;
        Ok(report.clone())
    }

    /// Snapshot of the report in progress
    pub fn current_report(&self) -> Option<BackupReport> {
        self.current.read().clone()
    }

    /// Most recently written report in the report directory
    pub fn latest_report(&self) -> Result<Option<BackupReport>> {
        let Some(dir) = &self.report_dir else {
            return Ok(self.current_report());
        };

        match self.report_files(dir)?.pop() {
            Some(path) => BackupReport::load(&path).map(Some),
            None => Ok(None),
        }
    }

    /// Plain-text summary of the report in progress
    pub fn summary(&self) -> String {
        let current = self.current.read();
        let Some(report) = current.as_ref() else {
            return "No active backup report".to_string();
        };

        let mut summary = format!(
            "Backup Report Summary\n\
             ====================\n\
             Report ID: {}\n\
             Start Time: {}\n\
             Total Files: {}\n\
             Successful: {}\n\
             Failed: {}\n\
             Total Size: {}\n\
             Success Rate: {:.2}%\n",
            report.id,
            report.start_time.format("%Y-%m-%d %H:%M:%S"),
            report.total_files,
            report.successful,
            report.failed,
            format_size(report.total_size),
            report.success_rate(),
        );

        if report.failed > 0 {
            summary.push_str("\nFailed Files:\n");
            for result in report.results.iter().filter(|r| !r.success) {
                let _ = writeln!(
                    summary,
                    "- {}: {}",
                    result.path.display(),
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        summary
    }

    /// Report files sorted oldest first
    fn report_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(dir).map_err(|e| BackupError::io(dir, e))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path.extension().is_some_and(|ext| ext == REPORT_EXTENSION)
                    && path
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with(REPORT_PREFIX))
            })
            .collect();
        // Names embed a sortable timestamp
        files.sort();
        Ok(files)
    }

    fn save(&self, report: &BackupReport) -> Result<()> {
        let Some(dir) = &self.report_dir else {
            return Ok(());
        };

        let path = dir.join(report.file_name());
        let data = serde_json::to_vec_pretty(report)?;
        let _writing = self.writing.lock();
        fs::write(&path, data).map_err(|e| BackupError::io(&path, e))?;

        info!(
            file = %path.display(),
            total_files = report.total_files,
            successful = report.successful,
            failed = report.failed,
            "Saved backup report"
        );

        self.cleanup_old_reports(dir);
        Ok(())
    }

    fn cleanup_old_reports(&self, dir: &Path) {
        if self.retention == 0 {
            return;
        }

        let files = match self.report_files(dir) {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "Failed to list report directory");
                return;
            }
        };

        if files.len() <= self.retention {
            return;
        }

        let excess = files.len() - self.retention;
        for path in files.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => debug!(file = %path.display(), "Removed old report"),
                Err(e) => warn!(file = %path.display(), error = %e, "Failed to remove old report"),
            }
        }
    }
}

impl Reporter for BackupReporter {
    fn add_result(&self, result: BackupResult) {
        let snapshot = {
            let mut current = self.current.write();
            let report = current.get_or_insert_with(|| BackupReport::new(Utc::now()));
            report.add(result);
            (self.report_dir.is_some() && report.results.len() % AUTO_SAVE_INTERVAL == 0)
                .then(|| report.clone())
        };

        // Written outside the lock so other workers keep adding results
        if let Some(report) = snapshot {
            if let Err(e) = self.save(&report) {
                warn!(error = %e, report_id = %report.id, "Failed to auto-save report");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn result(path: &str, success: bool, size: u64) -> BackupResult {
        let now = Utc::now();
        BackupResult {
            path: PathBuf::from(path),
            remote_id: success.then(|| format!("id-{path}")),
            operation: Operation::Modify,
            success,
            error: (!success).then(|| "upload failed".to_string()),
            start_time: now,
            end_time: now,
            original_size: size,
            transformed_size: size,
            checksum: "c".into(),
            transform_flags: TransformFlags::default(),
        }
    }

    #[test]
    fn test_add_result_updates_counters() {
        let reporter = BackupReporter::in_memory();
        reporter.add_result(result("/a", true, 100));
        reporter.add_result(result("/b", false, 50));

        let report = reporter.current_report().unwrap();
        assert_eq!(report.total_files, 2);
        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.total_size, 100);
        assert_eq!(report.success_rate(), 50.0);
    }

    #[test]
    fn test_finish_report_adds_statistics_and_saves() {
        let dir = TempDir::new().unwrap();
        let reporter = BackupReporter::new(dir.path(), 30).unwrap();
        reporter.start_new_report();
        reporter.add_result(result("/a", true, 300));
        reporter.add_result(result("/b", true, 100));

        let mut stats = Map::new();
        stats.insert("queued".into(), Value::from(2));
        let report = reporter.finish_report(stats).unwrap();

        assert_eq!(report.statistics["queued"], 2);
        assert_eq!(report.statistics["success_rate"], 100.0);
        assert_eq!(report.statistics["average_size"], 200);
        assert!(report.statistics.contains_key("files_per_second"));

        let saved = reporter.latest_report().unwrap().unwrap();
        assert_eq!(saved.id, report.id);
        assert_eq!(saved.results.len(), 2);
    }

    #[test]
    fn test_finish_without_report_fails() {
        let reporter = BackupReporter::in_memory();
        assert!(reporter.finish_report(Map::new()).is_err());
    }

    #[test]
    fn test_auto_save_after_interval() {
        let dir = TempDir::new().unwrap();
        let reporter = BackupReporter::new(dir.path(), 30).unwrap();

        for i in 0..AUTO_SAVE_INTERVAL - 1 {
            reporter.add_result(result(&format!("/f{i}"), true, 1));
        }
        assert!(reporter.latest_report().unwrap().is_none());

        reporter.add_result(result("/last", true, 1));
        let saved = reporter.latest_report().unwrap().unwrap();
        assert_eq!(saved.results.len(), AUTO_SAVE_INTERVAL);
    }

    #[test]
    fn test_concurrent_results_with_auto_save() {
        let dir = TempDir::new().unwrap();
        let reporter = std::sync::Arc::new(BackupReporter::new(dir.path(), 30).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let reporter = reporter.clone();
                std::thread::spawn(move || {
                    for i in 0..AUTO_SAVE_INTERVAL {
                        reporter.add_result(result(&format!("/t{t}/f{i}"), true, 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let report = reporter.current_report().unwrap();
        assert_eq!(report.results.len(), 4 * AUTO_SAVE_INTERVAL);
        assert_eq!(report.successful, 4 * AUTO_SAVE_INTERVAL as u64);
        let saved = reporter.latest_report().unwrap().unwrap();
        assert_eq!(saved.id, report.id);
        assert_eq!(saved.results.len() % AUTO_SAVE_INTERVAL, 0);
    }

    #[test]
    fn test_retention_removes_oldest() {
        let dir = TempDir::new().unwrap();
        for stamp in ["20240101-000000", "20240102-000000", "20240103-000000"] {
            fs::write(dir.path().join(format!("backup-{stamp}.json")), "{}").unwrap();
        }
        fs::write(dir.path().join("restore-report-1.json"), "{}").unwrap();

        let reporter = BackupReporter::new(dir.path(), 2).unwrap();
        reporter.start_new_report();
        reporter.finish_report(Map::new()).unwrap();

        let remaining = reporter.report_files(dir.path()).unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(!dir.path().join("backup-20240101-000000.json").exists());
        assert!(!dir.path().join("backup-20240102-000000.json").exists());
        // Restore reports are not subject to backup retention
        assert!(dir.path().join("restore-report-1.json").exists());
    }

    #[test]
    fn test_summary_lists_failures() {
        let reporter = BackupReporter::in_memory();
        assert_eq!(reporter.summary(), "No active backup report");

        reporter.add_result(result("/ok", true, 2048));
        reporter.add_result(result("/broken", false, 1));

        let summary = reporter.summary();
        assert!(summary.contains("Total Files: 2"));
        assert!(summary.contains("Total Size: 2.0 KB"));
        assert!(summary.contains("- /broken: upload failed"));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_result_json_field_names() {
        let json = serde_json::to_value(result("/a", true, 1)).unwrap();
        assert_eq!(json["file_path"], "/a");
        assert_eq!(json["file_id"], "id-/a");
        assert_eq!(json["size"], 1);
        assert!(json.get("error_message").is_none());
    }
}
