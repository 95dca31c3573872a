/*!
Restore manifests: the sole input to a restore run.

```json
{
  "version": "1.0",
  "created_at": "...",
  "backup_id": "backup-20240101-120000",
  "source_path": "multiple",
  "files": [
    {"file_path": "/data/a.txt", "file_id": "…", "size": 1, "checksum": "…",
     "backup_time": "…", "permissions": 420, "compressed": true,
     "compression": "gzip", "encrypted": false}
  ],
  "metadata": {}
}
```

`compression` and `encrypted` are optional. Manifests that only carry the boolean
`compressed` flag decode as gzip.
*/

use crate::report::BackupReport;
use crate::transform::{CompressionAlgorithm, TransformFlags};
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const MANIFEST_VERSION: &str = "1.0";

/// Mode used when an entry carries no permissions
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// One file to restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file_path: PathBuf,
    pub file_id: String,
    pub size: u64,
    pub checksum: String,
    pub backup_time: DateTime<Utc>,
    #[serde(default)]
    pub permissions: u32,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionAlgorithm>,
    #[serde(default)]
    pub encrypted: bool,
}

impl ManifestEntry {
    /// Transforms applied to the stored object
    pub fn flags(&self) -> TransformFlags {
        let compression = match self.compression {
            Some(algorithm) => algorithm,
            None if self.compressed => CompressionAlgorithm::Gzip,
            None => CompressionAlgorithm::None,
        };
        TransformFlags {
            compression,
            encrypted: self.encrypted,
        }
    }

    pub fn set_flags(&mut self, flags: TransformFlags) {
        self.compressed = !flags.compression.is_none();
        self.compression = Some(flags.compression);
        self.encrypted = flags.encrypted;
    }

    /// Unix mode to restore with
    pub fn mode(&self) -> u32 {
        match self.permissions & 0o7777 {
            0 => DEFAULT_FILE_MODE,
            mode => mode,
        }
    }
}

/// Everything a restore run needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreManifest {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub backup_id: String,
    pub source_path: String,
    pub files: Vec<ManifestEntry>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RestoreManifest {
    pub fn new(backup_id: impl Into<String>, source_path: impl Into<String>) -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            created_at: Utc::now(),
            backup_id: backup_id.into(),
            source_path: source_path.into(),
            files: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Manifest covering every successful upload in `report`
    pub fn from_report(report: &BackupReport) -> Self {
        let mut manifest = Self::new(report.id.clone(), "multiple");
        manifest.metadata.insert("report_id".into(), Value::from(report.id.clone()));
        manifest
            .metadata
            .insert("report_time".into(), Value::from(report.start_time.to_rfc3339()));
        manifest
            .metadata
            .insert("total_files".into(), Value::from(report.total_files));
        manifest
            .metadata
            .insert("successful".into(), Value::from(report.successful));

        for result in report.results.iter().filter(|r| r.success) {
            let Some(file_id) = result.remote_id.as_ref().filter(|id| !id.is_empty()) else {
                continue;
            };
            let mut entry = ManifestEntry {
                file_path: result.path.clone(),
                file_id: file_id.clone(),
                size: result.original_size,
                checksum: result.checksum.clone(),
                backup_time: result.end_time,
                permissions: 0,
                compressed: false,
                compression: None,
                encrypted: false,
            };
            entry.set_flags(result.transform_flags);
            manifest.files.push(entry);
        }

        manifest
    }

    /// Structural checks every restore relies on
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(BackupError::invalid_manifest("missing version"));
        }

        for (index, entry) in self.files.iter().enumerate() {
            if entry.file_id.trim().is_empty() {
                return Err(BackupError::invalid_manifest(format!(
                    "entry {index} ({}) has no file id",
                    entry.file_path.display()
                )));
            }
            if entry.file_path.file_name().is_none() {
                return Err(BackupError::invalid_manifest(format!(
                    "entry {index} has no file name in '{}'",
                    entry.file_path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Read and validate a manifest file
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| BackupError::io(path, e))?;
        let manifest: Self = serde_json::from_slice(&data)
            .map_err(|e| BackupError::invalid_manifest(format!("{}: {e}", path.display())))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(path, data).map_err(|e| BackupError::io(path, e))?;

        info!(path = %path.display(), files = self.files.len(), "Saved restore manifest");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Operation;
    use crate::report::BackupResult;
    use tempfile::TempDir;

    fn entry(json: &str) -> ManifestEntry {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_legacy_compressed_flag_means_gzip() {
        let legacy = entry(
            r#"{"file_path":"/a","file_id":"1","size":1,"checksum":"c",
                "backup_time":"2024-01-01T00:00:00Z","permissions":420,"compressed":true}"#,
        );
        assert_eq!(legacy.flags().compression, CompressionAlgorithm::Gzip);
        assert!(!legacy.flags().encrypted);

        let explicit = entry(
            r#"{"file_path":"/a","file_id":"1","size":1,"checksum":"c",
                "backup_time":"2024-01-01T00:00:00Z","compressed":true,
                "compression":"zlib","encrypted":true}"#,
        );
        assert_eq!(explicit.flags().compression, CompressionAlgorithm::Zlib);
        assert!(explicit.flags().encrypted);
    }

    #[test]
    fn test_mode_defaults() {
        let mut e = entry(
            r#"{"file_path":"/a","file_id":"1","size":1,"checksum":"c",
                "backup_time":"2024-01-01T00:00:00Z"}"#,
        );
        assert_eq!(e.mode(), DEFAULT_FILE_MODE);
        e.permissions = 0o100600;
        assert_eq!(e.mode(), 0o600);
    }

    #[test]
    fn test_from_report_keeps_successful_uploads() {
        let now = Utc::now();
        let result = |path: &str, success: bool, id: Option<&str>| BackupResult {
            path: PathBuf::from(path),
            remote_id: id.map(str::to_string),
            operation: Operation::Modify,
            success,
            error: None,
            start_time: now,
            end_time: now,
            original_size: 10,
            transformed_size: 8,
            checksum: format!("sum-{path}"),
            transform_flags: TransformFlags {
                compression: CompressionAlgorithm::Deflate,
                encrypted: true,
            },
        };
        let report = BackupReport {
            id: "backup-20240101-000000".into(),
            start_time: now,
            end_time: Some(now),
            total_files: 3,
            successful: 2,
            failed: 1,
            total_size: 20,
            duration: 1.0,
            results: vec![
                result("/ok", true, Some("id-1")),
                result("/failed", false, None),
                result("/deleted", true, None),
            ],
            statistics: Map::new(),
        };

        let manifest = RestoreManifest::from_report(&report);
        assert_eq!(manifest.backup_id, report.id);
        assert_eq!(manifest.files.len(), 1);
        let entry = &manifest.files[0];
        assert_eq!(entry.file_id, "id-1");
        assert_eq!(entry.checksum, "sum-/ok");
        assert!(entry.compressed);
        assert_eq!(entry.flags().compression, CompressionAlgorithm::Deflate);
        assert!(entry.encrypted);
        assert_eq!(manifest.metadata["total_files"], 3);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/manifest.json");
        let mut manifest = RestoreManifest::new("b1", "/src");
        manifest.files.push(entry(
            r#"{"file_path":"/src/a.txt","file_id":"x","size":3,"checksum":"c",
                "backup_time":"2024-01-01T00:00:00Z"}"#,
        ));

        manifest.save(&path).unwrap();
        let loaded = RestoreManifest::load(&path).unwrap();
        assert_eq!(loaded.files, manifest.files);
        assert_eq!(loaded.version, MANIFEST_VERSION);
    }

    #[test]
    fn test_load_rejects_bad_manifests() {
        let dir = TempDir::new().unwrap();

        let garbage = dir.path().join("garbage.json");
        fs::write(&garbage, "not json").unwrap();
        assert!(matches!(
            RestoreManifest::load(&garbage),
            Err(BackupError::InvalidManifest(_))
        ));

        let mut manifest = RestoreManifest::new("b1", "/src");
        manifest.files.push(entry(
            r#"{"file_path":"/src/a.txt","file_id":"","size":3,"checksum":"c",
                "backup_time":"2024-01-01T00:00:00Z"}"#,
        ));
        let missing_id = dir.path().join("missing.json");
        manifest.save(&missing_id).unwrap();
        assert!(matches!(
            RestoreManifest::load(&missing_id),
            Err(BackupError::InvalidManifest(_))
        ));
    }
}
