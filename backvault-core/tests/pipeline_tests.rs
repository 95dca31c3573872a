/*!
End-to-end tests for the backup and restore pipelines.
These run the real service, queue and restore orchestrator against the in-memory
network adapter and on-disk temporary directories.
*/

use async_trait::async_trait;
use backvault_core::checksum::compute_hash;
use backvault_core::{
    BackupError, BackupReporter, BackupService, BackupServiceConfig, BackupStatus, ChangeEvent,
    CompressionAlgorithm, Config, InMemoryNetwork, ManifestEntry, MemoryStateStore,
    NetworkAdapter, Operation, RestoreManifest, RestoreOptions, RestoreService, StateStore,
    TransformConfig, TransformPipeline,
};
use backvault_retry::{with_retry, RetryError, RetryPolicy};
use bytes::Bytes;
use chrono::Utc;
use serde_json::Map;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Wraps the in-memory store, failing the first `failures` upload attempts
struct FlakyNetwork {
    inner: InMemoryNetwork,
    failures: usize,
    permanent: bool,
    attempts: AtomicUsize,
    policy: RetryPolicy,
}

impl FlakyNetwork {
    fn transient(failures: usize) -> Self {
        Self {
            inner: InMemoryNetwork::new(),
            failures,
            permanent: false,
            attempts: AtomicUsize::new(0),
            policy: RetryPolicy::new(3).with_unit(Duration::ZERO),
        }
    }

    fn rejecting() -> Self {
        Self {
            permanent: true,
            ..Self::transient(usize::MAX)
        }
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkAdapter for FlakyNetwork {
    async fn upload(
        &self,
        path: &Path,
        data: Bytes,
        size: u64,
        checksum: &str,
    ) -> backvault_core::Result<String> {
        let id = with_retry("upload", &self.policy, |_| {
            let data = data.clone();
            async move {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < self.failures {
                    let err = if self.permanent {
                        BackupError::client(Some(403), "forbidden")
                    } else {
                        BackupError::transient("upload", "connection reset")
                    };
                    return Err(RetryError::classify("upload", err));
                }
                self.inner
                    .upload(path, data, size, checksum)
                    .await
                    .map_err(|e| RetryError::classify("upload", e))
            }
        })
        .await?;
        Ok(id)
    }

    async fn download(&self, remote_id: &str) -> backvault_core::Result<Bytes> {
        self.inner.download(remote_id).await
    }

    async fn health_check(&self) -> backvault_core::Result<()> {
        Ok(())
    }
}

fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn service(
    workers: usize,
    state: Arc<MemoryStateStore>,
    network: Arc<dyn NetworkAdapter>,
    reporter: Arc<BackupReporter>,
    pipeline: TransformPipeline,
) -> BackupService {
    let config = BackupServiceConfig {
        workers,
        ..BackupServiceConfig::default()
    };
    BackupService::new(config, state, network, reporter, pipeline)
}

#[tokio::test]
async fn test_many_files_fewer_workers() {
    let source = TempDir::new().unwrap();
    let state = Arc::new(MemoryStateStore::new());
    let network = Arc::new(InMemoryNetwork::new());
    let reporter = Arc::new(BackupReporter::in_memory());
    let service = service(
        3,
        state.clone(),
        network.clone(),
        reporter.clone(),
        TransformPipeline::identity(),
    );
    service.start().await.unwrap();

    const FILES: usize = 25;
    for i in 0..FILES {
        let path = write_file(source.path(), &format!("file-{i}.txt"), format!("content {i}").as_bytes());
        let outcome = service
            .submit_change(ChangeEvent::new(path, Operation::Create, 0))
            .unwrap();
        assert!(outcome.is_queued());
    }

    service.wait_idle().await;
    service.stop().await;

    let report = reporter.current_report().unwrap();
    assert_eq!(report.successful, FILES as u64);
    assert_eq!(report.failed, 0);
    assert_eq!(network.upload_count(), FILES);

    let stats = service.get_stats().unwrap();
    assert_eq!(stats.queue_length, 0);
    assert_eq!(stats.pending_tasks, 0);
    assert_eq!(stats.completed_tasks, FILES as u64);
    assert_eq!(stats.store.total_files, FILES as u64);
}

#[tokio::test]
async fn test_single_create_event() {
    let source = TempDir::new().unwrap();
    let path = write_file(source.path(), "a", b"x");
    let state = Arc::new(MemoryStateStore::new());
    let network = Arc::new(InMemoryNetwork::new());
    let reporter = Arc::new(BackupReporter::in_memory());
    let service = service(
        1,
        state.clone(),
        network.clone(),
        reporter.clone(),
        TransformPipeline::identity(),
    );
    service.start().await.unwrap();

    service
        .submit_change(ChangeEvent::new(&path, Operation::Create, 1))
        .unwrap();
    service.wait_idle().await;
    service.stop().await;

    let uploads = network.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].path, path);
    assert_eq!(uploads[0].size, 1);
    assert_eq!(uploads[0].checksum, compute_hash(b"x"));
    assert_eq!(
        network.object(&uploads[0].remote_id),
        Some(Bytes::from_static(b"x"))
    );

    let file_state = state.get(&path).unwrap().unwrap();
    assert_eq!(file_state.status, BackupStatus::Success);
    assert_eq!(file_state.backup_count, 1);
    assert_eq!(file_state.last_checksum, compute_hash(b"x"));

    let report = reporter.current_report().unwrap();
    let result = &report.results[0];
    assert_eq!(result.original_size, 1);
    assert_eq!(result.checksum, compute_hash(b"x"));
    assert_eq!(result.remote_id.as_deref(), Some(uploads[0].remote_id.as_str()));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let source = TempDir::new().unwrap();
    let path = write_file(source.path(), "flaky.txt", b"eventually");
    let state = Arc::new(MemoryStateStore::new());
    let network = Arc::new(FlakyNetwork::transient(2));
    let reporter = Arc::new(BackupReporter::in_memory());
    let service = service(
        1,
        state.clone(),
        network.clone(),
        reporter.clone(),
        TransformPipeline::identity(),
    );
    service.start().await.unwrap();

    service
        .submit_change(ChangeEvent::new(&path, Operation::Modify, 0))
        .unwrap();
    service.wait_idle().await;
    service.stop().await;

    assert_eq!(network.attempts(), 3);
    assert_eq!(network.inner.upload_count(), 1);
    assert_eq!(state.get(&path).unwrap().unwrap().status, BackupStatus::Success);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let source = TempDir::new().unwrap();
    let path = write_file(source.path(), "denied.txt", b"nope");
    let state = Arc::new(MemoryStateStore::new());
    let network = Arc::new(FlakyNetwork::rejecting());
    let reporter = Arc::new(BackupReporter::in_memory());
    let service = service(
        1,
        state.clone(),
        network.clone(),
        reporter.clone(),
        TransformPipeline::identity(),
    );
    service.start().await.unwrap();

    service
        .submit_change(ChangeEvent::new(&path, Operation::Modify, 0))
        .unwrap();
    service.wait_idle().await;
    service.stop().await;

    assert_eq!(network.attempts(), 1);
    assert_eq!(state.get(&path).unwrap().unwrap().status, BackupStatus::Failed);

    let report = reporter.current_report().unwrap();
    assert_eq!(report.failed, 1);
    assert!(report.results[0].error.is_some());
}

#[tokio::test]
async fn test_exhausted_retries_leave_file_failed() {
    let source = TempDir::new().unwrap();
    let path = write_file(source.path(), "down.txt", b"server is down");
    let state = Arc::new(MemoryStateStore::new());
    let network = Arc::new(FlakyNetwork::transient(usize::MAX));
    let reporter = Arc::new(BackupReporter::in_memory());
    let service = service(
        1,
        state.clone(),
        network.clone(),
        reporter,
        TransformPipeline::identity(),
    );
    service.start().await.unwrap();

    service
        .submit_change(ChangeEvent::new(&path, Operation::Create, 0))
        .unwrap();
    service.wait_idle().await;
    service.stop().await;

    assert_eq!(network.attempts(), 4);
    assert_eq!(state.get(&path).unwrap().unwrap().status, BackupStatus::Failed);
}

#[tokio::test]
async fn test_restore_two_entries_into_empty_dir() {
    let network = Arc::new(InMemoryNetwork::new());
    network.insert("id-1", Bytes::from_static(b"first file"));
    network.insert("id-2", Bytes::from_static(b"second file"));

    let entry = |name: &str, id: &str, content: &[u8]| ManifestEntry {
        file_path: PathBuf::from("/original").join(name),
        file_id: id.to_string(),
        size: content.len() as u64,
        checksum: compute_hash(content),
        backup_time: Utc::now(),
        permissions: 0o644,
        compressed: false,
        compression: None,
        encrypted: false,
    };
    let mut manifest = RestoreManifest::new("backup-test", "/original");
    manifest.files.push(entry("one.txt", "id-1", b"first file"));
    manifest.files.push(entry("two.txt", "id-2", b"second file"));

    let target = TempDir::new().unwrap();
    let restore = RestoreService::new(
        network.clone(),
        TransformPipeline::identity(),
        RestoreOptions {
            workers: 1,
            keep_transformed: false,
        },
    );
    let progress = restore.restore(&manifest, target.path()).await.unwrap();

    assert_eq!(progress.restored, 2);
    assert_eq!(progress.failed, 0);
    assert!(progress.errors.is_empty());
    assert_eq!(fs::read(target.path().join("one.txt")).unwrap(), b"first file");
    assert_eq!(fs::read(target.path().join("two.txt")).unwrap(), b"second file");

    // Running again finds both files already in place
    let again = restore.restore(&manifest, target.path()).await.unwrap();
    assert_eq!(again.restored, 2);
    assert_eq!(network.download_count(), 2);
}

#[tokio::test]
async fn test_compressed_encrypted_backup_restores_original_bytes() {
    let source = TempDir::new().unwrap();
    let mut content = Vec::with_capacity(20_000);
    for i in 0..20_000u32 {
        content.push((i % 251) as u8);
    }
    let path = write_file(source.path(), "payload.bin", &content);

    let transform = TransformConfig::new(CompressionAlgorithm::Gzip, 6).with_password("s3cret");
    let state = Arc::new(MemoryStateStore::new());
    let network = Arc::new(InMemoryNetwork::new());
    let reporter = Arc::new(BackupReporter::in_memory());
    let service = service(
        2,
        state,
        network.clone(),
        reporter.clone(),
        TransformPipeline::new(transform.clone()),
    );
    service.start().await.unwrap();
    service
        .submit_change(ChangeEvent::new(&path, Operation::Manual, 0))
        .unwrap();
    service.wait_idle().await;
    service.stop().await;

    let report = reporter.finish_report(Map::new()).unwrap();
    let manifest = RestoreManifest::from_report(&report);
    assert_eq!(manifest.files.len(), 1);
    assert!(manifest.files[0].encrypted);
    assert_eq!(manifest.files[0].flags().compression, CompressionAlgorithm::Gzip);

    let stored = network.object(&manifest.files[0].file_id).unwrap();
    assert_ne!(stored.as_ref(), content.as_slice());

    let target = TempDir::new().unwrap();
    let restore = RestoreService::new(
        network,
        TransformPipeline::new(transform),
        RestoreOptions::default(),
    );
    let progress = restore.restore(&manifest, target.path()).await.unwrap();
    assert_eq!(progress.restored, 1);
    assert_eq!(fs::read(target.path().join("payload.bin")).unwrap(), content);
}

#[tokio::test]
async fn test_restore_with_wrong_password_fails_entry() {
    let source = TempDir::new().unwrap();
    let path = write_file(source.path(), "secret.txt", b"classified");

    let network = Arc::new(InMemoryNetwork::new());
    let reporter = Arc::new(BackupReporter::in_memory());
    let service = service(
        1,
        Arc::new(MemoryStateStore::new()),
        network.clone(),
        reporter.clone(),
        TransformPipeline::new(TransformConfig::default().with_password("p1")),
    );
    service.start().await.unwrap();
    service
        .submit_change(ChangeEvent::new(&path, Operation::Create, 0))
        .unwrap();
    service.wait_idle().await;
    service.stop().await;

    let manifest = RestoreManifest::from_report(&reporter.current_report().unwrap());
    let target = TempDir::new().unwrap();
    let restore = RestoreService::new(
        network,
        TransformPipeline::new(TransformConfig::default().with_password("p2")),
        RestoreOptions::default(),
    );
    let progress = restore.restore(&manifest, target.path()).await.unwrap();

    assert_eq!(progress.failed, 1);
    assert_eq!(progress.errors.len(), 1);
    assert!(!target.path().join("secret.txt").exists());
}

#[tokio::test]
async fn test_config_drives_pipeline() {
    let mut config = Config::default();
    config.backup.compression.enabled = true;
    config.backup.compression.format = "deflate".into();
    config.backup.exclude_patterns = vec!["*.tmp".into()];

    let pipeline = TransformPipeline::new(config.transform_config().unwrap());
    assert_eq!(pipeline.flags().compression, CompressionAlgorithm::Deflate);
    assert!(!pipeline.flags().encrypted);

    let source = TempDir::new().unwrap();
    let kept = write_file(source.path(), "kept.txt", b"keep me");
    let skipped = write_file(source.path(), "scratch.tmp", b"skip me");

    let network = Arc::new(InMemoryNetwork::new());
    let service = BackupService::new(
        config.service_config(),
        Arc::new(MemoryStateStore::new()),
        network.clone(),
        Arc::new(BackupReporter::in_memory()),
        pipeline,
    );
    service.start().await.unwrap();
    let excludes = config.exclude_set().unwrap();
    for path in [kept, skipped] {
        if excludes.is_excluded(&path) {
            continue;
        }
        service
            .submit_change(ChangeEvent::new(path, Operation::Manual, 0))
            .unwrap();
    }
    service.wait_idle().await;
    service.stop().await;

    assert_eq!(network.upload_count(), 1);
}
