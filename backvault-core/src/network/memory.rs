use super::NetworkAdapter;
use crate::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;
use uuid::Uuid;

/// Arguments of one accepted upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
    pub remote_id: String,
}

/// Object store held in process memory
///
/// Useful for dry runs and for exercising the pipelines without a server.
/// Records every upload it accepts and counts the downloads it serves.
#[derive(Debug, Default)]
pub struct InMemoryNetwork {
    objects: RwLock<HashMap<String, Bytes>>,
    uploads: RwLock<Vec<UploadRecord>>,
    downloads: AtomicUsize,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object under a known identifier
    pub fn insert(&self, remote_id: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.write().insert(remote_id.into(), data.into());
    }

    pub fn object(&self, remote_id: &str) -> Option<Bytes> {
        self.objects.read().get(remote_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.read().len()
    }

    /// Accepted uploads in arrival order
    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.uploads.read().clone()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkAdapter for InMemoryNetwork {
    async fn upload(&self, path: &Path, data: Bytes, size: u64, checksum: &str) -> Result<String> {
        if data.len() as u64 != size {
            return Err(BackupError::client(
                Some(400),
                format!("declared size {size} does not match body length {}", data.len()),
            ));
        }

        let remote_id = Uuid::new_v4().to_string();
        debug!(path = %path.display(), remote_id = %remote_id, checksum, size, "Stored object in memory");
        self.objects.write().insert(remote_id.clone(), data);
        self.uploads.write().push(UploadRecord {
            path: path.to_path_buf(),
            size,
            checksum: checksum.to_string(),
            remote_id: remote_id.clone(),
        });
        Ok(remote_id)
    }

    async fn download(&self, remote_id: &str) -> Result<Bytes> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.object(remote_id)
            .ok_or_else(|| BackupError::client(Some(404), format!("file {remote_id} not found")))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
