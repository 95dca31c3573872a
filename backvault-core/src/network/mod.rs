/*!
Network adapters: the remote object store seen by the backup and restore pipelines.

Adapters own their retry behaviour. Transient failures (connection errors, timeouts,
server errors) are retried inside the adapter with quadratic backoff; client errors
surface immediately as [`BackupError::PermanentClient`](crate::BackupError::PermanentClient).
*/

#[cfg(feature = "http")]
pub mod http;
mod memory;

#[cfg(feature = "http")]
pub use http::{HttpNetwork, HttpNetworkConfig, RemoteDirectory, RemoteFile};
pub use memory::{InMemoryNetwork, UploadRecord};

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

/// Remote object store abstraction
#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    /// Store `data` (already transformed) for `path`
    ///
    /// # Arguments
    /// * `path` - Local path the content came from; only its file name is sent
    /// * `data` - Bytes to upload
    /// * `size` - Length of `data`
    /// * `checksum` - SHA-256 of the original, untransformed content
    ///
    /// # Returns
    /// The remote identifier to use for later downloads
    async fn upload(&self, path: &Path, data: Bytes, size: u64, checksum: &str) -> Result<String>;

    /// Fetch the bytes stored under `remote_id`
    async fn download(&self, remote_id: &str) -> Result<Bytes>;

    /// Verify the remote end is reachable and accepting requests
    async fn health_check(&self) -> Result<()>;
}
