/*!
# Backvault Core Engine

Change-driven file backup and manifest-driven restore.

The backup side consumes file change events, skips files whose content is already
backed up, optionally compresses and encrypts the bytes, uploads them through a
[`NetworkAdapter`] and records per-file state and history in a [`StateStore`].
The restore side reads a [`RestoreManifest`], downloads every entry with bounded
concurrency, reverses the transforms, verifies checksums and writes files atomically.

## Architecture

- Persistence and the remote store sit behind traits ([`StateStore`], [`NetworkAdapter`])
- A bounded [`TaskQueue`] feeds a fixed worker pool; writes to one path are serialized
- Transient network failures are retried inside the adapter with quadratic backoff

## Usage

```rust,no_run
use backvault_core::{
    BackupReporter, BackupService, BackupServiceConfig, ChangeEvent, InMemoryNetwork,
    MemoryStateStore, Operation, TransformPipeline,
};
use std::sync::Arc;

# async fn run() -> backvault_core::Result<()> {
let service = BackupService::new(
    BackupServiceConfig::default(),
    Arc::new(MemoryStateStore::new()),
    Arc::new(InMemoryNetwork::new()),
    Arc::new(BackupReporter::in_memory()),
    TransformPipeline::identity(),
);

service.start().await?;
service.submit_change(ChangeEvent::new("/data/a.txt", Operation::Create, 1))?;
service.wait_idle().await;
service.stop().await;
# Ok(())
# }
```
*/

pub mod checksum;
pub mod classifier;
pub mod config;
pub mod error;
#[cfg(test)]
mod error_tests;
pub mod event;
pub mod manifest;
pub mod network;
pub mod observability;
pub mod queue;
pub mod report;
pub mod restore;
pub mod service;
pub mod state;
pub mod transform;

pub use classifier::ChangeClassifier;
pub use config::{Config, ExcludeSet};
pub use error::{BackupError, CryptoFailure, Result};
pub use event::{BackupTask, ChangeEvent, Operation};
pub use manifest::{ManifestEntry, RestoreManifest};
pub use network::{InMemoryNetwork, NetworkAdapter, UploadRecord};
#[cfg(feature = "http")]
pub use network::{HttpNetwork, HttpNetworkConfig, RemoteDirectory, RemoteFile};
pub use queue::{SubmitOutcome, TaskHandler, TaskQueue};
pub use report::{BackupReport, BackupReporter, BackupResult, Reporter};
pub use restore::{RestoreOptions, RestoreProgress, RestoreReport, RestoreService};
pub use service::{BackupService, BackupServiceConfig, ServiceStats};
#[cfg(feature = "sqlite")]
pub use state::SqliteStateStore;
pub use state::{
    BackupRecord, BackupStats, BackupStatus, FileBackupState, MemoryStateStore, SearchCriteria,
    StateStore,
};
pub use transform::{CompressionAlgorithm, TransformConfig, TransformFlags, TransformPipeline};

#[cfg(feature = "metrics")]
pub use observability::{BackupMetrics, UploadTimer};
pub use observability::init_logging;
