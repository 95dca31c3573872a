/*!
Observability infrastructure for Backvault.

This module provides:
- Structured logging setup (`tracing-subscriber` with JSON or compact output)
- Prometheus metrics instrumentation (behind the `metrics` feature)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{BackupError, Result};

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<BackupMetrics> = OnceLock::new();

/// Metrics collection for backup and restore operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct BackupMetrics {
    pub uploads_total: Counter,
    pub upload_errors_total: Counter,
    pub upload_latency_seconds: Histogram,
    pub downloads_total: Counter,
    pub tasks_dropped_total: Counter,
    pub retries_total: Counter,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> BackupError {
    BackupError::config(format!("failed to set up metric {name}: {e}"))
}

#[cfg(feature = "metrics")]
impl BackupMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter> {
            let counter = Counter::new(name, help).map_err(|e| metric_error(name, e))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| metric_error(name, e))?;
            Ok(counter)
        };

        let uploads_total = counter("backvault_uploads_total", "Total successful uploads")?;
        let upload_errors_total =
            counter("backvault_upload_errors_total", "Total failed backup tasks")?;
        let downloads_total = counter("backvault_downloads_total", "Total restore downloads")?;
        let tasks_dropped_total = counter(
            "backvault_tasks_dropped_total",
            "Tasks dropped because the queue was full",
        )?;
        let retries_total = counter("backvault_retries_total", "Network retry attempts")?;

        let upload_latency_seconds = Histogram::with_opts(prometheus::HistogramOpts::new(
            "backvault_upload_latency_seconds",
            "Duration of uploads in seconds",
        ))
        .map_err(|e| metric_error("backvault_upload_latency_seconds", e))?;
        registry
            .register(Box::new(upload_latency_seconds.clone()))
            .map_err(|e| metric_error("backvault_upload_latency_seconds", e))?;

        Ok(Self {
            uploads_total,
            upload_errors_total,
            upload_latency_seconds,
            downloads_total,
            tasks_dropped_total,
            retries_total,
            registry,
        })
    }

    /// Get or initialize global metrics instance
    pub fn global() -> &'static BackupMetrics {
        METRICS.get_or_init(|| match Self::new() {
            Ok(metrics) => metrics,
            // Names are static; registration can only fail on a programming error
            Err(e) => panic!("failed to initialize backup metrics: {e}"),
        })
    }

    pub fn record_upload(&self, duration: std::time::Duration) {
        self.uploads_total.inc();
        self.upload_latency_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_upload_error(&self) {
        self.upload_errors_total.inc();
    }

    pub fn record_download(&self) {
        self.downloads_total.inc();
    }

    pub fn record_dropped_task(&self) {
        self.tasks_dropped_total.inc();
    }

    pub fn record_retry(&self) {
        self.retries_total.inc();
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| BackupError::config(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| BackupError::config(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Times one upload and records it on completion
#[cfg(feature = "metrics")]
pub struct UploadTimer {
    start: Instant,
}

#[cfg(feature = "metrics")]
impl UploadTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        BackupMetrics::global().record_upload(self.start.elapsed());
    }

    pub fn finish_with_error(self) {
        BackupMetrics::global().record_upload_error();
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `level` when set.
///
/// # Arguments
/// * `level` - Default filter directive, e.g. `info` or `backvault_core=debug`
/// * `json` - Emit JSON lines instead of compact human readable output
pub fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| BackupError::config(format!("invalid log level '{level}': {e}")))?;

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().compact().with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };
    result.map_err(|e| BackupError::config(format!("Failed to set global tracing subscriber: {e}")))?;

    #[cfg(feature = "metrics")]
    BackupMetrics::global();

    tracing::debug!(level, json, "Logging initialized");
    Ok(())
}
