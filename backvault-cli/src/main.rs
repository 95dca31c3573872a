/*!
Backvault CLI - Command-line interface for the Backvault backup pipeline.

This CLI runs one-shot backups of configured directories, restores files from
manifests, and inspects the local state database and backup reports.
*/

use anyhow::{anyhow, bail, Context};
use backvault_core::report::format_size;
use backvault_core::{
    init_logging, BackupRecord, BackupReport, BackupReporter, BackupService, BackupStatus,
    ChangeEvent, CompressionAlgorithm, Config, HttpNetwork, InMemoryNetwork, MemoryStateStore,
    NetworkAdapter, Operation, RemoteDirectory, RemoteFile, RestoreManifest, RestoreProgress,
    RestoreService, SearchCriteria, SqliteStateStore, StateStore, SubmitOutcome, TransformFlags,
    TransformPipeline,
};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{Table, Tabled};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "backvault")]
#[command(about = "Change-driven file backup and manifest-driven restore")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./backvault.toml when present)
    #[arg(short, long, global = true, env = "BACKVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// API base URL
    #[arg(long, global = true, env = "BACKVAULT_BASE_URL")]
    base_url: Option<String>,

    /// API client identifier
    #[arg(long, global = true, env = "BACKVAULT_CLIENT_ID")]
    client_id: Option<String>,

    /// API client secret
    #[arg(long, global = true, env = "BACKVAULT_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Encryption password; enables encryption for backups
    #[arg(long, global = true, env = "BACKVAULT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// State database path
    #[arg(long, global = true, env = "BACKVAULT_DATABASE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up files under the given paths (or the configured directories)
    Backup {
        paths: Vec<PathBuf>,
        /// Write a restore manifest for this run
        #[arg(short, long)]
        manifest: Option<PathBuf>,
        /// Use an in-memory store and network instead of the real ones
        #[arg(long)]
        dry_run: bool,
        /// Print Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,
    },
    /// Restore every file listed in a manifest
    Restore {
        manifest: PathBuf,
        /// Directory the files are written into
        #[arg(short, long, default_value = ".")]
        target: PathBuf,
        /// Concurrent downloads (overrides the configuration)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Write stored bytes without decompressing or decrypting them
        #[arg(long)]
        keep_transformed: bool,
    },
    /// Restore a single stored object
    RestoreFile {
        file_id: String,
        target: PathBuf,
        /// Compression applied to the stored object
        #[arg(long, default_value = "none")]
        compression: String,
        /// The stored object is encrypted
        #[arg(long)]
        encrypted: bool,
    },
    /// Build a restore manifest from a backup report
    Manifest {
        /// Report file (defaults to the latest report)
        #[arg(short, long)]
        report: Option<PathBuf>,
        /// Where to write the manifest
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Show state database statistics, or the state of one file
    Status {
        path: Option<PathBuf>,
    },
    /// Show the backup history of a file
    History {
        path: PathBuf,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Search backup history
    Search {
        /// Substring of the file path
        #[arg(short, long)]
        path: Option<String>,
        /// success, failed or deleted
        #[arg(short, long)]
        status: Option<String>,
        /// Only records from the last N hours
        #[arg(long)]
        since_hours: Option<i64>,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show the latest backup report, or a given report file
    Report {
        file: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove history and deleted-file states older than the retention period
    Cleanup {
        /// Retention in days (overrides the configuration)
        #[arg(long)]
        days: Option<u32>,
    },
    /// Manage the remote directories uploads are filed under
    Directories {
        #[command(subcommand)]
        action: DirectoryAction,
    },
    /// Write a default configuration file
    Init {
        #[arg(short, long, default_value = "backvault.toml")]
        output: PathBuf,
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum DirectoryAction {
    /// List remote directories
    List,
    /// Create a remote directory
    Create {
        name: String,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Remove a remote directory and every file in it
    Remove {
        id: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// List the files stored in a remote directory
    Files { id: String },
}

#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Operation")]
    operation: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Stored")]
    stored: String,
    #[tabled(rename = "Checksum")]
    checksum: String,
}

impl From<&BackupRecord> for RecordRow {
    fn from(record: &BackupRecord) -> Self {
        Self {
            time: format_time(record.backup_time),
            path: record.file_path.display().to_string(),
            operation: record.operation.to_string(),
            status: match &record.error_message {
                Some(message) => format!("{} ({message})", record.status),
                None => record.status.to_string(),
            },
            size: format_size(record.original_size),
            stored: format_size(record.transformed_size),
            checksum: short_checksum(&record.checksum),
        }
    }
}

#[derive(Tabled)]
struct StatRow {
    #[tabled(rename = "Metric")]
    metric: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Tabled)]
struct DirectoryRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Files")]
    files: u64,
    #[tabled(rename = "Size")]
    size: String,
}

impl From<&RemoteDirectory> for DirectoryRow {
    fn from(directory: &RemoteDirectory) -> Self {
        Self {
            id: directory.id.clone(),
            name: directory.name.clone(),
            created: DateTime::parse_from_rfc3339(&directory.created_at)
                .map(|t| format_time(t.with_timezone(&Utc)))
                .unwrap_or_else(|_| directory.created_at.clone()),
            files: directory.file_count,
            size: format_size(directory.total_size),
        }
    }
}

#[derive(Tabled)]
struct RemoteFileRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Hash")]
    hash: String,
}

impl From<&RemoteFile> for RemoteFileRow {
    fn from(file: &RemoteFile) -> Self {
        Self {
            id: file.id.clone(),
            name: file.name.clone(),
            size: format_size(file.size),
            hash: short_checksum(&file.hash),
        }
    }
}

#[derive(Tabled)]
struct FailureRow {
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "File ID")]
    file_id: String,
    #[tabled(rename = "Error")]
    error: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli);

    let level = if cli.verbose {
        "debug"
    } else {
        config.log.level.as_str()
    };
    init_logging(level, config.log.is_json())?;

    match cli.command {
        Commands::Backup {
            paths,
            manifest,
            dry_run,
            metrics,
        } => {
            let report = run_backup(&config, paths, manifest.as_deref(), dry_run).await?;
            debug!(report_id = %report.id, "Backup run complete");
            if metrics {
                print_metrics()?;
            }
        }
        Commands::Restore {
            manifest,
            target,
            workers,
            keep_transformed,
        } => run_restore(&config, &manifest, &target, workers, keep_transformed).await?,
        Commands::RestoreFile {
            file_id,
            target,
            compression,
            encrypted,
        } => restore_single(&config, &file_id, &target, &compression, encrypted).await?,
        Commands::Manifest { report, output } => write_manifest(&config, report.as_deref(), &output)?,
        Commands::Status { path } => show_status(&config, path.as_deref())?,
        Commands::History { path, limit } => show_history(&config, &path, limit)?,
        Commands::Search {
            path,
            status,
            since_hours,
            limit,
        } => search_history(&config, path, status.as_deref(), since_hours, limit)?,
        Commands::Report { file, json } => show_report(&config, file.as_deref(), json)?,
        Commands::Cleanup { days } => cleanup(&config, days)?,
        Commands::Directories { action } => manage_directories(&config, action).await?,
        Commands::Init { output, force } => init_config(&output, force)?,
    }

    Ok(())
}

/// Command-line and environment values win over the configuration file
fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(base_url) = &cli.base_url {
        config.api.base_url = base_url.clone();
    }
    if let Some(client_id) = &cli.client_id {
        config.api.client_id = client_id.clone();
    }
    if let Some(client_secret) = &cli.client_secret {
        config.api.client_secret = client_secret.clone();
    }
    if let Some(password) = &cli.password {
        config.backup.encryption.enabled = true;
        config.backup.encryption.password = password.clone();
    }
    if let Some(database) = &cli.database {
        config.database.path = database.clone();
    }
}

fn open_store(config: &Config) -> Result<SqliteStateStore, anyhow::Error> {
    SqliteStateStore::open(&config.database.path)
        .with_context(|| format!("opening state database {}", config.database.path.display()))
}

fn http_client(config: &Config) -> Result<HttpNetwork, anyhow::Error> {
    config.validate_api()?;
    Ok(HttpNetwork::new(config.http_network_config())?)
}

fn connect(config: &Config) -> Result<Arc<dyn NetworkAdapter>, anyhow::Error> {
    Ok(Arc::new(http_client(config)?))
}

/// Client for a backup run; without a configured directory a fresh one is created
async fn connect_for_backup(config: &Config) -> Result<Arc<dyn NetworkAdapter>, anyhow::Error> {
    let mut network = http_client(config)?;
    if network.directory_id().is_none() {
        let name = format!("backvault-{}", Local::now().format("%Y%m%d-%H%M%S"));
        let directory = network
            .create_directory(&name, "One-time backup directory created by backvault")
            .await
            .context("creating remote backup directory")?;
        println!(
            "Created remote directory {} ({}); set api.directory_id to reuse it",
            directory.name, directory.id
        );
        network.set_directory_id(directory.id);
    }
    Ok(Arc::new(network))
}

async fn run_backup(
    config: &Config,
    paths: Vec<PathBuf>,
    manifest_path: Option<&Path>,
    dry_run: bool,
) -> Result<BackupReport, anyhow::Error> {
    let roots = if paths.is_empty() {
        config.backup.directories.clone()
    } else {
        paths
    };
    if roots.is_empty() {
        bail!("no paths given and no backup directories configured");
    }

    let pipeline = TransformPipeline::new(config.transform_config()?);
    let excludes = config.exclude_set()?;
    let state: Arc<dyn StateStore>;
    let network: Arc<dyn NetworkAdapter>;
    let reporter: Arc<BackupReporter>;
    if dry_run {
        info!("Dry run: using in-memory state and network");
        state = Arc::new(MemoryStateStore::new());
        network = Arc::new(InMemoryNetwork::new());
        reporter = Arc::new(BackupReporter::in_memory());
    } else {
        state = Arc::new(open_store(config)?);
        network = connect_for_backup(config).await?;
        reporter = Arc::new(BackupReporter::new(
            &config.report.directory,
            config.report.retention,
        )?);
    }

    let service = BackupService::new(
        config.service_config(),
        state,
        network,
        reporter.clone(),
        pipeline,
    );
    service.start().await?;
    reporter.start_new_report();

    let mut queued = 0usize;
    let mut requeued = 0u64;
    for root in &roots {
        info!(root = %root.display(), "Scanning directory");
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !excludes.is_excluded(entry.path()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or_default();
            let event = ChangeEvent::new(entry.path(), Operation::Manual, size);
            let (outcome, turned_away) = submit_waiting(&service, event).await?;
            requeued += turned_away;
            if outcome.is_queued() {
                queued += 1;
            }
        }
    }

    info!(queued, "Waiting for backup tasks to finish");
    service.wait_idle().await;
    service.stop().await;

    let mut stats = service.get_stats()?;
    // Submissions turned away by a full queue were resubmitted, not lost
    stats.dropped_tasks = stats.dropped_tasks.saturating_sub(requeued);
    let mut statistics = match serde_json::to_value(&stats)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    statistics.insert("requeued_tasks".to_string(), Value::from(requeued));
    let report = reporter.finish_report(statistics)?;
    print_report(&report);

    if let Some(path) = manifest_path {
        let manifest = RestoreManifest::from_report(&report);
        manifest.save(path)?;
        println!(
            "Manifest with {} files written to {}",
            manifest.files.len(),
            path.display()
        );
    }

    if report.failed > 0 {
        bail!("{} of {} files failed to back up", report.failed, report.total_files);
    }
    Ok(report)
}

/// Submit `event`, waiting for the queue to drain when it is full
///
/// # Returns
/// The final outcome and how many submissions the full queue turned away
async fn submit_waiting(
    service: &BackupService,
    event: ChangeEvent,
) -> Result<(SubmitOutcome, u64), anyhow::Error> {
    let mut turned_away = 0u64;
    loop {
        match service.submit_change(event.clone())? {
            SubmitOutcome::QueueFull => {
                turned_away += 1;
                debug!(path = %event.path.display(), "Queue full, waiting for workers");
                service.wait_idle().await;
            }
            outcome => return Ok((outcome, turned_away)),
        }
    }
}

async fn run_restore(
    config: &Config,
    manifest: &Path,
    target: &Path,
    workers: Option<usize>,
    keep_transformed: bool,
) -> Result<(), anyhow::Error> {
    let mut options = config.restore_options();
    if let Some(workers) = workers {
        options.workers = workers.max(1);
    }
    options.keep_transformed |= keep_transformed;

    let pipeline = TransformPipeline::new(config.transform_config()?);
    let service = RestoreService::new(connect(config)?, pipeline, options);
    let progress = service.restore_from_manifest(manifest, target).await?;

    print_restore(&progress, target);
    if progress.failed > 0 {
        bail!("{} of {} files failed to restore", progress.failed, progress.total);
    }
    Ok(())
}

async fn restore_single(
    config: &Config,
    file_id: &str,
    target: &Path,
    compression: &str,
    encrypted: bool,
) -> Result<(), anyhow::Error> {
    let flags = TransformFlags {
        compression: compression.parse::<CompressionAlgorithm>()?,
        encrypted,
    };
    if flags.encrypted && config.backup.encryption.password.is_empty() {
        bail!("an encryption password is required to restore an encrypted object");
    }

    let pipeline = TransformPipeline::new(config.transform_config()?);
    let service = RestoreService::new(connect(config)?, pipeline, config.restore_options());
    let size = service.restore_file(file_id, target, flags).await?;

    println!("✓ Restored {} ({}) to {}", file_id, format_size(size), target.display());
    Ok(())
}

fn latest_report(config: &Config) -> Result<BackupReport, anyhow::Error> {
    let reporter = BackupReporter::new(&config.report.directory, config.report.retention)?;
    reporter
        .latest_report()?
        .ok_or_else(|| anyhow!("no backup reports found in {}", config.report.directory.display()))
}

fn write_manifest(config: &Config, report: Option<&Path>, output: &Path) -> Result<(), anyhow::Error> {
    let report = match report {
        Some(path) => BackupReport::load(path)?,
        None => latest_report(config)?,
    };

    let manifest = RestoreManifest::from_report(&report);
    manifest.save(output)?;
    println!(
        "✓ Manifest for {} with {} files ({}) written to {}",
        report.id,
        manifest.files.len(),
        format_size(manifest.total_size()),
        output.display()
    );
    Ok(())
}

fn show_status(config: &Config, path: Option<&Path>) -> Result<(), anyhow::Error> {
    let store = open_store(config)?;

    if let Some(path) = path {
        match store.get(path)? {
            Some(state) => {
                println!("File State:");
                println!("  Path: {}", path.display());
                println!("  Status: {}", state.status);
                println!("  Backups: {}", state.backup_count);
                println!("  Last Backup: {}", format_time(state.last_backup_time));
                println!("  Checksum: {}", state.last_checksum);
            }
            None => println!("No backup state recorded for {}", path.display()),
        }
        return Ok(());
    }

    let stats = store.stats()?;
    let rows = vec![
        StatRow {
            metric: "Tracked files",
            value: stats.total_files.to_string(),
        },
        StatRow {
            metric: "Successful",
            value: stats.successful_files.to_string(),
        },
        StatRow {
            metric: "Failed",
            value: stats.failed_files.to_string(),
        },
        StatRow {
            metric: "Deleted",
            value: stats.deleted_files.to_string(),
        },
        StatRow {
            metric: "Backed up",
            value: format_size(stats.total_original_size),
        },
        StatRow {
            metric: "Stored",
            value: format_size(stats.total_transformed_size),
        },
        StatRow {
            metric: "Backups (24h)",
            value: stats.recent_backups_24h.to_string(),
        },
    ];
    println!("{}", Table::new(rows));
    Ok(())
}

fn show_history(config: &Config, path: &Path, limit: usize) -> Result<(), anyhow::Error> {
    let records = open_store(config)?.history(path, limit)?;
    print_records(&records);
    Ok(())
}

fn search_history(
    config: &Config,
    path: Option<String>,
    status: Option<&str>,
    since_hours: Option<i64>,
    limit: Option<usize>,
) -> Result<(), anyhow::Error> {
    let criteria = SearchCriteria {
        path_contains: path,
        status: status.map(str::parse::<BackupStatus>).transpose()?,
        start_time: since_hours.map(|h| Utc::now() - chrono::Duration::hours(h)),
        end_time: None,
        limit,
    };

    let records = open_store(config)?.search(&criteria)?;
    print_records(&records);
    Ok(())
}

fn show_report(config: &Config, file: Option<&Path>, json: bool) -> Result<(), anyhow::Error> {
    let report = match file {
        Some(path) => BackupReport::load(path)?,
        None => latest_report(config)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn cleanup(config: &Config, days: Option<u32>) -> Result<(), anyhow::Error> {
    let retention = match days {
        Some(days) => chrono::Duration::days(i64::from(days)),
        None => config.history_retention(),
    };
    let cutoff = Utc::now() - retention;

    let store = open_store(config)?;
    let states = store.purge_deleted(cutoff)?;
    let records = store.cleanup_records(cutoff)?;

    println!(
        "✓ Removed {states} deleted file states and {records} history records older than {}",
        format_time(cutoff)
    );
    Ok(())
}

async fn manage_directories(config: &Config, action: DirectoryAction) -> Result<(), anyhow::Error> {
    let network = http_client(config)?;

    match action {
        DirectoryAction::List => {
            let directories = network.list_directories().await?;
            if directories.is_empty() {
                println!("No directories found");
                return Ok(());
            }
            let rows: Vec<DirectoryRow> = directories.iter().map(DirectoryRow::from).collect();
            println!("{}", Table::new(rows));
        }
        DirectoryAction::Create { name, description } => {
            let description = description.unwrap_or_else(|| {
                format!(
                    "Backup directory created by backvault at {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S")
                )
            });
            let directory = network.create_directory(&name, &description).await?;
            println!("✓ Created directory {} ({})", directory.name, directory.id);
            println!("  Set api.directory_id = \"{}\" to back up into it", directory.id);
        }
        DirectoryAction::Remove { id, force } => {
            let directory = network
                .list_directories()
                .await?
                .into_iter()
                .find(|d| d.id == id)
                .ok_or_else(|| anyhow!("directory not found: {id}"))?;

            if !force {
                println!(
                    "Remove directory '{}' ({}) with {} files totaling {}?",
                    directory.name,
                    directory.id,
                    directory.file_count,
                    format_size(directory.total_size)
                );
                if !confirm(io::stdin().lock(), "This cannot be undone. Type 'yes' to confirm: ")? {
                    println!("Cancelled");
                    return Ok(());
                }
            }

            network.delete_directory(&id).await?;
            println!("✓ Removed directory {} ({id})", directory.name);
        }
        DirectoryAction::Files { id } => {
            let files = network.directory_files(&id).await?;
            if files.is_empty() {
                println!("No files in directory {id}");
                return Ok(());
            }
            let rows: Vec<RemoteFileRow> = files.iter().map(RemoteFileRow::from).collect();
            println!("{}", Table::new(rows));
        }
    }
    Ok(())
}

/// Ask on stdout and read one line; only "yes" confirms
fn confirm(mut input: impl BufRead, prompt: &str) -> Result<bool, anyhow::Error> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}

fn init_config(output: &Path, force: bool) -> Result<(), anyhow::Error> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }

    Config::default().save(output)?;
    println!("✓ Default configuration written to {}", output.display());
    println!("  Set api.client_id, api.client_secret and backup.directories before running a backup");
    Ok(())
}

#[cfg(feature = "metrics")]
fn print_metrics() -> Result<(), anyhow::Error> {
    print!("{}", backvault_core::BackupMetrics::global().gather_metrics()?);
    Ok(())
}

#[cfg(not(feature = "metrics"))]
fn print_metrics() -> Result<(), anyhow::Error> {
    warn!("Built without the metrics feature; nothing to print");
    Ok(())
}

fn print_report(report: &BackupReport) {
    println!("Backup Report:");
    println!("  ID: {}", report.id);
    println!("  Started: {}", format_time(report.start_time));
    if let Some(end_time) = report.end_time {
        println!("  Finished: {}", format_time(end_time));
    }
    println!("  Duration: {:.1}s", report.duration);
    println!("  Files: {}", report.total_files);
    println!("  Successful: {}", report.successful);
    println!("  Failed: {}", report.failed);
    println!("  Total Size: {}", format_size(report.total_size));
    println!("  Success Rate: {:.2}%", report.success_rate());

    let failures: Vec<FailureRow> = report
        .results
        .iter()
        .filter(|r| !r.success)
        .map(|r| FailureRow {
            path: r.path.display().to_string(),
            file_id: r.remote_id.clone().unwrap_or_default(),
            error: r.error.clone().unwrap_or_else(|| "unknown error".to_string()),
        })
        .collect();
    if !failures.is_empty() {
        println!("\nFailed Files:");
        println!("{}", Table::new(failures));
    }
}

fn print_restore(progress: &RestoreProgress, target: &Path) {
    println!("Restore Summary:");
    println!("  Target: {}", target.display());
    println!("  Files: {}", progress.total);
    println!("  Restored: {} ({} already present)", progress.restored, progress.skipped);
    println!("  Failed: {}", progress.failed);
    println!(
        "  Size: {} of {}",
        format_size(progress.restored_size),
        format_size(progress.total_size)
    );
    println!("  Success Rate: {:.2}%", progress.success_rate());

    if !progress.errors.is_empty() {
        let rows: Vec<FailureRow> = progress
            .errors
            .iter()
            .map(|e| FailureRow {
                path: e.path.display().to_string(),
                file_id: e.remote_id.clone(),
                error: e.message.clone(),
            })
            .collect();
        println!("\nFailed Files:");
        println!("{}", Table::new(rows));
    }
}

fn print_records(records: &[BackupRecord]) {
    if records.is_empty() {
        println!("No backup records found");
        return;
    }
    let rows: Vec<RecordRow> = records.iter().map(RecordRow::from).collect();
    println!("{}", Table::new(rows));
}

fn short_checksum(checksum: &str) -> String {
    checksum.chars().take(12).collect()
}

fn format_time(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parses_backup() {
        let cli = Cli::try_parse_from([
            "backvault",
            "--client-id",
            "id",
            "backup",
            "/data",
            "--manifest",
            "out.json",
            "--dry-run",
        ])
        .unwrap();

        assert_eq!(cli.client_id.as_deref(), Some("id"));
        match cli.command {
            Commands::Backup {
                paths,
                manifest,
                dry_run,
                ..
            } => {
                assert_eq!(paths, vec![PathBuf::from("/data")]);
                assert_eq!(manifest, Some(PathBuf::from("out.json")));
                assert!(dry_run);
            }
            _ => panic!("expected backup command"),
        }
    }

    #[test]
    fn test_overrides_win_over_file() {
        let cli = Cli::try_parse_from([
            "backvault",
            "--base-url",
            "https://backup.example.com",
            "--password",
            "pw",
            "status",
        ])
        .unwrap();

        let mut config = Config::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.api.base_url, "https://backup.example.com");
        assert!(config.backup.encryption.enabled);
        assert_eq!(config.backup.encryption.password, "pw");
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backvault.toml");

        init_config(&path, false).unwrap();
        assert!(Config::load(&path).is_ok());
        assert!(init_config(&path, false).is_err());
        assert!(init_config(&path, true).is_ok());
    }

    #[tokio::test]
    async fn test_dry_run_backup_with_manifest() {
        let source = TempDir::new().unwrap();
        std::fs::write(source.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(source.path().join("skip.tmp"), b"scratch").unwrap();
        std::fs::create_dir(source.path().join("nested")).unwrap();
        std::fs::write(source.path().join("nested/b.txt"), b"beta").unwrap();

        let mut config = Config::default();
        config.backup.exclude_patterns = vec!["*.tmp".into()];
        let manifest_path = source.path().join("out/manifest.json");

        run_backup(
            &config,
            vec![source.path().to_path_buf()],
            Some(&manifest_path),
            true,
        )
        .await
        .unwrap();

        let manifest = RestoreManifest::load(&manifest_path).unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert!(manifest
            .files
            .iter()
            .all(|f| f.file_path.extension().is_some_and(|e| e == "txt")));
    }

    #[tokio::test]
    async fn test_full_queue_resubmissions_are_not_counted_as_drops() {
        let source = TempDir::new().unwrap();
        for i in 0..40 {
            std::fs::write(source.path().join(format!("f{i:02}.txt")), format!("file {i}")).unwrap();
        }

        let mut config = Config::default();
        config.backup.concurrent = 1;
        config.backup.queue_capacity = 1;

        let report = run_backup(&config, vec![source.path().to_path_buf()], None, true)
            .await
            .unwrap();

        assert_eq!(report.total_files, 40);
        assert_eq!(report.successful, 40);
        assert_eq!(report.statistics["dropped_tasks"], 0);
        assert!(report.statistics["requeued_tasks"].is_u64());
    }

    #[test]
    fn test_cli_parses_directory_commands() {
        let cli = Cli::try_parse_from(["backvault", "directories", "create", "nightly", "-d", "db dumps"])
            .unwrap();
        match cli.command {
            Commands::Directories {
                action: DirectoryAction::Create { name, description },
            } => {
                assert_eq!(name, "nightly");
                assert_eq!(description.as_deref(), Some("db dumps"));
            }
            _ => panic!("expected directories create"),
        }

        let cli = Cli::try_parse_from(["backvault", "directories", "remove", "d1", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Directories {
                action: DirectoryAction::Remove { force: true, .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_directories_require_credentials() {
        let err = manage_directories(&Config::default(), DirectoryAction::List)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("client_id"), "{err}");
    }

    #[test]
    fn test_confirm_accepts_only_yes() {
        assert!(confirm(&b"yes\n"[..], "").unwrap());
        assert!(confirm(&b" YES \n"[..], "").unwrap());
        assert!(!confirm(&b"y\n"[..], "").unwrap());
        assert!(!confirm(&b""[..], "").unwrap());
    }

    #[test]
    fn test_directory_row_formats_time_and_size() {
        let row = DirectoryRow::from(&RemoteDirectory {
            id: "d1".into(),
            name: "nightly".into(),
            created_at: "not a time".into(),
            file_count: 3,
            total_size: 2048,
            ..Default::default()
        });
        assert_eq!(row.created, "not a time");
        assert_eq!(row.size, format_size(2048));
        assert_eq!(row.files, 3);
    }

    #[test]
    fn test_short_checksum() {
        assert_eq!(short_checksum("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_checksum("abc"), "abc");
    }
}
