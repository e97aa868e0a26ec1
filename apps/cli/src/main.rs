//! `ossback` — scheduled backups to Alibaba Cloud OSS.
//!
//! Designed to run from cron: `site`/`database`/`path` package a source,
//! upload it resumably, record it, and prune old backups; the plain
//! `upload`/`download`/`url`/`list`/`delete` commands expose the transfer
//! engine directly.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use ossback_backup::{
    BackupRecord, DataType, JsonRecordStore, RecordStore, archive, naming, retention,
};
use ossback_object_store::{ObjectStore, OssConfig, OssStore};
use ossback_transfer::{
    Downloader, FileSink, NoopSink, ProgressSink, TransferOptions, TransferReport, Uploader,
    VerifyMode,
};

use crate::config::Config;

const MIB: u64 = 1024 * 1024;

#[derive(Parser)]
#[command(name = "ossback", version, about = "Backups to Alibaba Cloud OSS")]
struct Cli {
    /// Configuration file (default: ~/.config/ossback/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Transfer tuning shared by every command that moves bytes.
#[derive(Args, Debug, Clone)]
struct TransferArgs {
    /// Part size in MiB.
    #[arg(long, default_value_t = 2)]
    part_size_mib: u64,

    /// Files at or above this size (MiB) transfer multipart.
    #[arg(long, default_value_t = 2)]
    threshold_mib: u64,

    /// Concurrent part workers.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Extra attempts after the first failed one.
    #[arg(long, default_value_t = 2)]
    retries: u32,

    /// Per-part timeout in seconds.
    #[arg(long, default_value_t = 120)]
    part_timeout: u64,

    /// Leave the multipart session and checkpoint behind on failure
    /// instead of aborting them.
    #[arg(long)]
    no_auto_cancel: bool,

    /// Verify by size only instead of CRC-64.
    #[arg(long)]
    size_only: bool,

    /// Override the checkpoint directory.
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Write pipe-delimited progress to this file.
    #[arg(long)]
    progress_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file.
    Upload {
        local: PathBuf,
        key: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Download an object.
    Download {
        key: String,
        local: PathBuf,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Print a pre-signed GET URL for an object.
    Url {
        key: String,
        /// URL validity in seconds.
        #[arg(long, default_value_t = 3600)]
        expires: u64,
    },
    /// List objects under a key prefix.
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Delete an object.
    Delete { key: String },
    /// Back up a website directory.
    Site {
        /// Site name, used in the archive and object key.
        name: String,
        /// Directory to back up.
        path: PathBuf,
        /// Patterns passed to tar --exclude (repeatable).
        #[arg(long = "exclude")]
        excludes: Vec<String>,
        /// Newest backups to keep per source.
        #[arg(long, default_value_t = 5)]
        keep: usize,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Back up a MySQL database.
    Database {
        /// Database name.
        name: String,
        #[arg(long, default_value_t = 5)]
        keep: usize,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Back up an arbitrary directory.
    Path {
        path: PathBuf,
        #[arg(long, default_value_t = 5)]
        keep: usize,
        #[command(flatten)]
        transfer: TransferArgs,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    config.require_credentials()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli.command, config))
}

async fn run(command: Commands, config: Config) -> anyhow::Result<()> {
    let mut oss = OssConfig::new(
        &config.endpoint,
        &config.bucket,
        &config.access_key_id,
        &config.access_key_secret,
    );
    oss.secure = config.secure;
    let store: Arc<dyn ObjectStore> = Arc::new(OssStore::new(oss)?);

    match command {
        Commands::Upload { local, key, transfer } => {
            let uploader = Uploader::new(
                Arc::clone(&store),
                checkpoint_dir(&config, &transfer),
                transfer_options(&transfer),
            )?;
            let report = uploader
                .upload(&local, &key, progress_sink(&transfer))
                .await
                .with_context(|| format!("upload of {} failed", local.display()))?;
            print_report("uploaded", &key, &report);
        }
        Commands::Download { key, local, transfer } => {
            let downloader = Downloader::new(
                Arc::clone(&store),
                checkpoint_dir(&config, &transfer),
                transfer_options(&transfer),
            )?;
            let report = downloader
                .download(&key, &local, progress_sink(&transfer))
                .await
                .with_context(|| format!("download of {key} failed"))?;
            print_report("downloaded", &key, &report);
        }
        Commands::Url { key, expires } => {
            let url = store.sign_url(&key, Duration::from_secs(expires))?;
            println!("{url}");
        }
        Commands::List { prefix } => {
            for entry in store.list_objects(&prefix).await? {
                let modified = entry
                    .last_modified
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".into());
                println!("{:>14}  {}  {}", entry.size, modified, entry.key);
            }
        }
        Commands::Delete { key } => {
            store.delete_object(&key).await?;
            println!("deleted {key}");
        }
        Commands::Site {
            name,
            path,
            excludes,
            keep,
            transfer,
        } => {
            let file = naming::backup_file_name(DataType::Site, &name, Utc::now());
            let local = PathBuf::from(&config.staging_dir).join(&file);
            let archive = archive::archive_directory(&path, &local, &excludes).await?;
            finish_backup(&store, &config, &transfer, DataType::Site, &name, archive, keep).await?;
        }
        Commands::Database { name, keep, transfer } => {
            let file = naming::backup_file_name(DataType::Database, &name, Utc::now());
            let local = PathBuf::from(&config.staging_dir).join(&file);
            let mysql = archive::MysqlAccess {
                host: config.mysql.host.clone(),
                port: config.mysql.port,
                user: config.mysql.user.clone(),
                password: config.mysql.password.clone(),
            };
            let archive = archive::archive_database(&name, &local, &mysql).await?;
            finish_backup(&store, &config, &transfer, DataType::Database, &name, archive, keep)
                .await?;
        }
        Commands::Path { path, keep, transfer } => {
            let name = path_backup_name(&path);
            let file = naming::backup_file_name(DataType::Path, &name, Utc::now());
            let local = PathBuf::from(&config.staging_dir).join(&file);
            let archive = archive::archive_directory(&path, &local, &[]).await?;
            finish_backup(&store, &config, &transfer, DataType::Path, &name, archive, keep).await?;
        }
    }
    Ok(())
}

/// Uploads a finished archive, records it, removes the local copy, and
/// prunes backups past the retention count.
async fn finish_backup(
    store: &Arc<dyn ObjectStore>,
    config: &Config,
    transfer: &TransferArgs,
    data_type: DataType,
    name: &str,
    archive: ossback_backup::ArchiveOutput,
    keep: usize,
) -> anyhow::Result<()> {
    let file_name = archive
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("archive has no file name")?;
    let key = naming::object_key(&config.backup_root, data_type, &file_name)?;

    let uploader = Uploader::new(
        Arc::clone(store),
        checkpoint_dir(config, transfer),
        transfer_options(transfer),
    )?;
    let report = uploader
        .upload(&archive.path, &key, progress_sink(transfer))
        .await
        .with_context(|| format!("upload of {file_name} failed"))?;

    let records = JsonRecordStore::new(records_path(config))?;
    records.insert(BackupRecord {
        id: Uuid::new_v4(),
        data_type,
        name: name.to_owned(),
        object_key: key.clone(),
        size: archive.size,
        created_at: Utc::now(),
    })?;
    tokio::fs::remove_file(&archive.path).await?;

    print_report("backed up", &key, &report);
    let outcome = retention::prune(store.as_ref(), &records, data_type, name, keep).await?;
    if outcome.pruned > 0 || outcome.failed > 0 {
        println!(
            "retention: pruned {} expired backup(s), {} failed",
            outcome.pruned, outcome.failed
        );
    }
    Ok(())
}

fn transfer_options(args: &TransferArgs) -> TransferOptions {
    TransferOptions {
        part_size: args.part_size_mib * MIB,
        multipart_threshold: args.threshold_mib * MIB,
        workers: args.workers,
        retries: args.retries,
        auto_cancel: !args.no_auto_cancel,
        part_timeout: Duration::from_secs(args.part_timeout),
        verify: if args.size_only {
            VerifyMode::SizeOnly
        } else {
            VerifyMode::Crc64
        },
    }
}

fn progress_sink(args: &TransferArgs) -> Box<dyn ProgressSink> {
    match &args.progress_file {
        Some(path) => Box::new(FileSink::new(path)),
        None => Box::new(NoopSink),
    }
}

fn checkpoint_dir(config: &Config, args: &TransferArgs) -> PathBuf {
    args.store_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.state_dir).join("checkpoints"))
}

fn records_path(config: &Config) -> PathBuf {
    PathBuf::from(&config.state_dir).join("records.json")
}

/// Source name for a path backup: `/etc/nginx` becomes `etc_nginx`.
fn path_backup_name(path: &Path) -> String {
    path.display()
        .to_string()
        .trim_matches('/')
        .replace('/', "_")
}

fn print_report(verb: &str, key: &str, report: &TransferReport) {
    let check = if report.crc_verified { "crc64" } else { "size" };
    if report.bytes_transferred == 0 && report.attempts == 0 {
        println!("{verb} {key}: already up to date ({check} verified)");
    } else {
        println!(
            "{verb} {key}: {} bytes in {} part(s), {} attempt(s), {check} verified",
            report.bytes_transferred, report.parts, report.attempts
        );
    }
}
