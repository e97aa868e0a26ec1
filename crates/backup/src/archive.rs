//! Source packaging.
//!
//! Directories are packed with `tar`, databases dumped with
//! `mysqldump | gzip`, both driven through `tokio::process`. Command
//! construction is split out so it can be tested without executing
//! anything.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::BackupError;

/// A finished archive on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOutput {
    pub path: PathBuf,
    pub size: u64,
}

/// Credentials for database dumps.
#[derive(Debug, Clone)]
pub struct MysqlAccess {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// `tar` invocation packing `source` into `dest`.
///
/// The archive is built from the source's parent with a relative member
/// name, so extraction does not replay absolute paths.
pub fn tar_args(source: &Path, dest: &Path, excludes: &[String]) -> Vec<String> {
    let mut args = vec!["-zcf".to_owned(), dest.display().to_string()];
    for pattern in excludes {
        args.push(format!("--exclude={pattern}"));
    }
    if let Some(parent) = source.parent() {
        args.push("-C".to_owned());
        args.push(parent.display().to_string());
    }
    let member = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_owned());
    args.push(member);
    args
}

/// `mysqldump | gzip` pipeline dumping `db_name` into `dest`.
pub fn dump_pipeline(db_name: &str, dest: &Path, mysql: &MysqlAccess) -> String {
    format!(
        "mysqldump --host='{}' --port={} --user='{}' --password='{}' \
         --single-transaction --quick --routines '{}' | gzip > '{}'",
        mysql.host,
        mysql.port,
        mysql.user,
        mysql.password,
        db_name,
        dest.display()
    )
}

/// Packs the directory `source` into the gzipped tarball `dest`.
pub async fn archive_directory(
    source: &Path,
    dest: &Path,
    excludes: &[String],
) -> Result<ArchiveOutput, BackupError> {
    let meta = tokio::fs::metadata(source).await?;
    if !meta.is_dir() {
        return Err(BackupError::Archive(format!(
            "source is not a directory: {}",
            source.display()
        )));
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let args = tar_args(source, dest, excludes);
    debug!(?args, "running tar");
    let output = Command::new("tar")
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Err(BackupError::Archive(format!(
            "tar exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let size = tokio::fs::metadata(dest).await?.len();
    info!(source = %source.display(), dest = %dest.display(), size, "directory archived");
    Ok(ArchiveOutput {
        path: dest.to_path_buf(),
        size,
    })
}

/// Dumps the database `db_name` into the gzipped SQL file `dest`.
pub async fn archive_database(
    db_name: &str,
    dest: &Path,
    mysql: &MysqlAccess,
) -> Result<ArchiveOutput, BackupError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let pipeline = dump_pipeline(db_name, dest, mysql);
    let output = Command::new("sh")
        .arg("-c")
        .arg(&pipeline)
        .stdin(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Err(BackupError::Archive(format!(
            "mysqldump exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let size = tokio::fs::metadata(dest).await?.len();
    // `sh -c` only reports the last pipeline stage, so a failed dump can
    // still exit zero; an empty file is the reliable symptom.
    if size == 0 {
        let _ = tokio::fs::remove_file(dest).await;
        return Err(BackupError::Archive(format!(
            "dump of '{db_name}' produced no data: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    info!(db = db_name, dest = %dest.display(), size, "database dumped");
    Ok(ArchiveOutput {
        path: dest.to_path_buf(),
        size,
    })
}
