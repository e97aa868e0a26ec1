//! Backup packaging and bookkeeping around the transfer engine.
//!
//! This crate owns everything between "back up this site/database/path" and
//! "upload this file as this key": packaging sources into archives
//! ([`archive`]), deriving object keys from backup file names ([`naming`]),
//! recording what was backed up where ([`records`]), and pruning old
//! backups past the retention count ([`retention`]).

pub mod archive;
pub mod naming;
pub mod records;
pub mod retention;

pub use archive::ArchiveOutput;
pub use naming::DataType;
pub use records::{BackupRecord, JsonRecordStore, RecordStore};
pub use retention::PruneOutcome;

use ossback_object_store::BackendError;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// The external packaging step (tar, mysqldump) failed.
    #[error("archive step failed: {0}")]
    Archive(String),

    #[error("invalid backup name: {0}")]
    InvalidName(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("record store error: {0}")]
    Records(#[from] serde_json::Error),
}
