//! Retention pruning: keep the newest N backups per source.

use ossback_object_store::ObjectStore;
use tracing::{info, warn};

use crate::BackupError;
use crate::naming::DataType;
use crate::records::RecordStore;

/// Extra delete attempts per object before giving up on it.
const DELETE_RETRIES: u32 = 2;

/// What a pruning pass accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PruneOutcome {
    /// Backups removed from both the backend and the record store.
    pub pruned: usize,
    /// Backups whose object delete kept failing; their records remain.
    pub failed: usize,
}

/// Deletes all but the newest `keep` backups of `(data_type, name)`.
///
/// A record is only dropped after its object delete succeeded, so a failed
/// delete leaves the backup discoverable for the next pass.
pub async fn prune(
    store: &dyn ObjectStore,
    records: &dyn RecordStore,
    data_type: DataType,
    name: &str,
    keep: usize,
) -> Result<PruneOutcome, BackupError> {
    let listed = records.list(data_type, name)?;
    let mut outcome = PruneOutcome::default();

    for record in listed.into_iter().skip(keep) {
        let mut deleted = false;
        for attempt in 0..=DELETE_RETRIES {
            match store.delete_object(&record.object_key).await {
                Ok(()) => {
                    deleted = true;
                    break;
                }
                Err(err) => {
                    warn!(
                        key = record.object_key,
                        attempt, %err,
                        "failed to delete expired backup object"
                    );
                }
            }
        }
        if deleted {
            records.delete(record.id)?;
            info!(key = record.object_key, "pruned expired backup");
            outcome.pruned += 1;
        } else {
            outcome.failed += 1;
        }
    }
    Ok(outcome)
}
