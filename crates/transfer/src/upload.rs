//! Upload orchestration.
//!
//! Drives a whole local-file-to-object transfer: plans parts, opens or
//! resumes a multipart session, runs the worker pool, completes the
//! session, verifies the stored object, and cleans up. Failed attempts are
//! retried within a bounded budget; once the budget is spent the remote
//! session is aborted (when auto-cancel is on) so the backend does not
//! accumulate orphaned part storage.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ossback_object_store::{CompletedPart, ErrorKind, ObjectMeta, ObjectStore};

use crate::checkpoint::{Checkpoint, CheckpointStore, FileSignature, PartCheckpoint};
use crate::plan::{PartSpan, PlanDecision, plan};
use crate::pool;
use crate::progress::{ProgressSink, ProgressTracker};
use crate::{TransferError, TransferOptions, TransferReport, VerifyMode, checksum};

/// Uploads local files to an [`ObjectStore`] with resume and verification.
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    checkpoints: CheckpointStore,
    options: TransferOptions,
}

impl Uploader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        checkpoint_dir: impl Into<PathBuf>,
        options: TransferOptions,
    ) -> Result<Self, TransferError> {
        Ok(Self {
            store,
            checkpoints: CheckpointStore::new(checkpoint_dir)?,
            options,
        })
    }

    /// Uploads `local` as `key`.
    ///
    /// Idempotent: if the stored object already matches the local file the
    /// call verifies and returns without moving bytes. Interrupted uploads
    /// left a checkpoint behind; a rerun resumes from it as long as the
    /// local file is unchanged.
    pub async fn upload(
        &self,
        local: &Path,
        key: &str,
        sink: Box<dyn ProgressSink>,
    ) -> Result<TransferReport, TransferError> {
        let signature = FileSignature::of_local(local)?;
        let total = signature.size;
        let tracker = ProgressTracker::new(total, sink);

        if let Some(report) = self.already_stored(local, key, total).await? {
            info!(key, size = total, "object already matches local file");
            tracker.set_consumed(total);
            tracker.finish();
            return Ok(report);
        }

        let decision = plan(total, self.options.part_size, self.options.multipart_threshold)?;
        let fingerprint = CheckpointStore::fingerprint("upload", local, key);
        let moved = AtomicU64::new(0);

        let mut attempt = 0u32;
        let mut integrity_retry_used = false;
        loop {
            attempt += 1;
            let result = match &decision {
                PlanDecision::SingleShot => {
                    self.single_shot(local, key, total, &tracker, &moved).await
                }
                PlanDecision::Multipart(template) => {
                    self.multipart_attempt(local, key, &fingerprint, &signature, template, &tracker, &moved)
                        .await
                }
            };

            match result {
                Ok(crc_verified) => {
                    tracker.finish();
                    let parts = match &decision {
                        PlanDecision::SingleShot => 1,
                        PlanDecision::Multipart(template) => template.len(),
                    };
                    info!(key, size = total, parts, attempt, "upload complete");
                    return Ok(TransferReport {
                        bytes_total: total,
                        bytes_transferred: moved.load(Ordering::Relaxed),
                        parts,
                        attempts: attempt,
                        crc_verified,
                    });
                }
                Err(err) => {
                    let integrity = matches!(
                        err,
                        TransferError::Integrity { .. } | TransferError::SizeMismatch { .. }
                    );
                    // A failed verification gets exactly one fresh attempt;
                    // everything else draws on the retry budget.
                    let retry = if integrity {
                        !std::mem::replace(&mut integrity_retry_used, true)
                    } else {
                        err.is_retryable() && attempt <= self.options.retries
                    };
                    if retry {
                        warn!(key, attempt, %err, "upload attempt failed, retrying");
                        continue;
                    }
                    return Err(self
                        .finalize_failure(key, &fingerprint, &signature, attempt, err)
                        .await);
                }
            }
        }
    }

    /// Fast path: the stored object already matches the local file.
    async fn already_stored(
        &self,
        local: &Path,
        key: &str,
        total: u64,
    ) -> Result<Option<TransferReport>, TransferError> {
        let meta = match self.store.head_object(key).await {
            Ok(meta) => meta,
            Err(_) => return Ok(None),
        };
        if meta.size != total {
            return Ok(None);
        }
        let crc_verified = match self.options.verify {
            VerifyMode::SizeOnly => false,
            VerifyMode::Crc64 => {
                let Some(remote) = meta.crc64 else {
                    return Ok(None);
                };
                if file_crc(local).await? != remote {
                    return Ok(None);
                }
                true
            }
        };
        Ok(Some(TransferReport {
            bytes_total: total,
            bytes_transferred: 0,
            parts: 0,
            attempts: 0,
            crc_verified,
        }))
    }

    async fn single_shot(
        &self,
        local: &Path,
        key: &str,
        total: u64,
        tracker: &ProgressTracker,
        moved: &AtomicU64,
    ) -> Result<bool, TransferError> {
        let data = tokio::fs::read(local).await?;
        let local_crc = checksum::crc64(&data);
        let meta = self.store.put_object(key, data).await?;
        let crc_verified = self.check_stored(key, total, Some(local_crc), meta).await?;
        tracker.add(total);
        moved.fetch_add(total, Ordering::Relaxed);
        Ok(crc_verified)
    }

    #[allow(clippy::too_many_arguments)]
    async fn multipart_attempt(
        &self,
        local: &Path,
        key: &str,
        fingerprint: &str,
        signature: &FileSignature,
        template: &[PartSpan],
        tracker: &ProgressTracker,
        moved: &AtomicU64,
    ) -> Result<bool, TransferError> {
        let cp = match self.checkpoints.load(fingerprint, signature) {
            Some(cp) => {
                debug!(
                    key,
                    done = cp.parts.iter().filter(|p| p.done).count(),
                    total = cp.parts.len(),
                    "resuming from checkpoint"
                );
                cp
            }
            None => {
                let upload_id = self.store.init_multipart(key).await?;
                let cp = Checkpoint {
                    upload_id: Some(upload_id),
                    total_size: signature.size,
                    part_size: template.first().map(|s| s.len).unwrap_or(0),
                    signature: signature.clone(),
                    parts: template
                        .iter()
                        .map(|s| PartCheckpoint::pending(s.number, s.offset, s.len))
                        .collect(),
                };
                // Persist before the first part so a crash right after
                // session open is still resumable and abortable.
                self.checkpoints.save(fingerprint, &cp)?;
                cp
            }
        };

        let upload_id = cp
            .upload_id
            .clone()
            .ok_or_else(|| TransferError::InvalidInput("checkpoint has no upload id".into()))?;
        tracker.set_consumed(cp.bytes_done());

        let pending: Vec<PartSpan> = cp
            .parts
            .iter()
            .filter(|p| !p.done)
            .map(|p| PartSpan {
                number: p.number,
                offset: p.offset,
                len: p.len,
            })
            .collect();
        let expected = pending.len();
        let shared = Mutex::new(cp);
        let cancel = CancellationToken::new();

        let results = pool::run_parts(
            pending,
            self.options.workers,
            self.options.part_timeout,
            &cancel,
            |span| {
                let upload_id = upload_id.clone();
                let shared = &shared;
                async move {
                    let data = read_span(local, span).await?;
                    let crc = checksum::crc64(&data);
                    let etag = self
                        .store
                        .upload_part(key, &upload_id, span.number, data)
                        .await?;
                    {
                        let mut cp = shared.lock().unwrap();
                        let part = cp
                            .parts
                            .iter_mut()
                            .find(|p| p.number == span.number)
                            .ok_or_else(|| {
                                TransferError::InvalidInput(format!(
                                    "part {} not in checkpoint",
                                    span.number
                                ))
                            })?;
                        part.done = true;
                        part.etag = Some(etag);
                        part.crc64 = Some(crc);
                        self.checkpoints.save(fingerprint, &cp)?;
                    }
                    tracker.add(span.len);
                    moved.fetch_add(span.len, Ordering::Relaxed);
                    Ok(())
                }
            },
        )
        .await;
        pool::verdict(expected, &results)?;

        let cp = shared.into_inner().unwrap();
        let completed = cp
            .parts
            .iter()
            .map(|p| {
                p.etag
                    .clone()
                    .map(|etag| CompletedPart {
                        number: p.number,
                        etag,
                    })
                    .ok_or_else(|| {
                        TransferError::InvalidInput(format!("part {} has no etag", p.number))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let meta = self.store.complete_multipart(key, &upload_id, &completed).await?;
        // The session is consumed either way; drop the record now so a
        // verification failure restarts from scratch instead of resuming
        // against a dead session.
        self.checkpoints.delete(fingerprint)?;

        let combined = cp.parts.iter().fold(0u64, |acc, p| {
            checksum::crc64_combine(acc, p.crc64.unwrap_or(0), p.len)
        });
        self.check_stored(key, cp.total_size, Some(combined), meta).await
    }

    /// Verifies the stored object against what was sent. Returns whether a
    /// checksum (as opposed to size-only) comparison happened.
    async fn check_stored(
        &self,
        key: &str,
        total: u64,
        local_crc: Option<u64>,
        meta: ObjectMeta,
    ) -> Result<bool, TransferError> {
        if self.options.verify == VerifyMode::Crc64
            && let Some(actual) = local_crc
        {
            let expected = match meta.crc64 {
                Some(c) => Some(c),
                None => self.store.head_object(key).await?.crc64,
            };
            if let Some(expected) = expected {
                if expected != actual {
                    return Err(TransferError::Integrity { expected, actual });
                }
                return Ok(true);
            }
            warn!(key, "backend reported no checksum, falling back to size check");
        }
        let stored = if meta.size > 0 {
            meta.size
        } else {
            self.store.head_object(key).await?.size
        };
        if stored != total {
            return Err(TransferError::SizeMismatch {
                expected: total,
                actual: stored,
            });
        }
        Ok(false)
    }

    /// Terminal-failure cleanup: abort the remote session and drop the
    /// checkpoint when auto-cancel is on.
    async fn finalize_failure(
        &self,
        key: &str,
        fingerprint: &str,
        signature: &FileSignature,
        attempts: u32,
        err: TransferError,
    ) -> TransferError {
        if !self.options.auto_cancel {
            return err;
        }
        let Some(cp) = self.checkpoints.load(fingerprint, signature) else {
            return err;
        };
        let Some(upload_id) = cp.upload_id else {
            return err;
        };

        match self.store.abort_multipart(key, &upload_id).await {
            Ok(()) => {
                info!(key, upload_id, "aborted multipart session after exhausted retries");
            }
            Err(abort_err) if abort_err.kind == ErrorKind::NotFound => {
                // Session already gone server-side; nothing left to clean.
                debug!(key, upload_id, "session already released");
            }
            Err(abort_err) => {
                warn!(key, upload_id, %abort_err, "failed to abort multipart session");
                return err;
            }
        }
        if let Err(del_err) = self.checkpoints.delete(fingerprint) {
            warn!(fingerprint, %del_err, "failed to remove checkpoint");
        }
        TransferError::Aborted {
            attempts,
            reason: err.to_string(),
        }
    }
}

async fn read_span(path: &Path, span: PartSpan) -> Result<Vec<u8>, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(span.offset)).await?;
    let mut buf = vec![0u8; span.len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Whole-file CRC, off the async threads.
pub(crate) async fn file_crc(path: &Path) -> Result<u64, TransferError> {
    let path = path.to_path_buf();
    let crc = tokio::task::spawn_blocking(move || checksum::crc64_file(&path, 1 << 20))
        .await
        .map_err(std::io::Error::other)??;
    Ok(crc)
}
