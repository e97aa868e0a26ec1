//! Download orchestration.
//!
//! Mirrors the upload path: the object is fetched part by part into a
//! staging file next to the destination, per-part progress is
//! checkpointed, and the staging file is renamed into place only after
//! the assembled bytes verify against the backend's checksum. A missing
//! remote object fails immediately with no retries.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ossback_object_store::{BackendError, ErrorKind, ObjectMeta, ObjectStore};

use crate::checkpoint::{Checkpoint, CheckpointStore, FileSignature, PartCheckpoint};
use crate::plan::{PartSpan, PlanDecision, plan};
use crate::pool;
use crate::progress::{ProgressSink, ProgressTracker};
use crate::upload::file_crc;
use crate::{TransferError, TransferOptions, TransferReport, VerifyMode, checksum};

/// Downloads objects from an [`ObjectStore`] with resume and verification.
pub struct Downloader {
    store: Arc<dyn ObjectStore>,
    checkpoints: CheckpointStore,
    options: TransferOptions,
}

struct AttemptOutcome {
    total: u64,
    parts: usize,
    crc_verified: bool,
    already_present: bool,
}

impl Downloader {
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

    /// Downloads `key` to `local`.
    ///
    /// The destination only ever appears as a complete, verified file; a
    /// partial transfer lives in `<local>.part` until it finishes. If the
    /// destination already matches the remote object no bytes move.
    pub async fn download(
        &self,
        key: &str,
        local: &Path,
        sink: Box<dyn ProgressSink>,
    ) -> Result<TransferReport, TransferError> {
        if local.file_name().is_none() {
            return Err(TransferError::InvalidInput(format!(
                "destination must be a file path: {}",
                local.display()
            )));
        }

        let moved = AtomicU64::new(0);
        let mut tracker: Option<ProgressTracker> = None;
        let mut sink = Some(sink);

        let mut attempt = 0u32;
        let mut integrity_retry_used = false;
        loop {
            attempt += 1;
            let result = self
                .attempt(key, local, &moved, &mut tracker, &mut sink)
                .await;
            match result {
                Ok(outcome) => {
                    if let Some(tracker) = &tracker {
                        tracker.finish();
                    }
                    if outcome.already_present {
                        info!(key, "destination already matches object");
                    } else {
                        info!(key, size = outcome.total, parts = outcome.parts, attempt, "download complete");
                    }
                    return Ok(TransferReport {
                        bytes_total: outcome.total,
                        bytes_transferred: moved.load(Ordering::Relaxed),
                        parts: outcome.parts,
                        attempts: if outcome.already_present { 0 } else { attempt },
                        crc_verified: outcome.crc_verified,
                    });
                }
                Err(err) => {
                    let integrity = matches!(
                        err,
                        TransferError::Integrity { .. } | TransferError::SizeMismatch { .. }
                    );
                    let retry = if integrity {
                        !std::mem::replace(&mut integrity_retry_used, true)
                    } else {
                        err.is_retryable() && attempt <= self.options.retries
                    };
                    if retry {
                        warn!(key, attempt, %err, "download attempt failed, retrying");
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(
        &self,
        key: &str,
        local: &Path,
        moved: &AtomicU64,
        tracker: &mut Option<ProgressTracker>,
        sink: &mut Option<Box<dyn ProgressSink>>,
    ) -> Result<AttemptOutcome, TransferError> {
        let meta = match self.store.head_object(key).await {
            Ok(meta) => meta,
            Err(e) if e.kind == ErrorKind::NotFound => {
                return Err(TransferError::ObjectNotFound(key.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };
        let total = meta.size;

        if let Some(crc_verified) = self.destination_matches(local, &meta).await? {
            return Ok(AttemptOutcome {
                total,
                parts: 0,
                crc_verified,
                already_present: true,
            });
        }

        // The tracker is created lazily, once the object size is known, and
        // shared across attempts so progress is monotonic.
        let tracker = tracker.get_or_insert_with(|| {
            let sink = sink.take().unwrap_or_else(|| Box::new(crate::progress::NoopSink));
            ProgressTracker::new(total, sink)
        });

        match plan(total, self.options.part_size, self.options.multipart_threshold)? {
            PlanDecision::SingleShot => {
                let crc_verified = self.single_shot(key, local, &meta, tracker, moved).await?;
                Ok(AttemptOutcome {
                    total,
                    parts: 1,
                    crc_verified,
                    already_present: false,
                })
            }
            PlanDecision::Multipart(template) => {
                let crc_verified = self
                    .multipart_attempt(key, local, &meta, &template, tracker, moved)
                    .await?;
                Ok(AttemptOutcome {
                    total,
                    parts: template.len(),
                    crc_verified,
                    already_present: false,
                })
            }
        }
    }

    /// Fast path: the destination file already matches the remote object.
    async fn destination_matches(
        &self,
        local: &Path,
        meta: &ObjectMeta,
    ) -> Result<Option<bool>, TransferError> {
        let Ok(existing) = std::fs::metadata(local) else {
            return Ok(None);
        };
        if !existing.is_file() || existing.len() != meta.size {
            return Ok(None);
        }
        match self.options.verify {
            VerifyMode::SizeOnly => Ok(Some(false)),
            VerifyMode::Crc64 => {
                let Some(remote) = meta.crc64 else {
                    return Ok(None);
                };
                if file_crc(local).await? == remote {
                    Ok(Some(true))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn single_shot(
        &self,
        key: &str,
        local: &Path,
        meta: &ObjectMeta,
        tracker: &ProgressTracker,
        moved: &AtomicU64,
    ) -> Result<bool, TransferError> {
        let data = if meta.size == 0 {
            Vec::new()
        } else {
            self.store.get_object_range(key, 0, meta.size).await?
        };
        if data.len() as u64 != meta.size {
            return Err(TransferError::SizeMismatch {
                expected: meta.size,
                actual: data.len() as u64,
            });
        }

        let crc_verified = match (self.options.verify, meta.crc64) {
            (VerifyMode::Crc64, Some(expected)) => {
                let actual = checksum::crc64(&data);
                if actual != expected {
                    return Err(TransferError::Integrity { expected, actual });
                }
                true
            }
            _ => false,
        };

        let staging = staging_path(local);
        tokio::fs::write(&staging, &data).await?;
        tokio::fs::rename(&staging, local).await?;
        tracker.add(meta.size);
        moved.fetch_add(meta.size, Ordering::Relaxed);
        Ok(crc_verified)
    }

    async fn multipart_attempt(
        &self,
        key: &str,
        local: &Path,
        meta: &ObjectMeta,
        template: &[PartSpan],
        tracker: &ProgressTracker,
        moved: &AtomicU64,
    ) -> Result<bool, TransferError> {
        let signature = FileSignature::of_remote(meta);
        let fingerprint = CheckpointStore::fingerprint("download", local, key);
        let staging = staging_path(local);

        let resumable = self
            .checkpoints
            .load(&fingerprint, &signature)
            // A checkpoint without its staging file is useless.
            .filter(|cp| {
                std::fs::metadata(&staging)
                    .map(|m| m.len() == cp.total_size)
                    .unwrap_or(false)
            });
        let cp = match resumable {
            Some(cp) => {
                debug!(
                    key,
                    done = cp.parts.iter().filter(|p| p.done).count(),
                    total = cp.parts.len(),
                    "resuming download from checkpoint"
                );
                cp
            }
            None => {
                let file = tokio::fs::File::create(&staging).await?;
                file.set_len(meta.size).await?;
                let cp = Checkpoint {
                    upload_id: None,
                    total_size: meta.size,
                    part_size: template.first().map(|s| s.len).unwrap_or(0),
                    signature: signature.clone(),
                    parts: template
                        .iter()
                        .map(|s| PartCheckpoint::pending(s.number, s.offset, s.len))
                        .collect(),
                };
                self.checkpoints.save(&fingerprint, &cp)?;
                cp
            }
        };

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
                let shared = &shared;
                let staging = &staging;
                let fingerprint = &fingerprint;
                async move {
                    let data = self.store.get_object_range(key, span.offset, span.len).await?;
                    if data.len() as u64 != span.len {
                        // Short reads are treated like flaky connections.
                        return Err(TransferError::Backend(BackendError::transient(format!(
                            "short read for part {}: got {} of {} bytes",
                            span.number,
                            data.len(),
                            span.len
                        ))));
                    }
                    write_span(staging, span.offset, &data).await?;
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

        let crc_verified = match (self.options.verify, meta.crc64) {
            (VerifyMode::Crc64, Some(expected)) => {
                let actual = file_crc(&staging).await?;
                if actual != expected {
                    self.discard(&fingerprint, &staging).await;
                    return Err(TransferError::Integrity { expected, actual });
                }
                true
            }
            (VerifyMode::Crc64, None) => {
                warn!(key, "backend reported no checksum, falling back to size check");
                self.check_size(&fingerprint, &staging, meta.size).await?;
                false
            }
            (VerifyMode::SizeOnly, _) => {
                self.check_size(&fingerprint, &staging, meta.size).await?;
                false
            }
        };

        tokio::fs::rename(&staging, local).await?;
        self.checkpoints.delete(&fingerprint)?;
        Ok(crc_verified)
    }

    async fn check_size(
        &self,
        fingerprint: &str,
        staging: &Path,
        expected: u64,
    ) -> Result<(), TransferError> {
        let actual = tokio::fs::metadata(staging).await?.len();
        if actual != expected {
            self.discard(fingerprint, staging).await;
            return Err(TransferError::SizeMismatch { expected, actual });
        }
        Ok(())
    }

    /// Drops the staging file and checkpoint so the next attempt starts
    /// clean.
    async fn discard(&self, fingerprint: &str, staging: &Path) {
        if let Err(err) = tokio::fs::remove_file(staging).await {
            warn!(path = %staging.display(), %err, "failed to remove staging file");
        }
        if let Err(err) = self.checkpoints.delete(fingerprint) {
            warn!(fingerprint, %err, "failed to remove checkpoint");
        }
    }
}

fn staging_path(local: &Path) -> PathBuf {
    let mut name = local.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    local.with_file_name(name)
}

async fn write_span(path: &Path, offset: u64, data: &[u8]) -> Result<(), TransferError> {
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopSink;
    use crate::testing::FlakyStore;
    use std::fs;

    const MIB: u64 = 1024 * 1024;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 249) as u8).collect()
    }

    fn options_1mib() -> TransferOptions {
        let mut options = TransferOptions::default();
        options.part_size = MIB;
        options.multipart_threshold = MIB;
        options
    }

    struct Fixture {
        store: Arc<FlakyStore>,
        downloader: Downloader,
        dir: tempfile::TempDir,
    }

    fn fixture(options: TransferOptions) -> Fixture {
        let store = Arc::new(FlakyStore::new());
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            dir.path().join("checkpoints"),
            options,
        )
        .unwrap();
        Fixture { store, downloader, dir }
    }

    async fn seed(fx: &Fixture, key: &str, data: &[u8]) {
        fx.store.inner().put_object(key, data.to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn missing_object_fails_without_retry() {
        let fx = fixture(TransferOptions::default());
        let dest = fx.dir.path().join("out.bin");

        let err = fx
            .downloader
            .download("k/none", &dest, Box::new(NoopSink))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::ObjectNotFound(_)));
        assert_eq!(fx.store.head_calls.load(Ordering::SeqCst), 1);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn small_object_goes_single_shot() {
        let fx = fixture(TransferOptions::default());
        let data = pattern(1024);
        seed(&fx, "k/small", &data).await;
        let dest = fx.dir.path().join("small.bin");

        let report = fx
            .downloader
            .download("k/small", &dest, Box::new(NoopSink))
            .await
            .unwrap();

        assert_eq!(fs::read(&dest).unwrap(), data);
        assert!(!staging_path(&dest).exists());
        assert_eq!(report.parts, 1);
        assert_eq!(report.bytes_transferred, 1024);
        assert!(report.crc_verified);
    }

    #[tokio::test]
    async fn multipart_download_assembles_the_object() {
        let fx = fixture(options_1mib());
        let data = pattern(5 * MIB as usize);
        seed(&fx, "k/big", &data).await;
        let dest = fx.dir.path().join("big.bin");

        let report = fx
            .downloader
            .download("k/big", &dest, Box::new(NoopSink))
            .await
            .unwrap();

        assert_eq!(fs::read(&dest).unwrap(), data);
        assert!(!staging_path(&dest).exists());
        assert_eq!(report.parts, 5);
        assert_eq!(report.bytes_transferred, 5 * MIB);
        assert!(report.crc_verified);
    }

    #[tokio::test]
    async fn flaky_range_is_the_only_one_refetched() {
        let fx = fixture(options_1mib());
        let data = pattern(5 * MIB as usize);
        seed(&fx, "k/f", &data).await;
        let dest = fx.dir.path().join("f.bin");
        // Part 3 covers offset 2 MiB.
        fx.store.fail_range(2 * MIB, BackendError::transient("reset"));

        let report = fx
            .downloader
            .download("k/f", &dest, Box::new(NoopSink))
            .await
            .unwrap();

        assert_eq!(report.attempts, 2);
        assert_eq!(fx.store.range_count(2 * MIB), 2);
        for offset in [0, MIB, 3 * MIB, 4 * MIB] {
            assert_eq!(fx.store.range_count(offset), 1, "offset {offset}");
        }
        assert_eq!(fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn resume_across_calls_skips_completed_parts() {
        let mut options = options_1mib();
        options.retries = 0;
        let fx = fixture(options);
        let data = pattern(5 * MIB as usize);
        seed(&fx, "k/r", &data).await;
        let dest = fx.dir.path().join("r.bin");
        fx.store.fail_range(3 * MIB, BackendError::transient("reset"));
        fx.store.fail_range(4 * MIB, BackendError::transient("reset"));

        let err = fx
            .downloader
            .download("k/r", &dest, Box::new(NoopSink))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(staging_path(&dest).exists());
        assert!(!dest.exists());

        let downloader = Downloader::new(
            Arc::clone(&fx.store) as Arc<dyn ObjectStore>,
            fx.dir.path().join("checkpoints"),
            options_1mib(),
        )
        .unwrap();
        let report = downloader
            .download("k/r", &dest, Box::new(NoopSink))
            .await
            .unwrap();

        for offset in [0, MIB, 2 * MIB] {
            assert_eq!(fx.store.range_count(offset), 1, "offset {offset}");
        }
        assert_eq!(fx.store.range_count(3 * MIB), 2);
        assert_eq!(fx.store.range_count(4 * MIB), 2);
        assert_eq!(report.bytes_transferred, 2 * MIB);
        assert_eq!(fs::read(&dest).unwrap(), data);
        assert!(!staging_path(&dest).exists());
    }

    #[tokio::test]
    async fn changed_object_restarts_from_scratch() {
        let mut options = options_1mib();
        options.retries = 0;
        let fx = fixture(options);
        let data = pattern(3 * MIB as usize);
        seed(&fx, "k/c", &data).await;
        let dest = fx.dir.path().join("c.bin");
        fx.store.fail_range(2 * MIB, BackendError::transient("reset"));

        fx.downloader
            .download("k/c", &dest, Box::new(NoopSink))
            .await
            .unwrap_err();

        // The object is replaced; its ETag and checksum change.
        let replaced: Vec<u8> = data.iter().map(|b| b.wrapping_add(1)).collect();
        seed(&fx, "k/c", &replaced).await;

        let downloader = Downloader::new(
            Arc::clone(&fx.store) as Arc<dyn ObjectStore>,
            fx.dir.path().join("checkpoints"),
            options_1mib(),
        )
        .unwrap();
        downloader
            .download("k/c", &dest, Box::new(NoopSink))
            .await
            .unwrap();

        // Every part was fetched again for the new object.
        assert_eq!(fx.store.range_count(0), 2);
        assert_eq!(fx.store.range_count(MIB), 2);
        assert_eq!(fs::read(&dest).unwrap(), replaced);
    }

    #[tokio::test]
    async fn integrity_failure_retries_once_then_fails() {
        let fx = fixture(options_1mib());
        let data = pattern(3 * MIB as usize);
        seed(&fx, "k/x", &data).await;
        fx.store.set_corrupt_crc(true);
        let dest = fx.dir.path().join("x.bin");

        let err = fx
            .downloader
            .download("k/x", &dest, Box::new(NoopSink))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Integrity { .. }));
        assert_eq!(fx.store.head_calls.load(Ordering::SeqCst), 2);
        assert!(!dest.exists());
        assert!(!staging_path(&dest).exists());
    }

    #[tokio::test]
    async fn second_download_is_a_noop() {
        let fx = fixture(options_1mib());
        let data = pattern(3 * MIB as usize);
        seed(&fx, "k/i", &data).await;
        let dest = fx.dir.path().join("i.bin");

        fx.downloader
            .download("k/i", &dest, Box::new(NoopSink))
            .await
            .unwrap();
        let ranges_before: u32 = (0..3).map(|i| fx.store.range_count(i * MIB)).sum();

        let report = fx
            .downloader
            .download("k/i", &dest, Box::new(NoopSink))
            .await
            .unwrap();

        assert_eq!(report.bytes_transferred, 0);
        assert_eq!(report.attempts, 0);
        assert!(report.crc_verified);
        let ranges_after: u32 = (0..3).map(|i| fx.store.range_count(i * MIB)).sum();
        assert_eq!(ranges_before, ranges_after);
    }

    #[tokio::test]
    async fn empty_object_downloads_to_empty_file() {
        let fx = fixture(TransferOptions::default());
        seed(&fx, "k/e", b"").await;
        let dest = fx.dir.path().join("e.bin");

        let report = fx
            .downloader
            .download("k/e", &dest, Box::new(NoopSink))
            .await
            .unwrap();

        assert_eq!(fs::read(&dest).unwrap(), Vec::<u8>::new());
        assert_eq!(report.bytes_total, 0);
    }

    #[tokio::test]
    async fn directory_destination_is_rejected() {
        let fx = fixture(TransferOptions::default());
        let err = fx
            .downloader
            .download("k", Path::new("/"), Box::new(NoopSink))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidInput(_)));
    }
}
