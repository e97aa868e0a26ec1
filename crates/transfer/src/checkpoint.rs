//! Durable per-part progress records.
//!
//! One JSON file per in-flight transfer, keyed by a fingerprint of the
//! transfer identity (direction, local path, object key). A checkpoint is
//! only honored while the source file still matches the signature captured
//! when the transfer began; otherwise it is silently discarded and the
//! transfer restarts from scratch.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use ossback_object_store::ObjectMeta;

/// Identity of the transfer source at checkpoint time.
///
/// Uploads key off local size and mtime; downloads key off remote size and
/// ETag. A mismatch on load means the source changed and resumed parts
/// would be stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSignature {
    pub size: u64,
    /// Local file mtime in milliseconds since the epoch; `None` for remote
    /// sources.
    pub mtime_ms: Option<i64>,
    /// Remote ETag; `None` for local sources.
    pub etag: Option<String>,
}

impl FileSignature {
    /// Signature of a local file, for uploads.
    pub fn of_local(path: &Path) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64);
        Ok(Self {
            size: meta.len(),
            mtime_ms,
            etag: None,
        })
    }

    /// Signature of a remote object, for downloads.
    pub fn of_remote(meta: &ObjectMeta) -> Self {
        Self {
            size: meta.size,
            mtime_ms: None,
            etag: meta.etag.clone(),
        }
    }
}

/// Progress record for one part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartCheckpoint {
    pub number: u32,
    pub offset: u64,
    pub len: u64,
    pub done: bool,
    /// Backend ETag of the uploaded part; `None` until done and for
    /// downloads.
    pub etag: Option<String>,
    /// CRC-64 of the part's bytes, recorded on upload for end-to-end
    /// verification.
    pub crc64: Option<u64>,
}

impl PartCheckpoint {
    pub fn pending(number: u32, offset: u64, len: u64) -> Self {
        Self {
            number,
            offset,
            len,
            done: false,
            etag: None,
            crc64: None,
        }
    }
}

/// Whole-transfer progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Backend multipart session id; `None` for downloads, which have no
    /// server-side session.
    pub upload_id: Option<String>,
    pub total_size: u64,
    pub part_size: u64,
    pub signature: FileSignature,
    pub parts: Vec<PartCheckpoint>,
}

impl Checkpoint {
    /// Bytes covered by parts already marked done.
    pub fn bytes_done(&self) -> u64 {
        self.parts.iter().filter(|p| p.done).map(|p| p.len).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.parts.iter().all(|p| p.done)
    }
}

/// Directory of checkpoint files, one per transfer fingerprint.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Opens (and creates if needed) the checkpoint directory.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Stable fingerprint for a transfer identity.
    pub fn fingerprint(direction: &str, local: &Path, key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(direction.as_bytes());
        hasher.update(b"|");
        hasher.update(local.to_string_lossy().as_bytes());
        hasher.update(b"|");
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn path_for(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    /// Loads the checkpoint for `fingerprint` if it exists, parses, and
    /// still matches `current`. A stale or corrupt record is deleted.
    pub fn load(&self, fingerprint: &str, current: &FileSignature) -> Option<Checkpoint> {
        let path = self.path_for(fingerprint);
        let raw = fs::read(&path).ok()?;
        let cp: Checkpoint = match serde_json::from_slice(&raw) {
            Ok(cp) => cp,
            Err(err) => {
                warn!(path = %path.display(), %err, "discarding unreadable checkpoint");
                let _ = fs::remove_file(&path);
                return None;
            }
        };
        if cp.signature != *current {
            debug!(path = %path.display(), "source changed since checkpoint, discarding");
            let _ = fs::remove_file(&path);
            return None;
        }
        Some(cp)
    }

    /// Persists `checkpoint` atomically (write-then-rename).
    pub fn save(&self, fingerprint: &str, checkpoint: &Checkpoint) -> std::io::Result<()> {
        let path = self.path_for(fingerprint);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(checkpoint)?;
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Removes the record; absent is fine.
    pub fn delete(&self, fingerprint: &str) -> std::io::Result<()> {
        match fs::remove_file(self.path_for(fingerprint)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sig(size: u64) -> FileSignature {
        FileSignature {
            size,
            mtime_ms: Some(1_700_000_000_000),
            etag: None,
        }
    }

    fn sample(signature: FileSignature) -> Checkpoint {
        Checkpoint {
            upload_id: Some("upload-1".into()),
            total_size: 10,
            part_size: 4,
            signature,
            parts: vec![
                PartCheckpoint {
                    done: true,
                    etag: Some("e1".into()),
                    crc64: Some(42),
                    ..PartCheckpoint::pending(1, 0, 4)
                },
                PartCheckpoint::pending(2, 4, 4),
                PartCheckpoint::pending(3, 8, 2),
            ],
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let cp = sample(sig(10));
        store.save("fp", &cp).unwrap();
        assert_eq!(store.load("fp", &sig(10)), Some(cp));
    }

    #[test]
    fn changed_signature_discards_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.save("fp", &sample(sig(10))).unwrap();

        assert_eq!(store.load("fp", &sig(11)), None);
        // The stale file is gone, so even the original signature misses now.
        assert_eq!(store.load("fp", &sig(10)), None);
    }

    #[test]
    fn corrupt_record_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let path = dir.path().join("fp.json");
        write!(fs::File::create(&path).unwrap(), "{{not json").unwrap();

        assert_eq!(store.load("fp", &sig(10)), None);
        assert!(!path.exists());
    }

    #[test]
    fn delete_absent_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.delete("never-saved").unwrap();
    }

    #[test]
    fn save_overwrites_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let mut cp = sample(sig(10));
        store.save("fp", &cp).unwrap();
        cp.parts[1].done = true;
        store.save("fp", &cp).unwrap();

        let loaded = store.load("fp", &sig(10)).unwrap();
        assert!(loaded.parts[1].done);
        assert_eq!(loaded.bytes_done(), 8);
    }

    #[test]
    fn fingerprint_separates_directions_and_keys() {
        let p = Path::new("/data/site.tar");
        let up = CheckpointStore::fingerprint("upload", p, "backup/site.tar");
        let down = CheckpointStore::fingerprint("download", p, "backup/site.tar");
        let other = CheckpointStore::fingerprint("upload", p, "backup/other.tar");
        assert_ne!(up, down);
        assert_ne!(up, other);
        assert_eq!(
            up,
            CheckpointStore::fingerprint("upload", p, "backup/site.tar")
        );
    }

    #[test]
    fn local_signature_tracks_size_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"12345").unwrap();
        let s = FileSignature::of_local(&path).unwrap();
        assert_eq!(s.size, 5);
        assert!(s.mtime_ms.is_some());
        assert!(s.etag.is_none());
    }
}
