//! In-memory backend for tests and local dry runs.
//!
//! Behaves like the real service at the interface level: multipart sessions
//! are tracked until completed or aborted, objects report a CRC-64/XZ the
//! way OSS reports `x-oss-hash-crc64ecma`, and deleting an absent key
//! succeeds. Tests use the session accessors to assert cleanup behavior.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::{BackendError, CompletedPart, ObjectEntry, ObjectMeta, ObjectStore};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
    crc64: u64,
    last_modified: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Default)]
struct Session {
    key: String,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<String, StoredObject>,
    sessions: HashMap<String, Session>,
    next_upload_id: u64,
    aborted: Vec<(String, String)>,
}

/// In-process [`ObjectStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored bytes of `key`, if present.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|o| o.data.clone())
    }

    /// Number of multipart sessions that are open (not completed or aborted).
    pub fn live_sessions(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// `(key, upload_id)` pairs that were explicitly aborted.
    pub fn aborted_sessions(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().aborted.clone()
    }

    /// Drops a live session without recording an abort, simulating a
    /// server-side expiry.
    pub fn expire_session(&self, upload_id: &str) {
        self.inner.lock().unwrap().sessions.remove(upload_id);
    }

    fn store_object(inner: &mut Inner, key: &str, data: Vec<u8>) -> ObjectMeta {
        let crc64 = crc64(&data);
        let etag = format!("{crc64:016x}");
        let meta = ObjectMeta {
            size: data.len() as u64,
            etag: Some(etag.clone()),
            crc64: Some(crc64),
        };
        inner.objects.insert(
            key.to_owned(),
            StoredObject {
                data,
                etag,
                crc64,
                last_modified: Utc::now(),
            },
        );
        meta
    }
}

fn crc64(data: &[u8]) -> u64 {
    let mut digest = crc64fast::Digest::new();
    digest.write(data);
    digest.sum64()
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn init_multipart(&self, key: &str) -> Result<String, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_upload_id += 1;
        let upload_id = format!("upload-{}", inner.next_upload_id);
        inner.sessions.insert(
            upload_id.clone(),
            Session {
                key: key.to_owned(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<String, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| BackendError::not_found(format!("no such upload: {upload_id}")))?;
        let etag = format!("part-{part_number}-{:016x}", crc64(&data));
        session.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectMeta, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .remove(upload_id)
            .ok_or_else(|| BackendError::not_found(format!("no such upload: {upload_id}")))?;

        let mut data = Vec::new();
        for part in parts {
            let (etag, bytes) = session.parts.get(&part.number).ok_or_else(|| {
                BackendError::other(format!("part {} was never uploaded", part.number))
            })?;
            if *etag != part.etag {
                return Err(BackendError::other(format!(
                    "etag mismatch for part {}",
                    part.number
                )));
            }
            data.extend_from_slice(bytes);
        }

        debug_assert_eq!(session.key, key);
        Ok(Self::store_object(&mut inner, key, data))
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .sessions
            .remove(upload_id)
            .ok_or_else(|| BackendError::not_found(format!("no such upload: {upload_id}")))?;
        inner.aborted.push((key.to_owned(), upload_id.to_owned()));
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMeta, BackendError> {
        let inner = self.inner.lock().unwrap();
        let obj = inner
            .objects
            .get(key)
            .ok_or_else(|| BackendError::not_found(format!("no such key: {key}")))?;
        Ok(ObjectMeta {
            size: obj.data.len() as u64,
            etag: Some(obj.etag.clone()),
            crc64: Some(obj.crc64),
        })
    }

    async fn get_object_range(
        &self,
        key: &str,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, BackendError> {
        let inner = self.inner.lock().unwrap();
        let obj = inner
            .objects
            .get(key)
            .ok_or_else(|| BackendError::not_found(format!("no such key: {key}")))?;
        let start = offset as usize;
        let end = (offset + len) as usize;
        if start >= obj.data.len() {
            return Err(BackendError::other(format!(
                "range {offset}..{} out of bounds for {key}",
                offset + len
            )));
        }
        Ok(obj.data[start..end.min(obj.data.len())].to_vec())
    }

    async fn put_object(&self, key: &str, data: Vec<u8>) -> Result<ObjectMeta, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(Self::store_object(&mut inner, key, data))
    }

    async fn delete_object(&self, key: &str) -> Result<(), BackendError> {
        // Matches OSS: deleting an absent key is not an error.
        self.inner.lock().unwrap().objects.remove(key);
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, BackendError> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<ObjectEntry> = inner
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| ObjectEntry {
                key: k.clone(),
                size: o.data.len() as u64,
                last_modified: Some(o.last_modified),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    fn sign_url(&self, key: &str, expires_in: Duration) -> Result<String, BackendError> {
        let expires = Utc::now().timestamp() + expires_in.as_secs() as i64;
        Ok(format!("memory:///{key}?Expires={expires}"))
    }
}
