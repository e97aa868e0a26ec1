//! Test doubles for the orchestrators.
//!
//! [`FlakyStore`] wraps a [`MemoryStore`] and injects scripted failures and
//! checksum corruption at the backend seam, while counting calls so tests
//! can assert exactly which parts were re-sent.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use ossback_object_store::{
    BackendError, CompletedPart, MemoryStore, ObjectEntry, ObjectMeta, ObjectStore,
};

#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    fail_upload_parts: Mutex<HashMap<u32, Vec<BackendError>>>,
    fail_ranges: Mutex<HashMap<u64, Vec<BackendError>>>,
    fail_puts: Mutex<Vec<BackendError>>,
    corrupt_crc: AtomicBool,
    pub init_calls: AtomicU32,
    pub head_calls: AtomicU32,
    pub put_calls: AtomicU32,
    upload_part_calls: Mutex<HashMap<u32, u32>>,
    range_calls: Mutex<HashMap<u64, u32>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Queues one failure for the next `upload_part` call with `number`.
    pub fn fail_upload_part(&self, number: u32, err: BackendError) {
        self.fail_upload_parts
            .lock()
            .unwrap()
            .entry(number)
            .or_default()
            .push(err);
    }

    /// Queues one failure for the next range read starting at `offset`.
    pub fn fail_range(&self, offset: u64, err: BackendError) {
        self.fail_ranges
            .lock()
            .unwrap()
            .entry(offset)
            .or_default()
            .push(err);
    }

    pub fn fail_put(&self, err: BackendError) {
        self.fail_puts.lock().unwrap().push(err);
    }

    /// While set, reported object checksums are flipped so verification
    /// fails.
    pub fn set_corrupt_crc(&self, on: bool) {
        self.corrupt_crc.store(on, Ordering::SeqCst);
    }

    pub fn upload_part_count(&self, number: u32) -> u32 {
        *self
            .upload_part_calls
            .lock()
            .unwrap()
            .get(&number)
            .unwrap_or(&0)
    }

    pub fn range_count(&self, offset: u64) -> u32 {
        *self.range_calls.lock().unwrap().get(&offset).unwrap_or(&0)
    }

    fn doctor(&self, mut meta: ObjectMeta) -> ObjectMeta {
        if self.corrupt_crc.load(Ordering::SeqCst) {
            meta.crc64 = meta.crc64.map(|c| c ^ 1);
        }
        meta
    }

    fn pop_scripted(map: &Mutex<HashMap<u64, Vec<BackendError>>>, key: u64) -> Option<BackendError> {
        let mut map = map.lock().unwrap();
        let queue = map.get_mut(&key)?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn init_multipart(&self, key: &str) -> Result<String, BackendError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.init_multipart(key).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<String, BackendError> {
        *self
            .upload_part_calls
            .lock()
            .unwrap()
            .entry(part_number)
            .or_insert(0) += 1;
        {
            let mut scripted = self.fail_upload_parts.lock().unwrap();
            if let Some(queue) = scripted.get_mut(&part_number)
                && !queue.is_empty()
            {
                return Err(queue.remove(0));
            }
        }
        self.inner.upload_part(key, upload_id, part_number, data).await
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectMeta, BackendError> {
        let meta = self.inner.complete_multipart(key, upload_id, parts).await?;
        Ok(self.doctor(meta))
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), BackendError> {
        self.inner.abort_multipart(key, upload_id).await
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMeta, BackendError> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        let meta = self.inner.head_object(key).await?;
        Ok(self.doctor(meta))
    }

    async fn get_object_range(
        &self,
        key: &str,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, BackendError> {
        *self.range_calls.lock().unwrap().entry(offset).or_insert(0) += 1;
        if let Some(err) = Self::pop_scripted(&self.fail_ranges, offset) {
            return Err(err);
        }
        self.inner.get_object_range(key, offset, len).await
    }

    async fn put_object(&self, key: &str, data: Vec<u8>) -> Result<ObjectMeta, BackendError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut scripted = self.fail_puts.lock().unwrap();
            if !scripted.is_empty() {
                return Err(scripted.remove(0));
            }
        }
        let meta = self.inner.put_object(key, data).await?;
        Ok(self.doctor(meta))
    }

    async fn delete_object(&self, key: &str) -> Result<(), BackendError> {
        self.inner.delete_object(key).await
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, BackendError> {
        self.inner.list_objects(prefix).await
    }

    fn sign_url(&self, key: &str, expires_in: Duration) -> Result<String, BackendError> {
        self.inner.sign_url(key, expires_in)
    }
}
