//! Backup bookkeeping.
//!
//! Each successful backup leaves a [`BackupRecord`] behind; retention
//! pruning and listings work from these records rather than bucket
//! listings. The store is a trait so a panel database can stand in; the
//! bundled implementation is a single JSON file with atomic writes.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::BackupError;
use crate::naming::DataType;

/// One completed backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub data_type: DataType,
    /// Source name (site, database or path identifier).
    pub name: String,
    pub object_key: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Persistence seam for backup records.
pub trait RecordStore: Send + Sync {
    fn insert(&self, record: BackupRecord) -> Result<(), BackupError>;

    /// Records for `(data_type, name)`, newest first.
    fn list(&self, data_type: DataType, name: &str) -> Result<Vec<BackupRecord>, BackupError>;

    fn delete(&self, id: Uuid) -> Result<(), BackupError>;
}

/// [`RecordStore`] backed by one JSON file.
pub struct JsonRecordStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl JsonRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, BackupError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    fn read_all(&self) -> Result<Vec<BackupRecord>, BackupError> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, records: &[BackupRecord]) -> Result<(), BackupError> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(records)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl RecordStore for JsonRecordStore {
    fn insert(&self, record: BackupRecord) -> Result<(), BackupError> {
        let _guard = self.lock.lock().unwrap();
        let mut records = self.read_all()?;
        records.push(record);
        self.write_all(&records)
    }

    fn list(&self, data_type: DataType, name: &str) -> Result<Vec<BackupRecord>, BackupError> {
        let _guard = self.lock.lock().unwrap();
        let mut records: Vec<BackupRecord> = self
            .read_all()?
            .into_iter()
            .filter(|r| r.data_type == data_type && r.name == name)
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    fn delete(&self, id: Uuid) -> Result<(), BackupError> {
        let _guard = self.lock.lock().unwrap();
        let mut records = self.read_all()?;
        records.retain(|r| r.id != id);
        self.write_all(&records)
    }
}

#[cfg(test)]
pub(crate) fn record(data_type: DataType, name: &str, key: &str, age_hours: i64) -> BackupRecord {
    BackupRecord {
        id: Uuid::new_v4(),
        data_type,
        name: name.to_owned(),
        object_key: key.to_owned(),
        size: 1024,
        created_at: Utc::now() - chrono::Duration::hours(age_hours),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, JsonRecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRecordStore::new(dir.path().join("records.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn insert_list_delete_roundtrip() {
        let (_dir, store) = store();
        let a = record(DataType::Site, "mysite", "backups/site/mysite/a", 2);
        let b = record(DataType::Site, "mysite", "backups/site/mysite/b", 1);
        let other = record(DataType::Database, "shop", "backups/database/shop/c", 0);
        store.insert(a.clone()).unwrap();
        store.insert(b.clone()).unwrap();
        store.insert(other.clone()).unwrap();

        let listed = store.list(DataType::Site, "mysite").unwrap();
        // Newest first.
        assert_eq!(listed, vec![b.clone(), a.clone()]);

        store.delete(a.id).unwrap();
        assert_eq!(store.list(DataType::Site, "mysite").unwrap(), vec![b]);
        assert_eq!(store.list(DataType::Database, "shop").unwrap(), vec![other]);
    }

    #[test]
    fn empty_store_lists_nothing() {
        let (_dir, store) = store();
        assert!(store.list(DataType::Path, "etc").unwrap().is_empty());
    }

    #[test]
    fn delete_unknown_id_is_a_noop() {
        let (_dir, store) = store();
        let rec = record(DataType::Site, "s", "k", 0);
        store.insert(rec.clone()).unwrap();
        store.delete(Uuid::new_v4()).unwrap();
        assert_eq!(store.list(DataType::Site, "s").unwrap(), vec![rec]);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        let rec = record(DataType::Path, "etc_nginx", "backups/path/etc_nginx/x", 0);
        JsonRecordStore::new(&path).unwrap().insert(rec.clone()).unwrap();

        let reopened = JsonRecordStore::new(&path).unwrap();
        assert_eq!(reopened.list(DataType::Path, "etc_nginx").unwrap(), vec![rec]);
    }
}
