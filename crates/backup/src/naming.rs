//! Backup file and object naming.
//!
//! Backup archives follow the pattern
//! `<prefix><name>_<YYYYmmdd>_<HHMMSS><ext>`, e.g.
//! `web_mysite_20260828_031500.tar.gz`, and land in the bucket under
//! `<backup root>/<type>/<name>/<file>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::BackupError;

/// What kind of source a backup covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Site,
    Database,
    Path,
}

impl DataType {
    /// File-name prefix of archives of this type.
    pub fn prefix(&self) -> &'static str {
        match self {
            DataType::Site => "web_",
            DataType::Database => "db_",
            DataType::Path => "path_",
        }
    }

    /// Path segment used in object keys.
    pub fn key_segment(&self) -> &'static str {
        match self {
            DataType::Site => "site",
            DataType::Database => "database",
            DataType::Path => "path",
        }
    }

    /// Archive extension for this type.
    pub fn extension(&self) -> &'static str {
        match self {
            DataType::Site | DataType::Path => ".tar.gz",
            DataType::Database => ".sql.gz",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key_segment())
    }
}

/// Builds the archive file name for a backup taken at `at`.
pub fn backup_file_name(data_type: DataType, name: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}{}_{}{}",
        data_type.prefix(),
        name,
        at.format("%Y%m%d_%H%M%S"),
        data_type.extension()
    )
}

/// Extracts the source name back out of an archive file name.
///
/// The name itself may contain underscores, so parsing anchors on the
/// trailing `_<date>_<time>` stamp rather than splitting from the front.
pub fn sub_name(data_type: DataType, file_name: &str) -> Option<&str> {
    let rest = file_name.strip_prefix(data_type.prefix())?;
    let rest = rest.strip_suffix(data_type.extension())?;
    let (rest, time) = rest.rsplit_once('_')?;
    let (name, date) = rest.rsplit_once('_')?;
    if time.len() != 6 || date.len() != 8 {
        return None;
    }
    if !time.bytes().all(|b| b.is_ascii_digit()) || !date.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if name.is_empty() { None } else { Some(name) }
}

/// Object key for an archive: `<root>/<type>/<name>/<file>`.
pub fn object_key(
    backup_root: &str,
    data_type: DataType,
    file_name: &str,
) -> Result<String, BackupError> {
    let name = sub_name(data_type, file_name).ok_or_else(|| {
        BackupError::InvalidName(format!(
            "{file_name:?} does not match {}<name>_<date>_<time>{}",
            data_type.prefix(),
            data_type.extension()
        ))
    })?;
    let root = backup_root.trim_matches('/');
    Ok(format!(
        "{root}/{}/{name}/{file_name}",
        data_type.key_segment()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_name_roundtrips_through_sub_name() {
        let at = Utc.with_ymd_and_hms(2026, 8, 28, 3, 15, 0).unwrap();
        let file = backup_file_name(DataType::Site, "mysite", at);
        assert_eq!(file, "web_mysite_20260828_031500.tar.gz");
        assert_eq!(sub_name(DataType::Site, &file), Some("mysite"));
    }

    #[test]
    fn names_with_underscores_survive() {
        assert_eq!(
            sub_name(DataType::Database, "db_shop_orders_v2_20260101_120000.sql.gz"),
            Some("shop_orders_v2")
        );
    }

    #[test]
    fn wrong_prefix_or_stamp_is_rejected() {
        assert_eq!(sub_name(DataType::Site, "db_x_20260101_120000.sql.gz"), None);
        assert_eq!(sub_name(DataType::Site, "web_x_2026_1200.tar.gz"), None);
        assert_eq!(sub_name(DataType::Site, "web_x_2026010a_120000.tar.gz"), None);
        assert_eq!(sub_name(DataType::Site, "web__20260101_120000.tar.gz"), None);
    }

    #[test]
    fn object_key_layout() {
        let key = object_key("backups/", DataType::Path, "path_etc_nginx_20260101_120000.tar.gz")
            .unwrap();
        assert_eq!(
            key,
            "backups/path/etc_nginx/path_etc_nginx_20260101_120000.tar.gz"
        );
    }

    #[test]
    fn object_key_rejects_malformed_names() {
        assert!(matches!(
            object_key("backups", DataType::Site, "junk.tar.gz"),
            Err(BackupError::InvalidName(_))
        ));
    }
}
