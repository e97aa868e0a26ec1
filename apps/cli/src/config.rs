//! CLI configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/ossback/config.toml`
//!
//! A missing file is created with defaults so the user has a template to
//! fill in; credentials are validated at command time, not load time.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// OSS endpoint host, e.g. `oss-cn-hangzhou.aliyuncs.com`.
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub bucket: String,

    #[serde(default)]
    pub access_key_id: String,

    #[serde(default)]
    pub access_key_secret: String,

    /// Use HTTPS against the endpoint.
    #[serde(default = "default_true")]
    pub secure: bool,

    /// Key prefix under which all backups live in the bucket.
    #[serde(default = "default_backup_root")]
    pub backup_root: String,

    /// Directory for checkpoints and backup records.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Directory where archives are staged before upload.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,

    #[serde(default)]
    pub mysql: MysqlConfig,
}

/// Database access for `ossback database`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MysqlConfig {
    #[serde(default = "default_mysql_host")]
    pub host: String,

    #[serde(default = "default_mysql_port")]
    pub port: u16,

    #[serde(default = "default_mysql_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,
}

fn default_true() -> bool {
    true
}

fn default_backup_root() -> String {
    "backup".into()
}

fn default_state_dir() -> String {
    "/tmp/ossback".into()
}

fn default_staging_dir() -> String {
    "/tmp".into()
}

fn default_mysql_host() -> String {
    "127.0.0.1".into()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_mysql_user() -> String {
    "root".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: String::new(),
            access_key_id: String::new(),
            access_key_secret: String::new(),
            secure: true,
            backup_root: default_backup_root(),
            state_dir: default_state_dir(),
            staging_dir: default_staging_dir(),
            mysql: MysqlConfig::default(),
        }
    }
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            host: default_mysql_host(),
            port: default_mysql_port(),
            user: default_mysql_user(),
            password: String::new(),
        }
    }
}

impl Config {
    /// Loads configuration from `override_path` or the default location,
    /// creating a default file if none exists.
    pub fn load(override_path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match override_path {
            Some(p) => p.to_path_buf(),
            None => default_path(),
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&path)?;
            tracing::info!(path = %path.display(), "created default configuration");
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Credentials live here; restrict permissions on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Fails unless the backend credentials are filled in.
    pub fn require_credentials(&self) -> anyhow::Result<()> {
        if self.endpoint.is_empty()
            || self.bucket.is_empty()
            || self.access_key_id.is_empty()
            || self.access_key_secret.is_empty()
        {
            anyhow::bail!(
                "endpoint, bucket and access keys must be set in {}",
                default_path().display()
            );
        }
        Ok(())
    }
}

/// Returns the default configuration file path.
pub fn default_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("ossback")
        .join("config.toml")
}
