//! Configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Free space that must remain after a backup has been written.
pub const BACKUP_FREE_SPACE_MARGIN: u64 = 100 * 1024 * 1024;

/// Rows moved per batch during the one-time unprocessed queue migration.
pub const UNPROCESSED_MIGRATION_BATCH: usize = 50;

/// Default per-statement bound-variable limit for chunked queries.
pub const DEFAULT_CHUNK_LIMIT: usize = 999;

/// Primary configuration file copied into every backup. Must exist.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Secondary configuration file copied into backups when present.
pub const EPHEMERAL_FILE_NAME: &str = "ephemeral.json";

/// Store configuration shared by the dispatcher and both workers.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Host configuration directory. Databases live in subfolders of it.
    pub config_dir: PathBuf,
    /// Hex-encoded database key.
    pub key: SecretString,
    /// Subfolder holding the main database.
    pub sql_folder: String,
    /// Subfolder holding the accelerator database.
    pub accelerator_folder: String,
    /// File name of the database inside each subfolder.
    pub db_file_name: String,
    /// How long a worker may take to answer its initialize request.
    pub worker_start_timeout: Duration,
    /// Bound-variable limit for chunked multi-value queries.
    pub chunk_limit: usize,
}

impl StoreConfig {
    pub fn new(config_dir: impl Into<PathBuf>, key: SecretString) -> Self {
        Self {
            config_dir: config_dir.into(),
            key,
            sql_folder: "sql".to_string(),
            accelerator_folder: "accel".to_string(),
            db_file_name: "db.sqlite".to_string(),
            worker_start_timeout: Duration::from_secs(60),
            chunk_limit: DEFAULT_CHUNK_LIMIT,
        }
    }

    /// Override the main database subfolder.
    pub fn with_sql_folder(mut self, folder: impl Into<String>) -> Self {
        self.sql_folder = folder.into();
        self
    }

    /// Build config from environment variables.
    ///
    /// `CIPHER_STORE_CONFIG_DIR` and `CIPHER_STORE_KEY` are required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config_dir = std::env::var("CIPHER_STORE_CONFIG_DIR")
            .map_err(|_| ConfigError::MissingEnvVar("CIPHER_STORE_CONFIG_DIR".to_string()))?;
        let key = std::env::var("CIPHER_STORE_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("CIPHER_STORE_KEY".to_string()))?;

        let mut config = Self::new(config_dir, SecretString::from(key));

        if let Ok(folder) = std::env::var("CIPHER_STORE_SQL_FOLDER") {
            config.sql_folder = folder;
        }
        if let Ok(folder) = std::env::var("CIPHER_STORE_ACCEL_FOLDER") {
            config.accelerator_folder = folder;
        }
        if let Ok(raw) = std::env::var("CIPHER_STORE_START_TIMEOUT_SECS") {
            let secs: u64 = raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "CIPHER_STORE_START_TIMEOUT_SECS".to_string(),
                message: format!("{e}"),
            })?;
            config.worker_start_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Directory holding the main database file set.
    pub fn main_dir(&self) -> PathBuf {
        self.config_dir.join(&self.sql_folder)
    }

    /// Directory holding the accelerator database file set.
    pub fn accelerator_dir(&self) -> PathBuf {
        self.config_dir.join(&self.accelerator_folder)
    }

    /// Parent directory of timestamped backups.
    pub fn backups_dir(&self) -> PathBuf {
        self.config_dir.join("backups")
    }
}

/// Where one engine keeps its files.
#[derive(Debug, Clone)]
pub struct EngineLocation {
    pub dir: PathBuf,
    pub file_name: String,
}

impl EngineLocation {
    pub fn new(dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            file_name: file_name.into(),
        }
    }

    /// Path of the primary database file.
    pub fn db_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Primary file followed by its two durability side-files.
    pub fn file_set(&self) -> [PathBuf; 3] {
        let db = self.db_path();
        [
            db.clone(),
            sidecar(&db, "-wal"),
            sidecar(&db, "-shm"),
        ]
    }
}

fn sidecar(db: &Path, suffix: &str) -> PathBuf {
    let mut name = db.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_set_names_side_files() {
        let location = EngineLocation::new("/tmp/cfg/sql", "db.sqlite");
        let [db, wal, shm] = location.file_set();
        assert_eq!(db, PathBuf::from("/tmp/cfg/sql/db.sqlite"));
        assert_eq!(wal, PathBuf::from("/tmp/cfg/sql/db.sqlite-wal"));
        assert_eq!(shm, PathBuf::from("/tmp/cfg/sql/db.sqlite-shm"));
    }

    #[test]
    fn folders_resolve_under_config_dir() {
        let config = StoreConfig::new("/tmp/cfg", SecretString::from("00".to_string()))
            .with_sql_folder("legacy-sql");
        assert_eq!(config.main_dir(), PathBuf::from("/tmp/cfg/legacy-sql"));
        assert_eq!(config.accelerator_dir(), PathBuf::from("/tmp/cfg/accel"));
        assert_eq!(config.backups_dir(), PathBuf::from("/tmp/cfg/backups"));
    }
}
