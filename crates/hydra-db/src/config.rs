//! Database configuration: URL resolution from env / defaults.

use std::path::PathBuf;

/// Environment variable for the database URL.
pub const DATABASE_URL_ENV: &str = "HYDRA_DATABASE_URL";

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite URL, e.g. `sqlite:///home/user/.local/share/hydra/hydra.db`.
    pub database_url: String,
}

impl DbConfig {
    /// Build a config from an explicit URL or path.
    ///
    /// Bare filesystem paths are accepted and prefixed with `sqlite:`.
    pub fn new(url_or_path: impl Into<String>) -> Self {
        let raw: String = url_or_path.into();
        let database_url = if raw.starts_with("sqlite:") {
            raw
        } else {
            format!("sqlite:{raw}")
        };
        Self { database_url }
    }

    /// Resolve from `HYDRA_DATABASE_URL`, falling back to the default path
    /// under the platform data directory.
    pub fn from_env() -> Self {
        match std::env::var(DATABASE_URL_ENV) {
            Ok(url) => Self::new(url),
            Err(_) => Self::new(default_db_path().to_string_lossy().into_owned()),
        }
    }
}

/// Default on-disk location for the store.
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hydra")
        .join("hydra.db")
}
