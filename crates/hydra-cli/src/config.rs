//! Configuration file management for hydra.
//!
//! Provides a TOML-based config file at `~/.config/hydra/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use hydra_db::config::{DATABASE_URL_ENV, DbConfig, default_db_path};

/// Environment variable selecting the sandbox provider implementation.
pub const PROVIDER_ENV: &str = "HYDRA_PROVIDER";

/// Default sandbox provider kind.
pub const DEFAULT_PROVIDER: &str = "mock";

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub provider: Option<ProviderSection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProviderSection {
    /// Provider implementation name (e.g. "mock").
    pub kind: String,
}

/// Return the hydra config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/hydra` or `~/.config/hydra`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("hydra");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("hydra")
}

/// Return the path to the hydra config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Resolve the store location: CLI flag > `HYDRA_DATABASE_URL` > config
/// file > platform data dir default.
pub fn resolve_db_config(cli_db_url: Option<&str>) -> DbConfig {
    if let Some(url) = cli_db_url {
        return DbConfig::new(url);
    }
    if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
        return DbConfig::new(url);
    }
    if let Ok(cfg) = load_config() {
        return DbConfig::new(cfg.database.url);
    }
    DbConfig::new(default_db_path().to_string_lossy().into_owned())
}

/// Resolve the sandbox provider kind: `HYDRA_PROVIDER` > `[provider]`
/// config section > `"mock"`.
pub fn resolve_provider_kind() -> String {
    if let Ok(kind) = std::env::var(PROVIDER_ENV) {
        return kind;
    }
    if let Ok(cfg) = load_config() {
        if let Some(provider) = cfg.provider {
            return provider.kind;
        }
    }
    DEFAULT_PROVIDER.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flag_wins() {
        let cfg = resolve_db_config(Some("sqlite:/tmp/explicit.db"));
        assert_eq!(cfg.database_url, "sqlite:/tmp/explicit.db");
    }

    #[test]
    fn config_file_parses_without_provider_section() {
        let parsed: ConfigFile =
            toml::from_str("[database]\nurl = \"sqlite:/tmp/hydra.db\"\n").unwrap();
        assert_eq!(parsed.database.url, "sqlite:/tmp/hydra.db");
        assert!(parsed.provider.is_none());
    }

    #[test]
    fn config_file_parses_provider_section() {
        let parsed: ConfigFile = toml::from_str(
            "[database]\nurl = \"sqlite:/tmp/hydra.db\"\n\n[provider]\nkind = \"mock\"\n",
        )
        .unwrap();
        assert_eq!(parsed.provider.unwrap().kind, "mock");
    }
}
