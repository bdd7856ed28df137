use anyhow::{Context, Result};
use directories::ProjectDirs;
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::cli::Args;
use crate::identity::DEFAULT_IDENTITY_PARAM;
use crate::session::DEFAULT_SUBSCRIBER_BUFFER;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8888";

/// Process configuration. Read from a JSON file; fields missing from the
/// file keep their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub listen_addr: String,
    pub database_path: PathBuf,
    pub subscriber_buffer: usize,
    pub identity_param: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.into(),
            database_path: default_data_dir().join("database.db"),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            identity_param: DEFAULT_IDENTITY_PARAM.into(),
        }
    }
}

impl AppConfig {
    /// A missing file yields the defaults, and so does an unparsable one
    /// (with a warning). Only an unreadable file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        match serde_json::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(err) => {
                warn!(
                    "ignoring unparsable config {}: {err}; using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
        }
    }

    /// Config file from `--config` (or the default location) with the
    /// remaining flags layered on top.
    pub fn resolve(args: &Args) -> Result<Self> {
        let mut config = match args.config.as_deref() {
            Some(path) => Self::load(path)?,
            None => match default_config_path() {
                Some(path) => Self::load(&path)?,
                None => Self::default(),
            },
        };
        config.apply_overrides(args);
        Ok(config)
    }

    pub fn apply_overrides(&mut self, args: &Args) {
        if let Some(db) = &args.db {
            self.database_path = db.clone();
        }
        if let Some(listen) = &args.listen {
            self.listen_addr = listen.clone();
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "watchlink", "watchlink")
}

fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.listen_addr, "0.0.0.0:8888");
        assert_eq!(config.subscriber_buffer, 256);
        assert_eq!(config.identity_param, "system.uid");
        assert!(config.database_path.ends_with("database.db"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "listen_addr": "127.0.0.1:9000", "subscriber_buffer": 8 }"#)
            .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.subscriber_buffer, 8);
        assert_eq!(config.identity_param, DEFAULT_IDENTITY_PARAM);
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn flags_override_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "listen_addr": "127.0.0.1:9000" }"#).unwrap();

        let args = Args::parse_from([
            "watchlink",
            "--config",
            path.to_str().unwrap(),
            "--db",
            "/tmp/elsewhere.db",
        ]);
        let config = AppConfig::resolve(&args).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.database_path, PathBuf::from("/tmp/elsewhere.db"));

        let args = Args::parse_from([
            "watchlink",
            "--config",
            path.to_str().unwrap(),
            "--listen",
            "[::1]:7000",
        ]);
        assert_eq!(AppConfig::resolve(&args).unwrap().listen_addr, "[::1]:7000");
    }
}
