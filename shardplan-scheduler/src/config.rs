//! Scheduler configuration
//!
//! Loaded from a TOML file, then environment variables, then command line
//! overrides, in increasing priority.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Scheduler binary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// JSON cluster snapshot to check
    pub snapshot_path: PathBuf,

    /// Sled directory for placement rules, in-memory when unset
    pub rule_storage_path: Option<PathBuf>,

    /// Regions checked concurrently
    pub workers: usize,

    /// Keep rules from the snapshot in memory instead of persisting them
    pub dry_run: bool,

    pub log_format: LogFormat,

    /// Default tracing filter, overridden by `RUST_LOG`
    pub log_level: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("cluster.json"),
            rule_storage_path: None,
            workers: 4,
            dry_run: false,
            log_format: LogFormat::Text,
            log_level: "info".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SchedulerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Apply `SHARDPLAN_*` environment variables
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var("SHARDPLAN_SNAPSHOT") {
            self.snapshot_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("SHARDPLAN_RULE_STORAGE") {
            self.rule_storage_path = Some(PathBuf::from(path));
        }
        if let Some(workers) = std::env::var("SHARDPLAN_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.workers = workers;
        }
        if let Ok(v) = std::env::var("SHARDPLAN_DRY_RUN") {
            self.dry_run = v == "true" || v == "1";
        }
        if let Some(format) = std::env::var("SHARDPLAN_LOG_FORMAT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.log_format = format;
        }
        self
    }

    /// Apply command line overrides
    pub fn with_overrides(
        mut self,
        snapshot_path: Option<PathBuf>,
        rule_storage_path: Option<PathBuf>,
        workers: Option<usize>,
        dry_run: bool,
    ) -> Self {
        if let Some(path) = snapshot_path {
            self.snapshot_path = path;
        }
        if let Some(path) = rule_storage_path {
            self.rule_storage_path = Some(path);
        }
        if let Some(workers) = workers {
            self.workers = workers;
        }
        self.dry_run |= dry_run;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ValidationError("workers must be positive".into()));
        }
        Ok(())
    }
}
