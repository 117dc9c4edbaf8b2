//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::provider::{ConfigProvider, ConfigProviderExt};
use super::{ConfigError, ConfigResult, ValidationErrors};
use crate::observability::{LogFormat, LoggingConfig};

pub const DEFAULT_AGENT_BINARY: &str = "claude";
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;
pub const DEFAULT_TRASH_RETENTION_DAYS: u32 = 7;

/// Sync mode for file operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// No explicit sync (OS buffering only).
    #[default]
    None,
    /// fsync after every write.
    OnWrite,
}

fn home_dir() -> Option<PathBuf> {
    directories::UserDirs::new().map(|d| d.home_dir().to_path_buf())
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "agent-engine")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".agent-engine"))
}

fn default_agent_home() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Holds `sessions.json` and `messages/<id>.jsonl`.
    pub data_dir: PathBuf,
    /// The agent's own state directory; resume files go under `projects/`.
    pub agent_home: PathBuf,
    pub agent_binary: PathBuf,
    /// Appended to every agent launch.
    pub agent_args: Vec<String>,
    pub subscriber_buffer: usize,
    pub trash_retention_days: u32,
    pub sync_mode: SyncMode,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            agent_home: default_agent_home(),
            agent_binary: PathBuf::from(DEFAULT_AGENT_BINARY),
            agent_args: Vec::new(),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            trash_retention_days: DEFAULT_TRASH_RETENTION_DAYS,
            sync_mode: SyncMode::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Resolve every field from `provider`, falling back to defaults.
    pub async fn from_provider(provider: &dyn ConfigProvider) -> ConfigResult<Self> {
        let defaults = Self::default();
        let logging = LoggingConfig {
            filter: provider
                .get("log_filter")
                .await?
                .unwrap_or(defaults.logging.filter),
            format: match provider.get::<String>("log_format").await? {
                Some(raw) => raw
                    .parse::<LogFormat>()
                    .map_err(|message| ConfigError::InvalidValue {
                        key: "log_format".into(),
                        message,
                    })?,
                None => defaults.logging.format,
            },
        };

        let config = Self {
            data_dir: provider.get("data_dir").await?.unwrap_or(defaults.data_dir),
            agent_home: provider
                .get("agent_home")
                .await?
                .unwrap_or(defaults.agent_home),
            agent_binary: provider
                .get("agent_binary")
                .await?
                .unwrap_or(defaults.agent_binary),
            agent_args: provider
                .get("agent_args")
                .await?
                .unwrap_or(defaults.agent_args),
            subscriber_buffer: provider
                .get("subscriber_buffer")
                .await?
                .unwrap_or(defaults.subscriber_buffer),
            trash_retention_days: provider
                .get("trash_retention_days")
                .await?
                .unwrap_or(defaults.trash_retention_days),
            sync_mode: provider
                .get("sync_mode")
                .await?
                .unwrap_or(defaults.sync_mode),
            logging,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        if self.subscriber_buffer == 0 {
            errors.push(ConfigError::InvalidValue {
                key: "subscriber_buffer".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.agent_binary.as_os_str().is_empty() {
            errors.push(ConfigError::InvalidValue {
                key: "agent_binary".into(),
                message: "must not be empty".into(),
            });
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::ValidationErrors(ValidationErrors(errors))),
        }
    }

    pub fn records_path(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.data_dir.join("messages")
    }
}

#[derive(Default)]
pub struct EngineConfigBuilder {
    config: Option<EngineConfig>,
}

impl EngineConfigBuilder {
    fn config(&mut self) -> &mut EngineConfig {
        self.config.get_or_insert_with(EngineConfig::default)
    }

    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config().data_dir = path.into();
        self
    }

    pub fn agent_home(mut self, path: impl Into<PathBuf>) -> Self {
        self.config().agent_home = path.into();
        self
    }

    pub fn agent_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config().agent_binary = path.into();
        self
    }

    pub fn agent_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config().agent_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn subscriber_buffer(mut self, size: usize) -> Self {
        self.config().subscriber_buffer = size;
        self
    }

    pub fn trash_retention_days(mut self, days: u32) -> Self {
        self.config().trash_retention_days = days;
        self
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.config().sync_mode = mode;
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config().logging = logging;
        self
    }

    pub fn build(mut self) -> ConfigResult<EngineConfig> {
        let config = self.config.take().unwrap_or_default();
        config.validate()?;
        Ok(config)
    }
}
