//! Layered, read-only configuration.
//!
//! ```rust,no_run
//! use agent_engine::config::{
//!     CompositeConfigProvider, EngineConfig, EnvConfigProvider, FileConfigProvider,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = CompositeConfigProvider::new()
//!     .provider(Box::new(EnvConfigProvider::new()))
//!     .provider(Box::new(FileConfigProvider::new("engine.json")));
//! let _config = EngineConfig::from_provider(&provider).await?;
//! # Ok(())
//! # }
//! ```

mod composite;
mod engine;
mod env;
mod file;
mod memory;
mod provider;

pub use composite::CompositeConfigProvider;
pub use engine::{
    DEFAULT_AGENT_BINARY, DEFAULT_SUBSCRIBER_BUFFER, DEFAULT_TRASH_RETENTION_DAYS, EngineConfig,
    EngineConfigBuilder, SyncMode,
};
pub use env::{DEFAULT_ENV_PREFIX, EnvConfigProvider};
pub use file::FileConfigProvider;
pub use memory::MemoryConfigProvider;
pub use provider::{ConfigProvider, ConfigProviderExt};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Environment error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
