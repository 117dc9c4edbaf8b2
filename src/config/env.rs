//! Environment Variable Configuration Provider

use super::provider::ConfigProvider;
use super::{ConfigError, ConfigResult};

pub const DEFAULT_ENV_PREFIX: &str = "AGENT_ENGINE_";

/// Reads `<PREFIX><KEY>` with the key upper-cased and dots turned into
/// underscores (`log.filter` -> `AGENT_ENGINE_LOG_FILTER`).
#[derive(Debug, Clone)]
pub struct EnvConfigProvider {
    prefix: String,
}

impl EnvConfigProvider {
    pub fn new() -> Self {
        Self::prefixed(DEFAULT_ENV_PREFIX)
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn env_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase().replace('.', "_"))
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConfigProvider for EnvConfigProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        match std::env::var(self.env_key(key)) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(ConfigError::Env(e)),
        }
    }
}
