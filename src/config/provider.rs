//! Configuration Provider Trait

use serde::de::DeserializeOwned;

use super::ConfigResult;

/// Read-only source of configuration values.
#[async_trait::async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    /// Get a raw configuration value
    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>>;
}

/// Extension methods for typed configuration access
pub trait ConfigProviderExt: ConfigProvider {
    /// Get a typed value. The raw value is parsed as JSON first and, failing
    /// that, as a bare string, so `AGENT_ENGINE_AGENT_BINARY=claude` works
    /// without quoting.
    fn get<T: DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = ConfigResult<Option<T>>> + Send
    where
        Self: Sync,
    {
        async move {
            let Some(raw) = self.get_raw(key).await? else {
                return Ok(None);
            };
            let value = serde_json::from_str::<T>(&raw)
                .or_else(|_| T::deserialize(serde_json::Value::String(raw.clone())))
                .map_err(|e| super::ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })?;
            Ok(Some(value))
        }
    }
}

impl<P: ConfigProvider + ?Sized> ConfigProviderExt for P {}
