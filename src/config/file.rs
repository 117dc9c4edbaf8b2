//! File-based Configuration Provider
//!
//! A JSON object on disk. Nested objects are addressed with dot keys.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::OnceCell;

use super::ConfigResult;
use super::provider::ConfigProvider;

pub struct FileConfigProvider {
    path: PathBuf,
    data: OnceCell<HashMap<String, serde_json::Value>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty configuration.
    async fn load(&self) -> ConfigResult<HashMap<String, serde_json::Value>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }
}

impl std::fmt::Debug for FileConfigProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileConfigProvider")
            .field("path", &self.path)
            .field("loaded", &self.data.initialized())
            .finish()
    }
}

#[async_trait::async_trait]
impl ConfigProvider for FileConfigProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        let map = self.data.get_or_try_init(|| self.load()).await?;

        let mut parts = key.split('.');
        let mut current = parts.next().and_then(|first| map.get(first));
        for part in parts {
            current = current.and_then(|v| v.get(part));
        }

        Ok(match current {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Null) | None => None,
            Some(v) => Some(v.to_string()),
        })
    }
}
