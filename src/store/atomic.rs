//! Temp-file plus rename writes.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::session::{SessionError, SessionResult};

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

/// Replace `path` with `bytes` so readers see either the old or the new file.
pub(crate) fn write_atomic_sync(path: &Path, bytes: &[u8], sync: bool) -> SessionResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SessionError::Storage {
            message: format!("Failed to create directory {}: {}", parent.display(), e),
        })?;
    }

    let tmp = temp_path(path);
    let result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        if sync {
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)
    })();

    result.map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        SessionError::Storage {
            message: format!("Failed to write {}: {}", path.display(), e),
        }
    })
}

pub(crate) async fn write_atomic(path: PathBuf, bytes: Vec<u8>, sync: bool) -> SessionResult<()> {
    tokio::task::spawn_blocking(move || write_atomic_sync(&path, &bytes, sync))
        .await
        .map_err(|e| SessionError::Storage {
            message: format!("Task join error: {}", e),
        })?
}
