//! Storage backends for Tilt: the task queue, the interjection queue and
//! settings.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use std::sync::Arc;
use tilt_core::error::StoreError;
use tilt_core::store::Store;

/// Open the store at `path`; `":memory:"` selects the in-process backend.
#[cfg(feature = "sqlite")]
pub async fn open(path: &str) -> Result<Arc<dyn Store>, StoreError> {
    if path == ":memory:" {
        return Ok(Arc::new(InMemoryStore::new()));
    }
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Connection(format!("Failed to create {}: {e}", parent.display())))?;
        }
    }
    let url = if path.starts_with("sqlite:") {
        path.to_string()
    } else {
        format!("sqlite://{path}")
    };
    Ok(Arc::new(SqliteStore::new(&url).await?))
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use tilt_core::store::{SettingsStore, TaskStore};

    #[tokio::test]
    async fn open_creates_database_file() {
        let dir = std::env::temp_dir().join(format!("tilt-store-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("tilt.db");
        let store = open(path.to_str().unwrap()).await.unwrap();
        store.put_setting("k", "v").await.unwrap();
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn memory_path_uses_in_process_backend() {
        let store = open(":memory:").await.unwrap();
        assert!(store.list_tasks().await.unwrap().is_empty());
    }
}
