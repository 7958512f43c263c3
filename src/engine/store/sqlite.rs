use super::{ConfigStore, config_key, metadata_key, not_found, require_key};
use crate::engine::error::{Result, TaskflowError};
use crate::engine::task::TaskConfig;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const DB_DIR: &str = "taskflow";
const DB_FILE: &str = "configs.db";

/// Default database location under the user cache directory
///
/// Falls back to the process working directory when no cache directory
/// can be resolved.
pub fn default_db_path() -> PathBuf {
    let base = dirs::cache_dir()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(DB_DIR).join(DB_FILE)
}

/// Embedded durable config store backed by SQLite
///
/// Writes use `synchronous=FULL` so a saved config survives a crash.
/// The connection is shared behind a mutex and every statement runs on
/// the blocking thread pool.
pub struct SqliteConfigStore {
    conn: Arc<Mutex<Option<Connection>>>,
    path: PathBuf,
}

impl SqliteConfigStore {
    /// Open (or create) the database at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let display = path.display().to_string();
        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = open_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| TaskflowError::storage("open", parent.display().to_string(), e))?;
            }
            let conn = Connection::open(&open_path)
                .map_err(|e| TaskflowError::storage("open", open_path.display().to_string(), e))?;
            migrate(&conn)
                .map_err(|e| TaskflowError::storage("migrate", open_path.display().to_string(), e))?;
            Ok(conn)
        })
        .await
        .map_err(|e| TaskflowError::storage("open", &display, e))??;

        info!("Opened SQLite config store at {}", display);
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path,
        })
    }

    /// Open the store at [`default_db_path`]
    pub async fn open_default() -> Result<Self> {
        Self::open(default_db_path()).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<T, F>(&self, operation: &'static str, key: String, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &str) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let task_key = key.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| TaskflowError::storage(operation, &task_key, e))?;
            let conn = guard
                .as_ref()
                .ok_or_else(|| TaskflowError::storage(operation, &task_key, "store is closed"))?;
            f(conn, &task_key).map_err(|e| TaskflowError::storage(operation, &task_key, e))
        })
        .await
        .map_err(|e| TaskflowError::storage(operation, &key, e))?
    }

    async fn put(&self, operation: &'static str, key: String, data: Vec<u8>) -> Result<()> {
        self.run(operation, key, move |conn, key| {
            conn.execute(
                "INSERT INTO entries (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, data, Utc::now().timestamp_millis()],
            )
            .map(|_| ())
        })
        .await
    }

    async fn fetch(&self, operation: &'static str, kind: &str, key: String) -> Result<Vec<u8>> {
        let found = self
            .run(operation, key.clone(), |conn, key| {
                conn.query_row(
                    "SELECT value FROM entries WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()
            })
            .await?;
        found.ok_or_else(|| not_found(kind, &key))
    }

    async fn remove(&self, operation: &'static str, key: String) -> Result<()> {
        self.run(operation, key, |conn, key| {
            conn.execute("DELETE FROM entries WHERE key = ?1", params![key])
                .map(|_| ())
        })
        .await
    }
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=FULL;

        CREATE TABLE IF NOT EXISTS entries (
          key TEXT PRIMARY KEY,
          value BLOB NOT NULL,
          updated_at INTEGER NOT NULL
        );
        "#,
    )
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn save(&self, id: &str, config: &TaskConfig) -> Result<()> {
        require_key("task execution ID", id)?;
        let data = serde_json::to_vec(config)?;
        debug!("Saving task config {} ({} bytes)", id, data.len());
        self.put("save", config_key(id), data).await
    }

    async fn get(&self, id: &str) -> Result<TaskConfig> {
        require_key("task execution ID", id)?;
        let data = self.fetch("get", "config", config_key(id)).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        require_key("task execution ID", id)?;
        self.remove("delete", config_key(id)).await
    }

    async fn save_metadata(&self, key: &str, data: &[u8]) -> Result<()> {
        require_key("metadata key", key)?;
        self.put("save_metadata", metadata_key(key), data.to_vec())
            .await
    }

    async fn get_metadata(&self, key: &str) -> Result<Vec<u8>> {
        require_key("metadata key", key)?;
        self.fetch("get_metadata", "metadata", metadata_key(key))
            .await
    }

    async fn delete_metadata(&self, key: &str) -> Result<()> {
        require_key("metadata key", key)?;
        self.remove("delete_metadata", metadata_key(key)).await
    }

    async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let path = self.path.display().to_string();
        let close_path = path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = conn
                .lock()
                .map_err(|e| TaskflowError::storage("close", &close_path, e))?;
            if let Some(conn) = guard.take() {
                conn.close()
                    .map_err(|(_, e)| TaskflowError::storage("close", &close_path, e))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| TaskflowError::storage("close", &path, e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::task::TaskType;

    #[tokio::test]
    async fn test_round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");
        let config = TaskConfig::new("persisted", TaskType::Basic).with_cwd("/work");

        let store = SqliteConfigStore::open(&path).await.unwrap();
        store.save("exec-1", &config).await.unwrap();
        store.save_metadata("exec-1", b"{\"n\":1}").await.unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();

        let reopened = SqliteConfigStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("exec-1").await.unwrap(), config);
        assert_eq!(reopened.get_metadata("exec-1").await.unwrap(), b"{\"n\":1}");
    }

    #[tokio::test]
    async fn test_missing_and_delete_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteConfigStore::open(dir.path().join("store.db"))
            .await
            .unwrap();

        let err = store.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
        store.delete("nope").await.unwrap();
        store.delete_metadata("nope").await.unwrap();

        store.save_metadata("k", b"v1").await.unwrap();
        store.save_metadata("k", b"v2").await.unwrap();
        assert_eq!(store.get_metadata("k").await.unwrap(), b"v2");
        store.delete_metadata("k").await.unwrap();
        assert!(store.get_metadata("k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteConfigStore::open(dir.path().join("store.db"))
            .await
            .unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.get_metadata("k").await,
            Err(TaskflowError::Storage { .. })
        ));
    }

    #[test]
    fn test_default_path_ends_with_store_file() {
        let path = default_db_path();
        assert!(path.ends_with(Path::new(DB_DIR).join(DB_FILE)));
    }
}
