use super::{ConfigStore, config_key, metadata_key, not_found, require_key};
use crate::engine::error::{Result, TaskflowError};
use crate::engine::task::TaskConfig;
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

/// In-process config store, used for tests and single-process embedding
///
/// With a TTL configured, every successful read pushes the expiry of the
/// entry out by the full TTL again, and every write drops entries that
/// have already expired.
pub struct MemoryConfigStore {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Option<Duration>,
    closed: AtomicBool,
}

impl MemoryConfigStore {
    /// Store whose entries never expire
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Store with a sliding TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self, operation: &str, key: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TaskflowError::storage(operation, key, "store is closed"));
        }
        Ok(())
    }

    fn put(&self, operation: &str, key: String, data: Vec<u8>) -> Result<()> {
        self.ensure_open(operation, &key)?;
        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        let mut entries = self
            .entries
            .write()
            .map_err(|e| TaskflowError::storage(operation, &key, e))?;
        if self.ttl.is_some() {
            let now = Instant::now();
            let before = entries.len();
            entries.retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));
            let swept = before - entries.len();
            if swept > 0 {
                debug!("Swept {} expired entries", swept);
            }
        }
        entries.insert(key, Entry { data, expires_at });
        Ok(())
    }

    fn fetch(&self, operation: &str, kind: &str, key: &str) -> Result<Vec<u8>> {
        self.ensure_open(operation, key)?;
        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .map_err(|e| TaskflowError::storage(operation, key, e))?;
        let expired = match entries.get(key) {
            None => return Err(not_found(kind, key)),
            Some(entry) => entry.expires_at.is_some_and(|at| at <= now),
        };
        if expired {
            debug!("Entry {} expired", key);
            entries.remove(key);
            return Err(not_found(kind, key));
        }
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| not_found(kind, key))?;
        if let Some(ttl) = self.ttl {
            entry.expires_at = Some(now + ttl);
        }
        Ok(entry.data.clone())
    }

    fn remove(&self, operation: &str, key: &str) -> Result<()> {
        self.ensure_open(operation, key)?;
        let mut entries = self
            .entries
            .write()
            .map_err(|e| TaskflowError::storage(operation, key, e))?;
        entries.remove(key);
        Ok(())
    }
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn save(&self, id: &str, config: &TaskConfig) -> Result<()> {
        require_key("task execution ID", id)?;
        let data = serde_json::to_vec(config)?;
        self.put("save", config_key(id), data)
    }

    async fn get(&self, id: &str) -> Result<TaskConfig> {
        require_key("task execution ID", id)?;
        let data = self.fetch("get", "config", &config_key(id))?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        require_key("task execution ID", id)?;
        self.remove("delete", &config_key(id))
    }

    async fn save_metadata(&self, key: &str, data: &[u8]) -> Result<()> {
        require_key("metadata key", key)?;
        self.put("save_metadata", metadata_key(key), data.to_vec())
    }

    async fn get_metadata(&self, key: &str) -> Result<Vec<u8>> {
        require_key("metadata key", key)?;
        self.fetch("get_metadata", "metadata", &metadata_key(key))
    }

    async fn delete_metadata(&self, key: &str) -> Result<()> {
        require_key("metadata key", key)?;
        self.remove("delete_metadata", &metadata_key(key))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::task::TaskType;

    fn sample_config() -> TaskConfig {
        let mut config = TaskConfig::new("fetch-data", TaskType::Basic).with_cwd("/work");
        config.action = Some("fetch".to_string());
        config
    }

    #[tokio::test]
    async fn test_round_trip_and_missing_keys() {
        let store = MemoryConfigStore::new();
        let config = sample_config();

        store.save("exec-1", &config).await.unwrap();
        assert_eq!(store.get("exec-1").await.unwrap(), config);

        let err = store.get("unknown").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("not found"));

        store.delete("unknown").await.unwrap();
        store.delete("exec-1").await.unwrap();
        assert!(store.get("exec-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_empty_arguments_rejected() {
        let store = MemoryConfigStore::new();
        assert!(matches!(
            store.save("", &sample_config()).await,
            Err(TaskflowError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.save_metadata(" ", b"x").await,
            Err(TaskflowError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_config_and_metadata_namespaces_do_not_collide() {
        let store = MemoryConfigStore::new();
        store.save("shared", &sample_config()).await.unwrap();
        store.save_metadata("shared", b"raw-bytes").await.unwrap();

        assert_eq!(store.get("shared").await.unwrap().id, "fetch-data");
        assert_eq!(store.get_metadata("shared").await.unwrap(), b"raw-bytes");

        store.delete_metadata("shared").await.unwrap();
        assert!(store.get("shared").await.is_ok());
        assert!(store.get_metadata("shared").await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_extends_ttl() {
        let store = MemoryConfigStore::with_ttl(Duration::from_secs(10));
        store.save_metadata("hot", b"1").await.unwrap();
        store.save_metadata("cold", b"2").await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        store.get_metadata("hot").await.unwrap();

        // past the original TTL, inside the extended one
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.get_metadata("hot").await.unwrap(), b"1");
        assert!(store.get_metadata("cold").await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_sweep_unread_expired_entries() {
        let store = MemoryConfigStore::with_ttl(Duration::from_secs(10));
        for i in 0..1000 {
            store
                .save_metadata(&format!("cold-{i}"), b"x")
                .await
                .unwrap();
        }
        assert_eq!(store.len(), 1000);

        tokio::time::advance(Duration::from_secs(3600)).await;
        store.save_metadata("fresh", b"y").await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_metadata("fresh").await.unwrap(), b"y");
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_without_ttl_keeps_entries() {
        let store = MemoryConfigStore::new();
        store.save_metadata("k", b"v").await.unwrap();
        tokio::time::advance(Duration::from_secs(10 * 24 * 3600)).await;
        store.save_metadata("other", b"w").await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = MemoryConfigStore::new();
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.get("any").await,
            Err(TaskflowError::Storage { .. })
        ));
    }
}
