//! # Config Store Module
//!
//! Namespaced key-value persistence for task configs (keyed by task
//! execution ID) and opaque metadata blobs (keyed by caller-chosen
//! strings). Three backends implement the same [`ConfigStore`] contract:
//!
//! * [`MemoryConfigStore`]: in-process map with a sliding TTL (24h by default)
//! * `SqliteConfigStore`: embedded durable store with synchronous writes
//! * `RedisConfigStore`: networked cache with a sliding TTL refreshed on read
//!
//! Backends are chosen at construction time through [`StoreSettings`].

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryConfigStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisConfigStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteConfigStore;

use crate::engine::error::{Result, TaskflowError};
use crate::engine::task::TaskConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Namespace prefix for task config keys
pub const CONFIG_PREFIX: &str = "config:";
/// Namespace prefix for metadata keys
pub const METADATA_PREFIX: &str = "metadata:";

/// Default sliding TTL for backends that expire entries
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Durable, namespaced storage for task configs and metadata blobs
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Store a task config under a task execution ID
    async fn save(&self, id: &str, config: &TaskConfig) -> Result<()>;

    /// Load a task config; `NotFound` when absent or expired
    async fn get(&self, id: &str) -> Result<TaskConfig>;

    /// Remove a task config; succeeds when the key never existed
    async fn delete(&self, id: &str) -> Result<()>;

    /// Store raw metadata bytes
    async fn save_metadata(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Load raw metadata bytes; `NotFound` when absent or expired
    async fn get_metadata(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove metadata; succeeds when the key never existed
    async fn delete_metadata(&self, key: &str) -> Result<()>;

    /// Release backend resources; safe to call repeatedly
    async fn close(&self) -> Result<()>;
}

/// Storage key for a task config
pub fn config_key(id: &str) -> String {
    format!("{CONFIG_PREFIX}{id}")
}

/// Storage key for a metadata blob
pub fn metadata_key(key: &str) -> String {
    format!("{METADATA_PREFIX}{key}")
}

pub(crate) fn require_key(kind: &str, key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(TaskflowError::InvalidArgument(format!("{kind} cannot be empty")));
    }
    Ok(())
}

pub(crate) fn not_found(kind: &str, key: &str) -> TaskflowError {
    TaskflowError::NotFound(format!("{kind} not found for key {key}"))
}

/// Backend selection and tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreSettings {
    Memory {
        /// Sliding TTL; [`DEFAULT_TTL`] when unset, no expiry when zero
        #[serde(default)]
        ttl_secs: Option<u64>,
    },
    Sqlite {
        /// Database file; defaults to the user cache directory
        #[serde(default)]
        path: Option<PathBuf>,
    },
    Redis {
        url: String,
        #[serde(default)]
        ttl_secs: Option<u64>,
        #[serde(default)]
        op_timeout_ms: Option<u64>,
        #[serde(default)]
        prefix: Option<String>,
    },
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings::Memory { ttl_secs: None }
    }
}

impl StoreSettings {
    /// Parse settings from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str).map_err(TaskflowError::from)
    }
}

/// Build the backend described by the settings
pub async fn open_store(settings: &StoreSettings) -> Result<Arc<dyn ConfigStore>> {
    match settings {
        StoreSettings::Memory { ttl_secs } => {
            let store = match ttl_secs {
                Some(0) => MemoryConfigStore::new(),
                Some(secs) => MemoryConfigStore::with_ttl(Duration::from_secs(*secs)),
                None => MemoryConfigStore::with_ttl(DEFAULT_TTL),
            };
            Ok(Arc::new(store))
        }
        #[cfg(feature = "sqlite")]
        StoreSettings::Sqlite { path } => {
            let path = match path {
                Some(path) => path.clone(),
                None => sqlite::default_db_path(),
            };
            Ok(Arc::new(SqliteConfigStore::open(path).await?))
        }
        #[cfg(feature = "redis")]
        StoreSettings::Redis {
            url,
            ttl_secs,
            op_timeout_ms,
            prefix,
        } => {
            let mut options = self::redis::RedisOptions::default();
            if let Some(secs) = ttl_secs {
                options.ttl = Duration::from_secs(*secs);
            }
            if let Some(ms) = op_timeout_ms {
                options.op_timeout = Duration::from_millis(*ms);
            }
            if let Some(prefix) = prefix {
                options.prefix = prefix.clone();
            }
            Ok(Arc::new(RedisConfigStore::open(url, options)?))
        }
        #[allow(unreachable_patterns)]
        other => Err(TaskflowError::InvalidArgument(format!(
            "store backend not enabled in this build: {other:?}"
        ))),
    }
}
