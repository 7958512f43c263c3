use super::{
    CONFIG_PREFIX, ConfigStore, DEFAULT_TTL, METADATA_PREFIX, config_key, metadata_key, not_found,
    require_key,
};
use crate::engine::error::{Result, TaskflowError};
use crate::engine::task::TaskConfig;
use async_trait::async_trait;
use log::{debug, warn};
use redis::aio::ConnectionManager;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

const SCAN_BATCH: usize = 100;

/// Tuning for the Redis backend
#[derive(Debug, Clone)]
pub struct RedisOptions {
    /// Sliding TTL applied on write and refreshed on every read
    pub ttl: Duration,
    /// Upper bound for a single Redis round trip
    pub op_timeout: Duration,
    /// Namespace prepended to every key
    pub prefix: String,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            op_timeout: Duration::from_secs(2),
            prefix: "taskflow".to_string(),
        }
    }
}

/// Networked config store with a sliding TTL
///
/// Reads use `GETEX ... EX` so that configs of long-running workflows stay
/// alive while they are being used, while abandoned ones expire. The
/// underlying [`ConnectionManager`] reconnects after the server restarts
/// or the socket drops.
pub struct RedisConfigStore {
    client: redis::Client,
    connection: Mutex<Option<ConnectionManager>>,
    options: RedisOptions,
    closed: AtomicBool,
}

impl RedisConfigStore {
    /// Create a store from a connection URL; connects lazily
    pub fn open(url: &str, options: RedisOptions) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| TaskflowError::storage("open", url, e))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            options,
            closed: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &RedisOptions {
        &self.options
    }

    /// Round trip a `PING` to the server
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection("health_check", "").await?;
        let reply: String = self
            .bounded("health_check", "", redis::cmd("PING").query_async(&mut conn))
            .await?;
        if reply != "PONG" {
            return Err(TaskflowError::storage(
                "health_check",
                "",
                format!("unexpected PING reply: {reply}"),
            ));
        }
        Ok(())
    }

    /// Reset the expiry of a task config to `ttl` from now
    pub async fn extend_ttl(&self, id: &str, ttl: Duration) -> Result<()> {
        require_key("task execution ID", id)?;
        let key = self.full_key(&config_key(id));
        let mut conn = self.connection("extend_ttl", &key).await?;
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(&key).arg(ttl.as_secs().max(1));
        let updated: i64 = self
            .bounded("extend_ttl", &key, cmd.query_async(&mut conn))
            .await?;
        if updated == 0 {
            return Err(not_found("config", &key));
        }
        Ok(())
    }

    /// Remaining lifetime of a task config; `None` when it never expires
    pub async fn ttl(&self, id: &str) -> Result<Option<Duration>> {
        require_key("task execution ID", id)?;
        let key = self.full_key(&config_key(id));
        let mut conn = self.connection("ttl", &key).await?;
        let mut cmd = redis::cmd("TTL");
        cmd.arg(&key);
        let reply: i64 = self
            .bounded("ttl", &key, cmd.query_async(&mut conn))
            .await?;
        ttl_from_reply(reply).ok_or_else(|| not_found("config", &key))
    }

    /// All stored config keys, in their `config:` form
    pub async fn config_keys(&self) -> Result<Vec<String>> {
        self.scan_namespace("config_keys", CONFIG_PREFIX).await
    }

    /// All stored metadata keys, in their `metadata:` form
    pub async fn metadata_keys(&self) -> Result<Vec<String>> {
        self.scan_namespace("metadata_keys", METADATA_PREFIX).await
    }

    fn full_key(&self, key: &str) -> String {
        prefixed(&self.options.prefix, key)
    }

    fn ttl_secs(&self) -> u64 {
        self.options.ttl.as_secs().max(1)
    }

    async fn connection(&self, operation: &str, key: &str) -> Result<ConnectionManager> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TaskflowError::storage(operation, key, "store is closed"));
        }
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .bounded(operation, key, self.client.get_connection_manager())
            .await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn bounded<T, F>(&self, operation: &str, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.options.op_timeout, fut).await {
            Ok(result) => result.map_err(|e| TaskflowError::storage(operation, key, e)),
            Err(_) => {
                warn!(
                    "Redis {} for {} timed out after {:?}",
                    operation, key, self.options.op_timeout
                );
                Err(TaskflowError::storage(operation, key, "operation timed out"))
            }
        }
    }

    async fn scan_namespace(&self, operation: &str, namespace: &str) -> Result<Vec<String>> {
        let pattern = scan_pattern(&self.options.prefix, namespace);
        let mut conn = self.connection(operation, &pattern).await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let (next, batch): (u64, Vec<String>) = self
                .bounded(operation, &pattern, cmd.query_async(&mut conn))
                .await?;
            keys.extend(
                batch
                    .iter()
                    .filter_map(|full| strip_store_prefix(&self.options.prefix, full))
                    .map(str::to_string),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        debug!("Found {} keys matching {}", keys.len(), pattern);
        Ok(keys)
    }

    async fn put(&self, operation: &str, key: String, data: &[u8]) -> Result<()> {
        let key = self.full_key(&key);
        let mut conn = self.connection(operation, &key).await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(data).arg("EX").arg(self.ttl_secs());
        let _: () = self
            .bounded(operation, &key, cmd.query_async(&mut conn))
            .await?;
        debug!("Stored {} with TTL {}s", key, self.ttl_secs());
        Ok(())
    }

    async fn fetch(&self, operation: &str, kind: &str, key: String) -> Result<Vec<u8>> {
        let key = self.full_key(&key);
        let mut conn = self.connection(operation, &key).await?;
        let mut cmd = redis::cmd("GETEX");
        cmd.arg(&key).arg("EX").arg(self.ttl_secs());
        let value: Option<Vec<u8>> = self
            .bounded(operation, &key, cmd.query_async(&mut conn))
            .await?;
        value.ok_or_else(|| not_found(kind, &key))
    }

    async fn remove(&self, operation: &str, key: String) -> Result<()> {
        let key = self.full_key(&key);
        let mut conn = self.connection(operation, &key).await?;
        let mut cmd = redis::cmd("DEL");
        cmd.arg(&key);
        let _: i64 = self
            .bounded(operation, &key, cmd.query_async(&mut conn))
            .await?;
        Ok(())
    }
}

fn prefixed(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}:{key}")
    }
}

/// `SCAN MATCH` pattern for one namespace, with glob characters in the
/// store prefix escaped
fn scan_pattern(prefix: &str, namespace: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    format!("{}*", prefixed(&escaped, namespace))
}

fn strip_store_prefix<'a>(prefix: &str, full: &'a str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(full);
    }
    full.strip_prefix(prefix)?.strip_prefix(':')
}

/// Interpret a `TTL` reply: `-2` is a missing key, `-1` a key without expiry
fn ttl_from_reply(reply: i64) -> Option<Option<Duration>> {
    match reply {
        -2 => None,
        n if n < 0 => Some(None),
        n => Some(Some(Duration::from_secs(n as u64))),
    }
}

#[async_trait]
impl ConfigStore for RedisConfigStore {
    async fn save(&self, id: &str, config: &TaskConfig) -> Result<()> {
        require_key("task execution ID", id)?;
        let data = serde_json::to_vec(config)?;
        self.put("save", config_key(id), &data).await
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
        self.put("save_metadata", metadata_key(key), data).await
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
        self.closed.store(true, Ordering::Release);
        self.connection.lock().await.take();
        Ok(())
    }
}
