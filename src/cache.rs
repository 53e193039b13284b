use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{CacheBackendKind, CacheConfig};
use crate::utils::error::{AppError, Result};

/// Upper bound for a single backend call. A slow cache is treated as a miss.
const OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Raw byte store behind [`Cache`]. Keys arrive already namespaced.
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn backend_name(&self) -> &'static str;
    fn is_connected(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Glob pattern, `*` and `?` wildcards.
    async fn clear_matching(&self, pattern: &str) -> Result<usize>;
    async fn count_matching(&self, pattern: &str) -> Result<usize>;
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process store. Expired entries are never returned and are dropped lazily.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn live_entry(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: evict under the write lock, re-checking in case of a concurrent set
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        None
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.live_entry(key).await.map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live_entry(key).await.is_some())
    }

    async fn clear_matching(&self, pattern: &str) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let mut removed_live = 0;
        entries.retain(|key, entry| {
            if !glob_match(pattern, key) {
                return true;
            }
            if !entry.is_expired(now) {
                removed_live += 1;
            }
            false
        });
        debug!("Cleared {} of {} memory cache entries matching {}", before - entries.len(), before, pattern);
        Ok(removed_live)
    }

    async fn count_matching(&self, pattern: &str) -> Result<usize> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|e| !e.is_expired(now) && glob_match(pattern, &e.key))
            .count())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        Ok(self.live_entry(key).await.map(|e| e.expires_at.saturating_duration_since(now)))
    }
}

#[cfg(feature = "redis-cache")]
pub use self::redis_store::RedisStore;

#[cfg(feature = "redis-cache")]
mod redis_store {
    use super::*;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    fn redis_err(e: redis::RedisError) -> AppError {
        AppError::Cache(e.to_string())
    }

    /// Redis-backed store. A failed connect leaves it disconnected; every call then errors.
    pub struct RedisStore {
        conn: Option<ConnectionManager>,
    }

    impl RedisStore {
        pub async fn connect(url: &str) -> Self {
            let conn = match redis::Client::open(url) {
                Ok(client) => match ConnectionManager::new(client).await {
                    Ok(conn) => {
                        info!("Connected to Redis cache");
                        Some(conn)
                    }
                    Err(e) => {
                        warn!("Could not connect to Redis: {}", e);
                        None
                    }
                },
                Err(e) => {
                    warn!("Invalid Redis URL: {}", e);
                    None
                }
            };
            Self { conn }
        }

        fn connection(&self) -> Result<ConnectionManager> {
            self.conn
                .clone()
                .ok_or_else(|| AppError::Cache("Redis is not connected".to_string()))
        }
    }

    #[async_trait]
    impl CacheStore for RedisStore {
        fn backend_name(&self) -> &'static str {
            "redis"
        }

        fn is_connected(&self) -> bool {
            self.conn.is_some()
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            let mut conn = self.connection()?;
            conn.get(key).await.map_err(redis_err)
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
            let mut conn = self.connection()?;
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(redis_err)
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            let mut conn = self.connection()?;
            let removed: usize = conn.del(key).await.map_err(redis_err)?;
            Ok(removed > 0)
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            let mut conn = self.connection()?;
            conn.exists(key).await.map_err(redis_err)
        }

        async fn clear_matching(&self, pattern: &str) -> Result<usize> {
            let mut conn = self.connection()?;
            let keys: Vec<String> = conn.keys(pattern).await.map_err(redis_err)?;
            if keys.is_empty() {
                return Ok(0);
            }
            conn.del(keys).await.map_err(redis_err)
        }

        async fn count_matching(&self, pattern: &str) -> Result<usize> {
            let mut conn = self.connection()?;
            let keys: Vec<String> = conn.keys(pattern).await.map_err(redis_err)?;
            Ok(keys.len())
        }

        async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
            let mut conn = self.connection()?;
            let secs: i64 = conn.ttl(key).await.map_err(redis_err)?;
            Ok((secs >= 0).then(|| Duration::from_secs(secs as u64)))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub backend: String,
    pub connected: bool,
    pub keys: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Typed, namespaced facade over a [`CacheStore`].
///
/// Never fails the caller: backend errors and timeouts are logged and reported as a
/// miss, `false` or `0`, so callers simply fall back to fetching.
pub struct Cache {
    store: Arc<dyn CacheStore>,
    prefix: String,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>, prefix: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config.prefix.clone(), config.ttl())
    }

    /// Builds the configured cache, or `None` when caching is disabled.
    pub async fn from_config(config: &CacheConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }

        match config.backend {
            CacheBackendKind::Memory => Some(Self::in_memory(config)),
            #[cfg(feature = "redis-cache")]
            CacheBackendKind::Redis => match config.redis_url() {
                Ok(url) => {
                    let store = RedisStore::connect(&url).await;
                    Some(Self::new(Arc::new(store), config.prefix.clone(), config.ttl()))
                }
                Err(e) => {
                    warn!("{}; using memory cache", e);
                    Some(Self::in_memory(config))
                }
            },
            #[cfg(not(feature = "redis-cache"))]
            CacheBackendKind::Redis => {
                warn!("Redis cache requested but the redis-cache feature is disabled; using memory cache");
                Some(Self::in_memory(config))
            }
        }
    }

    fn make_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn guard<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Option<T> {
        match tokio::time::timeout(OP_TIMEOUT, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!("Cache {} failed on {} backend: {}", op, self.store.backend_name(), e);
                None
            }
            Err(_) => {
                warn!("Cache {} timed out on {} backend", op, self.store.backend_name());
                None
            }
        }
    }

    async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let value = self.guard("get", self.store.get(&self.make_key(key))).await.flatten();
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> bool {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.guard("set", self.store.set(&self.make_key(key), value, ttl))
            .await
            .is_some()
    }

    /// Structured value, JSON-encoded.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get_bytes(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Discarding undecodable cache entry {}: {}", key, e);
                None
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set_bytes(key, bytes, ttl).await,
            Err(e) => {
                warn!("Could not serialize cache value for {}: {}", key, e);
                false
            }
        }
    }

    /// Plain text stored as raw UTF-8, readable by other tools sharing the store.
    pub async fn get_text(&self, key: &str) -> Option<String> {
        let bytes = self.get_bytes(key).await?;
        String::from_utf8(bytes).ok()
    }

    pub async fn set_text(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        self.set_bytes(key, value.as_bytes().to_vec(), ttl).await
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.guard("delete", self.store.delete(&self.make_key(key)))
            .await
            .is_some()
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.guard("exists", self.store.exists(&self.make_key(key)))
            .await
            .unwrap_or(false)
    }

    /// Removes every key matching the glob (un-prefixed), returning how many were live.
    pub async fn clear_matching(&self, pattern: &str) -> usize {
        let count = self
            .guard("clear", self.store.clear_matching(&self.make_key(pattern)))
            .await
            .unwrap_or(0);
        if count > 0 {
            info!("Removed {} cache entries matching {}", count, pattern);
        }
        count
    }

    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        self.guard("ttl", self.store.ttl(&self.make_key(key))).await.flatten()
    }

    pub async fn stats(&self) -> CacheStats {
        let keys = self
            .guard("count", self.store.count_matching(&self.make_key("*")))
            .await
            .unwrap_or(0);
        CacheStats {
            backend: self.store.backend_name().to_string(),
            connected: self.store.is_connected(),
            keys,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Redis-style glob: `*` matches any run, `?` one character.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}
