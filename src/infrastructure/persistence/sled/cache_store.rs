//! Sled-based Persistent Response Cache
//!
//! 重启后仍然保留的缓存层。超出配额时按过期时间淘汰约一半条目后重试一次，
//! 仍然失败则放弃写入。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::application::ports::{CacheBackend, CacheEntry, CacheError, CacheStats};

const KEY_PREFIX: &str = "cache:";

/// Sled 缓存配置
#[derive(Debug, Clone)]
pub struct SledCacheConfig {
    /// 数据库路径
    pub db_path: String,
    /// 配额（字节）
    pub max_size_bytes: u64,
}

impl Default for SledCacheConfig {
    fn default() -> Self {
        Self {
            db_path: "data/response_cache.sled".to_string(),
            max_size_bytes: 50 * 1024 * 1024,
        }
    }
}

/// 内部存储条目
///
/// bincode 无法直接反序列化 `serde_json::Value`，值以 JSON 文本保存
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    value_json: String,
    expires_at: i64,
    size_bytes: u64,
}

impl StoredEntry {
    fn from_entry(entry: &CacheEntry) -> Result<Self, CacheError> {
        Ok(Self {
            value_json: serde_json::to_string(&entry.value)
                .map_err(|e| CacheError::SerializationError(e.to_string()))?,
            expires_at: entry.expires_at,
            size_bytes: entry.size_bytes,
        })
    }

    fn into_entry(self) -> Result<CacheEntry, CacheError> {
        Ok(CacheEntry {
            value: serde_json::from_str(&self.value_json)
                .map_err(|e| CacheError::SerializationError(e.to_string()))?,
            expires_at: self.expires_at,
            size_bytes: self.size_bytes,
        })
    }
}

fn db_err(e: sled::Error) -> CacheError {
    CacheError::DatabaseError(e.to_string())
}

fn decode(bytes: &[u8]) -> Result<StoredEntry, CacheError> {
    bincode::deserialize(bytes).map_err(|e| CacheError::SerializationError(e.to_string()))
}

/// Sled 响应缓存
pub struct SledCacheStore {
    db: Db,
    max_size_bytes: u64,
    current_size: AtomicU64,
}

impl SledCacheStore {
    /// 创建新的缓存实例
    pub fn new(config: &SledCacheConfig) -> Result<Self, CacheError> {
        let db = sled::open(&config.db_path).map_err(db_err)?;
        Self::from_db(db, config.max_size_bytes, &config.db_path)
    }

    /// 打开现有缓存
    pub fn open<P: AsRef<Path>>(path: P, max_size_bytes: u64) -> Result<Self, CacheError> {
        let config = SledCacheConfig {
            db_path: path.as_ref().to_string_lossy().to_string(),
            max_size_bytes,
        };
        Self::new(&config)
    }

    /// 临时数据库（测试用）
    pub fn temporary(max_size_bytes: u64) -> Result<Self, CacheError> {
        let db = sled::Config::new().temporary(true).open().map_err(db_err)?;
        Self::from_db(db, max_size_bytes, "<temporary>")
    }

    fn from_db(db: Db, max_size_bytes: u64, db_path: &str) -> Result<Self, CacheError> {
        let current_size = Self::calculate_total_size(&db)?;

        tracing::info!(
            db_path = %db_path,
            max_size_bytes = max_size_bytes,
            current_size = current_size,
            "SledCacheStore initialized"
        );

        Ok(Self {
            db,
            max_size_bytes,
            current_size: AtomicU64::new(current_size),
        })
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn storage_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    /// 计算数据库中所有条目的总大小
    fn calculate_total_size(db: &Db) -> Result<u64, CacheError> {
        let mut total = 0u64;
        for item in db.scan_prefix(KEY_PREFIX) {
            let (_, value) = item.map_err(db_err)?;
            if let Ok(entry) = decode(&value) {
                total += entry.size_bytes;
            }
        }
        Ok(total)
    }

    fn remove_stored(&self, storage_key: &[u8]) -> Result<Option<StoredEntry>, CacheError> {
        let removed = self.db.remove(storage_key).map_err(db_err)?;
        let entry = removed.and_then(|bytes| decode(&bytes).ok());
        if let Some(entry) = &entry {
            let size = entry.size_bytes;
            let _ = self
                .current_size
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    Some(v.saturating_sub(size))
                });
        }
        Ok(entry)
    }

    /// 写入；超出配额时返回 `QuotaExceeded`
    fn try_insert(&self, key: &str, stored: &StoredEntry) -> Result<(), CacheError> {
        let storage_key = Self::storage_key(key);
        let previous = self
            .db
            .get(&storage_key)
            .map_err(db_err)?
            .and_then(|bytes| decode(&bytes).ok())
            .map(|entry| entry.size_bytes)
            .unwrap_or(0);

        let projected = self
            .current_size
            .load(Ordering::SeqCst)
            .saturating_sub(previous)
            + stored.size_bytes;
        if self.max_size_bytes > 0 && projected > self.max_size_bytes {
            return Err(CacheError::QuotaExceeded);
        }

        let bytes =
            bincode::serialize(stored).map_err(|e| CacheError::SerializationError(e.to_string()))?;
        self.db.insert(storage_key.as_bytes(), bytes).map_err(db_err)?;
        self.current_size.store(projected, Ordering::SeqCst);
        Ok(())
    }

    /// 按过期时间从早到晚淘汰约一半条目
    fn evict_half(&self) -> Result<usize, CacheError> {
        let mut candidates = Vec::new();
        for item in self.db.scan_prefix(KEY_PREFIX) {
            let (key, value) = item.map_err(db_err)?;
            let expires_at = decode(&value).map(|e| e.expires_at).unwrap_or(i64::MIN);
            candidates.push((key, expires_at));
        }
        candidates.sort_by_key(|(_, expires_at)| *expires_at);

        let count = candidates.len().div_ceil(2);
        for (key, _) in candidates.iter().take(count) {
            self.remove_stored(key)?;
        }

        tracing::debug!(evicted = count, "Evicted cache entries after quota failure");
        Ok(count)
    }

    /// 刷新数据库
    pub fn flush(&self) -> Result<(), CacheError> {
        self.db.flush().map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for SledCacheStore {
    fn tier(&self) -> &'static str {
        "sled"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        match self.db.get(Self::storage_key(key)).map_err(db_err)? {
            Some(bytes) => decode(&bytes)?.into_entry().map(Some),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let stored = StoredEntry::from_entry(&entry)?;

        match self.try_insert(key, &stored) {
            Err(CacheError::QuotaExceeded) => {
                self.evict_half()?;
                match self.try_insert(key, &stored) {
                    Err(CacheError::QuotaExceeded) => {
                        tracing::debug!(
                            key = %key,
                            size_bytes = stored.size_bytes,
                            "Cache quota still exceeded after eviction, write skipped"
                        );
                        Ok(())
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.remove_stored(Self::storage_key(key).as_bytes())?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        for item in self.db.scan_prefix(KEY_PREFIX) {
            let (key, _) = item.map_err(db_err)?;
            self.db.remove(key).map_err(db_err)?;
        }
        self.current_size.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize, CacheError> {
        let mut expired = Vec::new();
        for item in self.db.scan_prefix(KEY_PREFIX) {
            let (key, value) = item.map_err(db_err)?;
            match decode(&value) {
                Ok(entry) if now_ms < entry.expires_at => {}
                _ => expired.push(key),
            }
        }
        for key in &expired {
            self.remove_stored(key)?;
        }
        Ok(expired.len())
    }

    async fn stats(&self) -> CacheStats {
        CacheStats {
            total_entries: self.db.scan_prefix(KEY_PREFIX).count(),
            total_size_bytes: self.current_size.load(Ordering::SeqCst),
            max_size_bytes: self.max_size_bytes,
            ..Default::default()
        }
    }
}
