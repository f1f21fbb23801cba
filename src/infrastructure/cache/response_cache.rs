//! Response Cache - 幂等读请求的 TTL 缓存
//!
//! 包装任意缓存层。读取到过期条目时删除并视为未命中；
//! 存储层错误只记录日志，读退化为未命中，写被丢弃。

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::application::ports::{
    generate_cache_key, now_millis, CacheBackend, CacheEntry, CacheStats,
};
use crate::infrastructure::memory::MemoryCacheBackend;

/// 默认 TTL 5 分钟
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// 响应缓存
pub struct ResponseCache {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl ResponseCache {
    pub fn new(backend: Arc<dyn CacheBackend>, default_ttl: Duration) -> Self {
        Self {
            backend,
            default_ttl,
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    /// 内存层缓存
    pub fn in_memory(max_size_bytes: u64, default_ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new(max_size_bytes)), default_ttl)
    }

    pub fn tier(&self) -> &'static str {
        self.backend.tier()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// 方法名 + 规范化参数
    pub fn key(method: &str, params: &Value) -> String {
        generate_cache_key(method, params)
    }

    pub async fn get_value(&self, key: &str) -> Option<Value> {
        let entry = match self.backend.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(tier = self.tier(), key = %key, error = %e, "Cache read failed");
                None
            }
        };

        match entry {
            Some(entry) if !entry.is_expired() => {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Cache hit");
                Some(entry.value)
            }
            Some(_) => {
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Cache entry expired");
                self.remove(key).await;
                None
            }
            None => {
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Cache miss");
                None
            }
        }
    }

    /// 读取并反序列化；类型不符视为未命中
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key).await?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cached value has unexpected shape");
                self.remove(key).await;
                None
            }
        }
    }

    /// 写入；`ttl` 为空时使用默认 TTL
    pub async fn set_value(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let entry = CacheEntry::new(value, ttl.unwrap_or(self.default_ttl));
        if let Err(e) = self.backend.set(key, entry).await {
            tracing::warn!(tier = self.tier(), key = %key, error = %e, "Cache write dropped");
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_value(value) {
            Ok(value) => self.set_value(key, value, ttl).await,
            Err(e) => tracing::warn!(key = %key, error = %e, "Value not cacheable"),
        }
    }

    pub async fn remove(&self, key: &str) {
        if let Err(e) = self.backend.remove(key).await {
            tracing::warn!(tier = self.tier(), key = %key, error = %e, "Cache remove failed");
        }
    }

    pub async fn clear(&self) {
        if let Err(e) = self.backend.clear().await {
            tracing::warn!(tier = self.tier(), error = %e, "Cache clear failed");
        }
    }

    /// 清理所有过期条目
    pub async fn purge_expired(&self) -> usize {
        match self.backend.purge_expired(now_millis()).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(tier = self.tier(), error = %e, "Cache purge failed");
                0
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            ..self.backend.stats().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::CacheError;
    use async_trait::async_trait;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_then_get_returns_value() {
        let cache = ResponseCache::in_memory(1024, DEFAULT_CACHE_TTL);
        let key = ResponseCache::key("getTemplate", &json!({"id": "tpl-1"}));

        cache.set_value(&key, json!({"id": "tpl-1"}), None).await;
        assert_eq!(cache.get_value(&key).await, Some(json!({"id": "tpl-1"})));

        let stats = cache.stats().await;
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.total_entries, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_removed() {
        let cache = ResponseCache::in_memory(1024, DEFAULT_CACHE_TTL);
        cache
            .set_value("k", json!("v"), Some(Duration::from_millis(30)))
            .await;
        assert_eq!(cache.get_value("k").await, Some(json!("v")));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get_value("k").await, None);
        assert_eq!(cache.stats().await.total_entries, 0);
        assert_eq!(cache.stats().await.miss_count, 1);
    }

    #[tokio::test]
    async fn test_typed_get() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Item {
            id: String,
        }

        let cache = ResponseCache::in_memory(1024, DEFAULT_CACHE_TTL);
        cache.set("item", &Item { id: "a".into() }, None).await;
        assert_eq!(cache.get::<Item>("item").await, Some(Item { id: "a".into() }));
        assert_eq!(cache.get::<Vec<u32>>("item").await, None);
    }

    struct BrokenBackend;

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        fn tier(&self) -> &'static str {
            "broken"
        }
        async fn get(&self, _: &str) -> Result<Option<CacheEntry>, CacheError> {
            Err(CacheError::IoError("disk gone".into()))
        }
        async fn set(&self, _: &str, _: CacheEntry) -> Result<(), CacheError> {
            Err(CacheError::QuotaExceeded)
        }
        async fn remove(&self, _: &str) -> Result<(), CacheError> {
            Err(CacheError::IoError("disk gone".into()))
        }
        async fn clear(&self) -> Result<(), CacheError> {
            Ok(())
        }
        async fn purge_expired(&self, _: i64) -> Result<usize, CacheError> {
            Err(CacheError::IoError("disk gone".into()))
        }
        async fn stats(&self) -> CacheStats {
            CacheStats::default()
        }
    }

    #[tokio::test]
    async fn test_storage_errors_fail_soft() {
        let cache = ResponseCache::new(Arc::new(BrokenBackend), DEFAULT_CACHE_TTL);
        cache.set_value("k", json!(1), None).await;
        assert_eq!(cache.get_value("k").await, None);
        assert_eq!(cache.purge_expired().await, 0);
    }
}
