//! In-Memory Cache Backend Implementation
//!
//! 唯一执行字节预算的层级：写入前按过期时间从早到晚淘汰，直到新条目放得下

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::application::ports::{CacheBackend, CacheEntry, CacheError, CacheStats};

/// 默认字节预算 50MB
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
}

impl MemoryState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(key);
        if let Some(entry) = &removed {
            self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        }
        removed
    }

    /// 淘汰最早过期的条目
    fn evict_soonest(&mut self) -> Option<(String, CacheEntry)> {
        let key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.expires_at)
            .map(|(key, _)| key.clone())?;
        self.remove(&key).map(|entry| (key, entry))
    }
}

/// 内存缓存
pub struct MemoryCacheBackend {
    state: Mutex<MemoryState>,
    max_size_bytes: u64,
}

impl MemoryCacheBackend {
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            max_size_bytes,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // 锁内不会 panic，中毒时直接取回数据
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CACHE_BYTES)
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    fn tier(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.lock().entries.get(key).cloned())
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let mut state = self.lock();
        state.remove(key);

        if entry.size_bytes > self.max_size_bytes {
            tracing::debug!(
                key = %key,
                size_bytes = entry.size_bytes,
                max_size_bytes = self.max_size_bytes,
                "Entry larger than cache budget, not cached"
            );
            return Ok(());
        }

        while state.total_bytes + entry.size_bytes > self.max_size_bytes {
            match state.evict_soonest() {
                Some((evicted, old)) => tracing::debug!(
                    key = %evicted,
                    size_bytes = old.size_bytes,
                    "Evicted cache entry"
                ),
                None => break,
            }
        }

        state.total_bytes += entry.size_bytes;
        state.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut state = self.lock();
        state.entries.clear();
        state.total_bytes = 0;
        Ok(())
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize, CacheError> {
        let mut state = self.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now_ms))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        Ok(expired.len())
    }

    async fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            total_entries: state.entries.len(),
            total_size_bytes: state.total_bytes,
            max_size_bytes: self.max_size_bytes,
            ..Default::default()
        }
    }
}
