//! Cache Layer - 响应缓存
//!
//! 三种可互换的存储层级：内存、Sled、SQLite

mod response_cache;

pub use response_cache::{ResponseCache, DEFAULT_CACHE_TTL};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::application::ports::{CacheBackend, CacheError};
use crate::infrastructure::memory::MemoryCacheBackend;
use crate::infrastructure::persistence::{open_database, DatabaseConfig, SledCacheStore, SqliteCacheStore};

/// 缓存层级
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    #[default]
    Memory,
    Sled,
    Sqlite,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Memory => "memory",
            CacheTier::Sled => "sled",
            CacheTier::Sqlite => "sqlite",
        }
    }

    pub fn is_persistent(&self) -> bool {
        !matches!(self, CacheTier::Memory)
    }
}

/// 按层级打开缓存后端
///
/// 持久化层级需要 `path`：Sled 为数据库目录，SQLite 为数据库文件
pub async fn open_cache_backend(
    tier: CacheTier,
    path: Option<&Path>,
    max_size_bytes: u64,
) -> Result<Arc<dyn CacheBackend>, CacheError> {
    let require_path = || {
        path.ok_or_else(|| {
            CacheError::IoError(format!("cache tier '{}' requires a path", tier.as_str()))
        })
    };

    let backend: Arc<dyn CacheBackend> = match tier {
        CacheTier::Memory => Arc::new(MemoryCacheBackend::new(max_size_bytes)),
        CacheTier::Sled => Arc::new(SledCacheStore::open(require_path()?, max_size_bytes)?),
        CacheTier::Sqlite => {
            let pool = open_database(&DatabaseConfig::new(require_path()?))
                .await
                .map_err(|e| CacheError::DatabaseError(e.to_string()))?;
            Arc::new(SqliteCacheStore::new(pool))
        }
    };

    tracing::info!(tier = tier.as_str(), max_size_bytes = max_size_bytes, "Cache backend opened");
    Ok(backend)
}
