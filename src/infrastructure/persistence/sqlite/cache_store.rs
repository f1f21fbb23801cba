//! SQLite Response Cache
//!
//! 事务型持久化缓存层，所有写入都在事务中完成

use async_trait::async_trait;
use sqlx::FromRow;

use super::DbPool;
use crate::application::ports::{CacheBackend, CacheEntry, CacheError, CacheStats};

fn db_err(e: sqlx::Error) -> CacheError {
    CacheError::DatabaseError(e.to_string())
}

/// SQLite 响应缓存
pub struct SqliteCacheStore {
    pool: DbPool,
}

impl SqliteCacheStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct CacheRow {
    value: String,
    expires_at: i64,
    size_bytes: i64,
}

impl TryFrom<CacheRow> for CacheEntry {
    type Error = CacheError;

    fn try_from(row: CacheRow) -> Result<Self, Self::Error> {
        Ok(CacheEntry {
            value: serde_json::from_str(&row.value)
                .map_err(|e| CacheError::SerializationError(e.to_string()))?,
            expires_at: row.expires_at,
            size_bytes: row.size_bytes.max(0) as u64,
        })
    }
}

#[async_trait]
impl CacheBackend for SqliteCacheStore {
    fn tier(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let row: Option<CacheRow> = sqlx::query_as(
            "SELECT value, expires_at, size_bytes FROM response_cache WHERE cache_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(CacheEntry::try_from).transpose()
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let value = serde_json::to_string(&entry.value)
            .map_err(|e| CacheError::SerializationError(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO response_cache (cache_key, value, expires_at, size_bytes)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(cache_key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                size_bytes = excluded.size_bytes
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(entry.expires_at)
        .bind(entry.size_bytes as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM response_cache WHERE cache_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM response_cache")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<usize, CacheError> {
        let result = sqlx::query("DELETE FROM response_cache WHERE expires_at <= ?")
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self) -> CacheStats {
        let row: Result<(i64, i64), sqlx::Error> = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM response_cache",
        )
        .fetch_one(&self.pool)
        .await;

        match row {
            Ok((entries, bytes)) => CacheStats {
                total_entries: entries.max(0) as usize,
                total_size_bytes: bytes.max(0) as u64,
                ..Default::default()
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read sqlite cache stats");
                CacheStats::default()
            }
        }
    }
}
