//! Cache Backend Port - 响应缓存存储层
//!
//! 定义缓存后端的抽象接口，具体实现有三种可互换的层级：
//! - 内存（带字节预算与淘汰）
//! - Sled 持久化 KV（带配额，超额时淘汰约一半条目后重试一次）
//! - SQLite 事务型对象存储

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Cache 错误
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache quota exceeded")]
    QuotaExceeded,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// 缓存条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    /// 过期时间（毫秒时间戳）
    pub expires_at: i64,
    /// 估算的字节大小
    pub size_bytes: u64,
}

impl CacheEntry {
    pub fn new(value: Value, ttl: Duration) -> Self {
        let size_bytes = estimate_size(&value);
        Self {
            value,
            expires_at: now_millis() + ttl.as_millis() as i64,
            size_bytes,
        }
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }
}

/// 缓存统计信息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: u64,
    /// 0 表示由平台配额控制
    pub max_size_bytes: u64,
    pub hit_count: u64,
    pub miss_count: u64,
}

/// Cache Backend Port
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// 层级名称（用于日志）
    fn tier(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// 写入条目；是否执行淘汰由具体层级决定
    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;

    /// 删除所有已过期条目，返回删除数量
    async fn purge_expired(&self, now_ms: i64) -> Result<usize, CacheError>;

    async fn stats(&self) -> CacheStats;
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 按序列化后的 JSON 长度估算大小
pub fn estimate_size(value: &Value) -> u64 {
    serde_json::to_vec(value).map(|v| v.len() as u64).unwrap_or(0)
}

/// 生成缓存 key
///
/// 方法名 + 参数的规范化 JSON（对象键递归排序），参数顺序不影响命中
pub fn generate_cache_key(method: &str, params: &Value) -> String {
    let mut key = String::with_capacity(method.len() + 32);
    key.push_str(method);
    key.push(':');
    write_canonical(params, &mut key);
    key
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*k).clone()).to_string());
                out.push(':');
                write_canonical(&map[k.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
