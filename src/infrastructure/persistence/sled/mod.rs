//! Sled Persistence - 持久化 KV 缓存层

mod cache_store;

pub use cache_store::{SledCacheConfig, SledCacheStore};
