//! Memory Layer - 内存实现
//!
//! 内存缓存层与非持久化的离线请求存储

mod memory_cache;
mod offline_store;

pub use memory_cache::{MemoryCacheBackend, DEFAULT_MAX_CACHE_BYTES};
pub use offline_store::MemoryOfflineStore;
