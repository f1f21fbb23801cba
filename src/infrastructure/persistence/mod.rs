//! Persistence Layer - 数据持久化
//!
//! SQLite 和 Sled 存储实现

pub mod sled;
pub mod sqlite;

pub use self::sled::{SledCacheConfig, SledCacheStore};
pub use self::sqlite::{
    create_pool, open_database, run_migrations, DatabaseConfig, DbPool, SqliteCacheStore,
    SqliteOfflineStore,
};
