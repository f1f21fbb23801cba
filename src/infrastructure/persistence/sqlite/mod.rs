//! SQLite Persistence - SQLite 数据库持久化实现

mod cache_store;
mod database;
mod offline_store;

pub use cache_store::*;
pub use database::*;
pub use offline_store::*;
