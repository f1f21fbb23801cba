//! Offline Layer - 离线请求队列

mod queue;

pub use queue::{DrainReport, OfflineQueue, OfflineTicket};
