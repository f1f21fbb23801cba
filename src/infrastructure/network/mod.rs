//! Network Layer - 连通性监视

mod monitor;

pub use monitor::NetworkMonitor;
