//! Infrastructure Layer - 基础设施层
//!
//! 提供所有端口的具体实现，以及客户端内部使用的管线、缓存、离线队列与上传

pub mod adapters;
pub mod cache;
pub mod events;
pub mod memory;
pub mod network;
pub mod offline;
pub mod persistence;
pub mod pipeline;
pub mod upload;

pub use adapters::{FakeTransport, ReqwestTransport, ReqwestTransportConfig};
pub use cache::{CacheTier, ResponseCache};
pub use events::PushHub;
pub use network::NetworkMonitor;
pub use pipeline::{PipelineConfig, RequestPipeline, RetryPolicy};
