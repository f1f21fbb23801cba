//! Application Ports - 出站端口定义
//!
//! 定义客户端与基础设施层的抽象接口

mod cache_backend;
mod executor;
mod network;
mod offline_store;
mod push_channel;
mod transport;

pub use cache_backend::{
    estimate_size, generate_cache_key, now_millis, CacheBackend, CacheEntry, CacheError,
    CacheStats,
};
pub use executor::ApiExecutor;
pub use network::NetworkStatusPort;
pub use offline_store::{OfflineRequest, OfflineStoreError, OfflineStorePort, RequestKind};
pub use push_channel::{
    task_channel, ChannelError, PushChannelPort, PushMessage, PushSubscription, TASK_CANCELLED,
    TASK_COMPLETED, TASK_FAILED, TASK_PROGRESS,
};
pub use transport::{
    canonical_reason, ApiRequest, ApiResponse, FilePart, HttpMethod, HttpTransport,
    MultipartForm, ProgressCallback, RequestBody, TransportError, UploadProgress,
};
