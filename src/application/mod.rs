//! 应用层 - 用例编排
//!
//! 包含：
//! - ports: 六边形架构端口定义（Transport、PushChannel、NetworkStatus、CacheBackend、OfflineStore）
//! - handles: 任务句柄与批量句柄
//! - client: 编排入口 FunctionsClient
//! - completion: 单次结算的完成结果
//! - error: 客户端错误定义

pub mod client;
pub mod completion;
pub mod error;
pub mod handles;
pub mod ports;

pub use client::{
    BatchOptions, ClientOptions, FunctionsClient, FunctionsClientBuilder, SubmitOptions,
};
pub use completion::{Completion, CompletionWaiter};
pub use error::ClientError;
pub use handles::{BatchHandle, BatchProgress, BatchReport, TaskHandle};
