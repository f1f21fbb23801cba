//! funclient - 远端函数执行服务客户端
//!
//! 架构设计: DDD + Hexagonal Architecture
//!
//! 领域层 (domain/):
//! - Template Context: 函数模板、参数 schema 与校验
//! - Task Context: 任务提交、状态与结果
//!
//! 应用层 (application/):
//! - Ports: 端口定义（HttpTransport, PushChannel, NetworkStatus, CacheBackend, OfflineStore）
//! - Handles: 任务句柄与批量句柄
//! - Client: FunctionsClient 编排入口
//!
//! 基础设施层 (infrastructure/):
//! - Pipeline: 并发限制与重试
//! - Cache: 响应缓存（内存 / Sled / SQLite）
//! - Offline: 离线请求队列
//! - Upload: 单次、多文件与分片续传上传
//! - Adapters: reqwest 传输与测试用脚本化传输
//! - Events: 进程内推送通道
//! - Network: 连通性监视

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::{ClientError, FunctionsClient, TaskHandle};
pub use config::{load_config, AppConfig};
