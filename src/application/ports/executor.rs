//! Api Executor Port - 客户端请求执行入口
//!
//! 上传器与离线队列回放通过它把请求交回客户端，
//! 从而经过管线准入、重试与错误分类

use async_trait::async_trait;

use super::transport::{ApiRequest, ApiResponse};
use crate::application::error::ClientError;

/// Api Executor Port
#[async_trait]
pub trait ApiExecutor: Send + Sync {
    /// 执行请求；非 2xx 状态返回 `ClientError::Server`
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ClientError>;
}
