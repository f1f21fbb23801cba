//! 客户端错误定义
//!
//! 统一的错误类型。错误可以 Clone，以便同一个完成结果被多个等待方读取。

use std::time::Duration;
use thiserror::Error;

use crate::application::handles::BatchReport;
use crate::application::ports::{CacheError, OfflineStoreError, TransportError};
use crate::domain::Violation;

/// 默认可重试状态码
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// 客户端错误
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// 参数校验失败，不经网络、不重试
    #[error("Validation error: {}", format_violations(.0))]
    Validation(Vec<Violation>),

    /// 网络层失败
    #[error("Network error: {0}")]
    Network(String),

    /// 单次请求超时
    #[error("Request timeout")]
    Timeout,

    /// 请求被中止
    #[error("Request aborted")]
    Aborted,

    /// 服务端返回非 2xx
    #[error("Server error {status} {status_text}: {body}")]
    Server {
        status: u16,
        status_text: String,
        body: String,
    },

    /// 响应无法解析
    #[error("Invalid response: {0}")]
    Decode(String),

    /// 任务在远端执行失败
    #[error("Task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    /// 任务被取消
    #[error("Task {task_id} was cancelled")]
    TaskCancelled { task_id: String },

    /// 句柄在完成前被释放
    #[error("Handle disposed")]
    Disposed,

    /// 等待完成超时
    #[error("Timed out after {waited:?} waiting for {target}")]
    WaitTimeout { target: String, waited: Duration },

    /// 上传失败
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    /// 批量任务中至少一个失败，携带完整的结果/错误表
    #[error("{}", format_batch_failure(.0))]
    BatchFailed(Box<BatchReport>),

    /// 本地存储错误
    #[error("Storage error: {0}")]
    Storage(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_batch_failure(report: &BatchReport) -> String {
    format!(
        "Batch {} failed: {} of {} tasks failed",
        report.batch_id,
        report.errors.len(),
        report.total()
    )
}

impl ClientError {
    pub fn validation(violations: Vec<Violation>) -> Self {
        Self::Validation(violations)
    }

    pub fn server(status: u16, status_text: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Server {
            status,
            status_text: status_text.into(),
            body: body.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// 是否属于瞬时失败（网络、超时、5xx/429 等）
    ///
    /// 状态码集合可配置，见 `RetryPolicy::is_retryable`
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Network(_) | ClientError::Timeout)
    }

    /// 按默认状态码集合判断是否值得重试
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Server { status, .. } => DEFAULT_RETRYABLE_STATUSES.contains(status),
            other => other.is_transient(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ClientError::Validation(_))
    }

    /// 不修改输入就不可能成功
    pub fn is_permanent(&self) -> bool {
        self.is_validation()
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network(message) => ClientError::Network(message),
            TransportError::Timeout => ClientError::Timeout,
            TransportError::Aborted => ClientError::Aborted,
            TransportError::InvalidRequest(message) => ClientError::Network(message),
        }
    }
}

impl From<CacheError> for ClientError {
    fn from(err: CacheError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<OfflineStoreError> for ClientError {
    fn from(err: OfflineStoreError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
