//! Offline Store Port - 离线请求的持久化存储

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::transport::{ApiRequest, HttpMethod};

/// Offline Store 错误
#[derive(Debug, Error)]
pub enum OfflineStoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// 离线请求分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    SubmitTask,
    SubmitBatch,
    CancelTask,
    Upload,
    Query,
    Other,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::SubmitTask => "submit_task",
            RequestKind::SubmitBatch => "submit_batch",
            RequestKind::CancelTask => "cancel_task",
            RequestKind::Upload => "upload",
            RequestKind::Query => "query",
            RequestKind::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "submit_task" => Some(RequestKind::SubmitTask),
            "submit_batch" => Some(RequestKind::SubmitBatch),
            "cancel_task" => Some(RequestKind::CancelTask),
            "upload" => Some(RequestKind::Upload),
            "query" => Some(RequestKind::Query),
            "other" => Some(RequestKind::Other),
            _ => None,
        }
    }

    /// 按方法与路径分类请求
    pub fn classify(request: &ApiRequest) -> Self {
        let path = request.path.split('?').next().unwrap_or("");
        match request.method {
            HttpMethod::Get => RequestKind::Query,
            HttpMethod::Post if path.ends_with("/functions/tasks") => RequestKind::SubmitTask,
            HttpMethod::Post if path.ends_with("/functions/batches") => RequestKind::SubmitBatch,
            HttpMethod::Post if path.ends_with("/cancel") => RequestKind::CancelTask,
            HttpMethod::Post if path.contains("/functions/upload") => RequestKind::Upload,
            _ => RequestKind::Other,
        }
    }
}

/// 离线请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineRequest {
    pub id: String,
    pub kind: RequestKind,
    pub request: ApiRequest,
    pub enqueued_at: DateTime<Utc>,
    /// 用于回放完成后关联等待中的调用方
    pub callback_id: String,
}

impl OfflineRequest {
    pub fn new(request: ApiRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: RequestKind::classify(&request),
            request,
            enqueued_at: Utc::now(),
            callback_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Offline Store Port
///
/// 按入队顺序保存离线请求，进程重启后可重新加载
#[async_trait]
pub trait OfflineStorePort: Send + Sync {
    /// 按入队顺序加载全部请求
    async fn load_all(&self) -> Result<Vec<OfflineRequest>, OfflineStoreError>;

    async fn append(&self, request: &OfflineRequest) -> Result<(), OfflineStoreError>;

    async fn remove(&self, id: &str) -> Result<(), OfflineStoreError>;

    async fn clear(&self) -> Result<(), OfflineStoreError>;
}
