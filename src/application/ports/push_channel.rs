//! Push Channel Port - 推送通道抽象
//!
//! 每个任务一个逻辑通道 `task.<taskId>`，消息信封为 `{type, data}`。
//! 具体传输（WebSocket、SSE 等）由调用方提供。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// 推送通道错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

pub const TASK_PROGRESS: &str = "task.progress";
pub const TASK_COMPLETED: &str = "task.completed";
pub const TASK_FAILED: &str = "task.failed";
pub const TASK_CANCELLED: &str = "task.cancelled";

/// 任务通道名
pub fn task_channel(task_id: &str) -> String {
    format!("task.{}", task_id)
}

/// 推送消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub channel: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
}

impl PushMessage {
    pub fn new(channel: impl Into<String>, message_type: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            message_type: message_type.into(),
            data,
        }
    }
}

/// 订阅句柄
///
/// 持有接收端；`unsubscribe` 或 drop 时通知通道释放资源
pub struct PushSubscription {
    channel: String,
    receiver: broadcast::Receiver<PushMessage>,
    on_unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl PushSubscription {
    pub fn new(
        channel: impl Into<String>,
        receiver: broadcast::Receiver<PushMessage>,
        on_unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
    ) -> Self {
        Self {
            channel: channel.into(),
            receiver,
            on_unsubscribe,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// 接收下一条消息；通道关闭时返回 None
    ///
    /// 接收端落后时跳过丢失的消息继续接收
    pub async fn recv(&mut self) -> Option<PushMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %self.channel, skipped = skipped, "Push subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(callback) = self.on_unsubscribe.take() {
            callback();
        }
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        if let Some(callback) = self.on_unsubscribe.take() {
            callback();
        }
    }
}

/// Push Channel Port
#[async_trait]
pub trait PushChannelPort: Send + Sync {
    /// 订阅通道
    fn subscribe(&self, channel: &str) -> PushSubscription;

    /// 发送消息
    async fn send(&self, message: PushMessage) -> Result<(), ChannelError>;

    /// 通道是否已连接
    fn is_connected(&self) -> bool;
}
