//! Push Hub - 进程内推送通道
//!
//! 按通道名维护 broadcast 发送端。最后一个订阅者退订后通道被回收。
//! 可作为回环通道直接使用，也可由真实传输（WebSocket 等）把收到的消息 `send` 进来。

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::application::ports::{
    task_channel, ChannelError, PushChannelPort, PushMessage, PushSubscription, TASK_CANCELLED,
    TASK_COMPLETED, TASK_FAILED, TASK_PROGRESS,
};

const CHANNEL_CAPACITY: usize = 100;

/// 推送中心
pub struct PushHub {
    /// channel -> broadcast sender
    channels: Arc<DashMap<String, broadcast::Sender<PushMessage>>>,
    connected: AtomicBool,
}

impl PushHub {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            connected: AtomicBool::new(true),
        }
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// 当前有订阅者的通道数
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// 向任务通道发布消息
    pub fn publish(&self, task_id: &str, message_type: &str, data: Value) {
        let message = PushMessage::new(task_channel(task_id), message_type, data);
        self.deliver(message);
    }

    pub fn publish_progress(&self, task_id: &str, data: Value) {
        self.publish(task_id, TASK_PROGRESS, data);
    }

    pub fn publish_completed(&self, task_id: &str) {
        self.publish(task_id, TASK_COMPLETED, Value::Null);
    }

    pub fn publish_failed(&self, task_id: &str, error: &str) {
        self.publish(task_id, TASK_FAILED, serde_json::json!({ "error": error }));
    }

    pub fn publish_cancelled(&self, task_id: &str) {
        self.publish(task_id, TASK_CANCELLED, Value::Null);
    }

    fn deliver(&self, message: PushMessage) {
        match self.channels.get(&message.channel) {
            Some(sender) => {
                if let Err(e) = sender.send(message) {
                    tracing::debug!(error = %e, "Failed to publish push message (no receivers)");
                }
            }
            None => tracing::debug!(
                channel = %message.channel,
                message_type = %message.message_type,
                "No subscribers for push message"
            ),
        }
    }
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushChannelPort for PushHub {
    fn subscribe(&self, channel: &str) -> PushSubscription {
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let channels = self.channels.clone();
        let name = channel.to_string();
        let on_unsubscribe = Box::new(move || {
            // 回调执行时本订阅的接收端仍然存活
            channels.remove_if(&name, |_, tx| tx.receiver_count() <= 1);
        });

        tracing::debug!(channel = %channel, "Push channel subscribed");
        PushSubscription::new(channel, receiver, Some(on_unsubscribe))
    }

    async fn send(&self, message: PushMessage) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        self.deliver(message);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
