//! Offline Queue - 断网期间的请求队列
//!
//! 断网时请求被追加到内存队列并持久化，调用方拿到按 callback_id 关联的等待端。
//! 恢复连接后按 FIFO 回放：
//! - 成功：出队并完成等待端
//! - 可重试失败：留在队首，停止本轮回放
//! - 不可重试失败：出队并以该错误拒绝等待端

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::application::error::ClientError;
use crate::application::ports::{
    ApiExecutor, ApiRequest, ApiResponse, OfflineRequest, OfflineStorePort,
};
use crate::infrastructure::pipeline::RetryPolicy;

type ReplayOutcome = Result<ApiResponse, ClientError>;

/// 离线请求的等待端
pub struct OfflineTicket {
    pub request_id: String,
    pub callback_id: String,
    rx: oneshot::Receiver<ReplayOutcome>,
}

impl OfflineTicket {
    /// 等待回放结果；队列被清空时返回 `Disposed`
    pub async fn wait(self) -> ReplayOutcome {
        self.rx.await.unwrap_or(Err(ClientError::Disposed))
    }
}

/// 一轮回放的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub rejected: usize,
    pub remaining: usize,
}

/// 离线请求队列
pub struct OfflineQueue {
    store: Arc<dyn OfflineStorePort>,
    retry_policy: RetryPolicy,
    pending: Mutex<VecDeque<OfflineRequest>>,
    /// callback_id -> 等待端
    waiters: DashMap<String, oneshot::Sender<ReplayOutcome>>,
    /// 同一时间只有一个回放者
    drain_lock: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
    /// 从存储重新加载队列
    pub async fn load(
        store: Arc<dyn OfflineStorePort>,
        retry_policy: RetryPolicy,
    ) -> Result<Self, ClientError> {
        let restored = store.load_all().await?;
        if !restored.is_empty() {
            tracing::info!(count = restored.len(), "Restored offline requests");
        }

        Ok(Self {
            store,
            retry_policy,
            pending: Mutex::new(restored.into_iter().collect()),
            waiters: DashMap::new(),
            drain_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<OfflineRequest>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 入队并持久化
    pub async fn enqueue(&self, request: ApiRequest) -> OfflineTicket {
        let offline = OfflineRequest::new(request);
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(offline.callback_id.clone(), tx);
        self.lock().push_back(offline.clone());

        if let Err(e) = self.store.append(&offline).await {
            tracing::warn!(
                request_id = %offline.id,
                error = %e,
                "Failed to persist offline request, kept in memory only"
            );
        }

        tracing::info!(
            request_id = %offline.id,
            kind = offline.kind.as_str(),
            path = %offline.request.path,
            "Request queued while offline"
        );

        OfflineTicket {
            request_id: offline.id,
            callback_id: offline.callback_id,
            rx,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 当前排队请求的快照
    pub fn pending(&self) -> Vec<OfflineRequest> {
        self.lock().iter().cloned().collect()
    }

    /// 按 FIFO 回放
    pub async fn drain(&self, executor: &dyn ApiExecutor) -> DrainReport {
        let _guard = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        loop {
            let head = match self.lock().front().cloned() {
                Some(head) => head,
                None => break,
            };

            match executor.execute(head.request.clone()).await {
                // 客户端已释放：保留请求，下次会话再回放
                Err(ClientError::Disposed) => break,
                Ok(response) => {
                    self.finish(&head, Ok(response)).await;
                    report.replayed += 1;
                }
                Err(error) if self.retry_policy.is_retryable(&error) => {
                    tracing::warn!(
                        request_id = %head.id,
                        error = %error,
                        "Offline replay failed, will retry later"
                    );
                    break;
                }
                Err(error) => {
                    tracing::warn!(
                        request_id = %head.id,
                        error = %error,
                        "Offline request rejected"
                    );
                    self.finish(&head, Err(error)).await;
                    report.rejected += 1;
                }
            }
        }

        report.remaining = self.len();
        if report.replayed + report.rejected > 0 {
            tracing::info!(
                replayed = report.replayed,
                rejected = report.rejected,
                remaining = report.remaining,
                "Offline queue drained"
            );
        }
        report
    }

    /// 出队、删除持久化记录并通知等待端
    async fn finish(&self, request: &OfflineRequest, outcome: ReplayOutcome) {
        {
            let mut pending = self.lock();
            if pending.front().map(|r| r.id == request.id).unwrap_or(false) {
                pending.pop_front();
            } else {
                pending.retain(|r| r.id != request.id);
            }
        }

        if let Err(e) = self.store.remove(&request.id).await {
            tracing::warn!(request_id = %request.id, error = %e, "Failed to remove offline request");
        }

        match self.waiters.remove(&request.callback_id) {
            Some((_, tx)) => {
                let _ = tx.send(outcome);
            }
            None => tracing::debug!(
                request_id = %request.id,
                "Replayed request has no waiter (restored from storage)"
            ),
        }
    }

    /// 放弃所有等待端（调用方收到 `Disposed`），排队的请求与持久化记录保留
    pub fn release_waiters(&self) {
        let released = self.waiters.len();
        self.waiters.clear();
        if released > 0 {
            tracing::debug!(released, "Offline waiters released");
        }
    }

    /// 清空队列，等待中的调用方收到 `Disposed`
    pub async fn clear(&self) {
        let _guard = self.drain_lock.lock().await;
        self.lock().clear();
        self.waiters.clear();
        if let Err(e) = self.store.clear().await {
            tracing::warn!(error = %e, "Failed to clear offline store");
        }
    }
}
