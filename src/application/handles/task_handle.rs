//! Task Handle - 单个任务的生命周期
//!
//! 状态机：`pending → {progress}* → {completed | failed | cancelled}`。
//! 构造时订阅 `task.<id>` 并启动消息泵；消息到状态转移的映射是纯函数
//! `next_transition`，与具体推送传输无关。

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::TaskApi;
use crate::application::completion::{Completion, CompletionWaiter};
use crate::application::error::ClientError;
use crate::application::ports::{
    task_channel, PushChannelPort, PushMessage, PushSubscription, TASK_CANCELLED, TASK_COMPLETED,
    TASK_FAILED, TASK_PROGRESS,
};
use crate::domain::{TaskResult, TaskState, TaskStatus};

pub type ProgressListener = Arc<dyn Fn(&TaskStatus) + Send + Sync>;
pub type CompleteListener = Arc<dyn Fn(&TaskResult) + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// 进度消息携带的字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub stage: Option<String>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub eta_seconds: Option<f64>,
}

impl ProgressUpdate {
    fn from_data(data: &Value) -> Self {
        let text = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            stage: text("stage"),
            progress: data.get("progress").and_then(Value::as_f64),
            message: text("message"),
            eta_seconds: data
                .get("eta_seconds")
                .or_else(|| data.get("eta"))
                .and_then(Value::as_f64),
        }
    }

    fn apply_to(self, status: &mut TaskStatus) {
        status.state = TaskState::Progress;
        if self.stage.is_some() {
            status.stage = self.stage;
        }
        if self.progress.is_some() {
            status.progress = self.progress;
        }
        if self.message.is_some() {
            status.message = self.message;
        }
        if self.eta_seconds.is_some() {
            status.eta_seconds = self.eta_seconds;
        }
        status.updated_at = Some(chrono::Utc::now());
    }
}

/// 状态转移
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Progress(ProgressUpdate),
    Complete,
    Fail(String),
    Cancel,
    Ignore,
}

/// 推送消息 -> 状态转移
pub fn next_transition(message: &PushMessage) -> Transition {
    match message.message_type.as_str() {
        TASK_PROGRESS => Transition::Progress(ProgressUpdate::from_data(&message.data)),
        TASK_COMPLETED => Transition::Complete,
        TASK_FAILED => Transition::Fail(failure_message(&message.data)),
        TASK_CANCELLED => Transition::Cancel,
        _ => Transition::Ignore,
    }
}

fn failure_message(data: &Value) -> String {
    data.get("error")
        .and_then(|e| e.as_str().or_else(|| e.get("message").and_then(Value::as_str)))
        .or_else(|| data.get("message").and_then(Value::as_str))
        .unwrap_or("Task failed")
        .to_string()
}

#[derive(Default)]
struct Listeners {
    progress: Option<ProgressListener>,
    complete: Option<CompleteListener>,
    error: Option<ErrorListener>,
}

struct TaskHandleInner {
    task_id: String,
    api: Arc<dyn TaskApi>,
    status: Mutex<TaskStatus>,
    listeners: Mutex<Listeners>,
    completion: Completion<TaskResult>,
    /// 已进入终态处理
    settling: AtomicBool,
    disposed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TaskHandleInner {
    fn is_done(&self) -> bool {
        self.disposed.load(Ordering::SeqCst) || self.settling.load(Ordering::SeqCst)
    }

    async fn apply(&self, transition: Transition) {
        match transition {
            Transition::Progress(update) => {
                if self.is_done() {
                    return;
                }
                let snapshot = {
                    let mut status = lock(&self.status);
                    update.apply_to(&mut status);
                    status.clone()
                };
                let listener = lock(&self.listeners).progress.clone();
                if let Some(listener) = listener {
                    listener(&snapshot);
                }
            }
            Transition::Complete => {
                if self.is_done() {
                    return;
                }
                match self.api.get_task_result(&self.task_id).await {
                    Ok(result) => self.complete(result),
                    Err(error) => self.fail(error, TaskState::Failed),
                }
            }
            Transition::Fail(message) => self.fail(
                ClientError::TaskFailed {
                    task_id: self.task_id.clone(),
                    message,
                },
                TaskState::Failed,
            ),
            Transition::Cancel => self.fail(
                ClientError::TaskCancelled {
                    task_id: self.task_id.clone(),
                },
                TaskState::Cancelled,
            ),
            Transition::Ignore => {
                tracing::debug!(task_id = %self.task_id, "Ignoring unknown push message");
            }
        }
    }

    fn complete(&self, result: TaskResult) {
        if self.disposed.load(Ordering::SeqCst) || self.settling.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut status = lock(&self.status);
            status.state = TaskState::Completed;
            status.progress = Some(100.0);
            status.updated_at = Some(chrono::Utc::now());
        }

        let listener = lock(&self.listeners).complete.clone();
        if let Some(listener) = listener {
            listener(&result);
        }
        self.completion.resolve(result);
        tracing::info!(task_id = %self.task_id, "Task completed");
        self.release();
    }

    fn fail(&self, error: ClientError, state: TaskState) {
        if self.disposed.load(Ordering::SeqCst) || self.settling.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut status = lock(&self.status);
            status.state = state;
            status.message = Some(error.to_string());
            status.updated_at = Some(chrono::Utc::now());
        }

        let listener = lock(&self.listeners).error.clone();
        if let Some(listener) = listener {
            listener(&error);
        }
        tracing::info!(task_id = %self.task_id, state = state.as_str(), error = %error, "Task ended");
        self.completion.reject(error);
        self.release();
    }

    /// 清理回调并拒绝未结算的完成结果；只有第一次调用生效
    fn release(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        *lock(&self.listeners) = Listeners::default();
        self.completion.reject(ClientError::Disposed);
        true
    }
}

impl Drop for TaskHandleInner {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }
}

/// 任务句柄
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskHandleInner>,
}

impl TaskHandle {
    pub fn new(task_id: impl Into<String>, api: Arc<dyn TaskApi>, channel: &dyn PushChannelPort) -> Self {
        Self::with_status(TaskStatus::pending(task_id), api, channel)
    }

    /// 以已知状态创建句柄并订阅任务通道
    pub fn with_status(initial: TaskStatus, api: Arc<dyn TaskApi>, channel: &dyn PushChannelPort) -> Self {
        let subscription = channel.subscribe(&task_channel(&initial.task_id));
        let inner = Arc::new(TaskHandleInner {
            task_id: initial.task_id.clone(),
            api,
            status: Mutex::new(initial),
            listeners: Mutex::new(Listeners::default()),
            completion: Completion::new(),
            settling: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(Self::pump(Arc::downgrade(&inner), subscription));
        *lock(&inner.pump) = Some(pump);

        tracing::debug!(task_id = %inner.task_id, "Task handle subscribed");
        Self { inner }
    }

    async fn pump(handle: Weak<TaskHandleInner>, mut subscription: PushSubscription) {
        while let Some(message) = subscription.recv().await {
            let Some(inner) = handle.upgrade() else {
                break;
            };
            if inner.disposed.load(Ordering::SeqCst) {
                break;
            }

            tracing::debug!(
                task_id = %inner.task_id,
                message_type = %message.message_type,
                "Dispatching push message"
            );
            inner.apply(next_transition(&message)).await;

            if inner.disposed.load(Ordering::SeqCst) {
                break;
            }
        }
        subscription.unsubscribe();
    }

    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    pub fn on_progress(&self, listener: impl Fn(&TaskStatus) + Send + Sync + 'static) -> &Self {
        if !self.is_disposed() {
            lock(&self.inner.listeners).progress = Some(Arc::new(listener));
        }
        self
    }

    pub fn on_complete(&self, listener: impl Fn(&TaskResult) + Send + Sync + 'static) -> &Self {
        if !self.is_disposed() {
            lock(&self.inner.listeners).complete = Some(Arc::new(listener));
        }
        self
    }

    pub fn on_error(&self, listener: impl Fn(&ClientError) + Send + Sync + 'static) -> &Self {
        if !self.is_disposed() {
            lock(&self.inner.listeners).error = Some(Arc::new(listener));
        }
        self
    }

    /// 当前状态快照
    pub fn status(&self) -> TaskStatus {
        lock(&self.inner.status).clone()
    }

    /// 主动查询状态（推送通道不可用时的轮询兜底）
    ///
    /// 查询到终态时与收到对应推送消息的效果相同
    pub async fn refresh_status(&self) -> Result<TaskStatus, ClientError> {
        let status = self.inner.api.get_task_status(&self.inner.task_id).await?;
        if self.inner.is_done() {
            return Ok(status);
        }

        *lock(&self.inner.status) = status.clone();
        match status.state {
            TaskState::Completed => self.inner.apply(Transition::Complete).await,
            TaskState::Failed => {
                let message = status.message.clone().unwrap_or_else(|| "Task failed".to_string());
                self.inner.apply(Transition::Fail(message)).await
            }
            TaskState::Cancelled => self.inner.apply(Transition::Cancel).await,
            _ => {}
        }
        Ok(status)
    }

    pub fn waiter(&self) -> CompletionWaiter<TaskResult> {
        self.inner.completion.waiter()
    }

    /// 等待任务结束，可选超时
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<TaskResult, ClientError> {
        let waiter = self.waiter();
        match timeout {
            Some(timeout) => waiter.wait_timeout(timeout, format!("task {}", self.inner.task_id)).await,
            None => waiter.wait().await,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.inner.completion.is_settled()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// 请求远端取消，无论结果如何都释放句柄
    pub async fn cancel(&self) -> Result<(), ClientError> {
        let result = self.inner.api.cancel_task(&self.inner.task_id).await;
        if let Err(error) = &result {
            tracing::warn!(task_id = %self.inner.task_id, error = %error, "Cancel request failed");
        }
        self.dispose();
        result
    }

    /// 释放句柄：退订通道、停止消息泵、清理回调；
    /// 未结算的完成结果以 `Disposed` 拒绝。可重复调用。
    pub fn dispose(&self) {
        if self.inner.release() {
            tracing::debug!(task_id = %self.inner.task_id, "Task handle disposed");
        }
        if let Some(pump) = lock(&self.inner.pump).take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::handles::test_support::{completed_result, StubTaskApi};
    use crate::infrastructure::events::PushHub;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn msg(kind: &str, data: Value) -> PushMessage {
        PushMessage::new("task.t1", kind, data)
    }

    #[test]
    fn test_next_transition_mapping() {
        assert_eq!(
            next_transition(&msg(TASK_PROGRESS, json!({"stage": "render", "progress": 30, "eta": 12}))),
            Transition::Progress(ProgressUpdate {
                stage: Some("render".into()),
                progress: Some(30.0),
                message: None,
                eta_seconds: Some(12.0),
            })
        );
        assert_eq!(next_transition(&msg(TASK_COMPLETED, Value::Null)), Transition::Complete);
        assert_eq!(
            next_transition(&msg(TASK_FAILED, json!({"error": "OOM"}))),
            Transition::Fail("OOM".into())
        );
        assert_eq!(
            next_transition(&msg(TASK_FAILED, json!({"error": {"message": "bad input"}}))),
            Transition::Fail("bad input".into())
        );
        assert_eq!(
            next_transition(&msg(TASK_FAILED, Value::Null)),
            Transition::Fail("Task failed".into())
        );
        assert_eq!(next_transition(&msg(TASK_CANCELLED, Value::Null)), Transition::Cancel);
        assert_eq!(next_transition(&msg("task.heartbeat", Value::Null)), Transition::Ignore);
    }

    #[tokio::test]
    async fn test_settles_once_after_many_progress_messages() {
        let hub = PushHub::new();
        let api = Arc::new(StubTaskApi::default().with_result("t1"));
        let handle = TaskHandle::new("t1", api.clone(), &hub);

        let progress_calls = Arc::new(AtomicUsize::new(0));
        let complete_calls = Arc::new(AtomicUsize::new(0));
        let p = progress_calls.clone();
        let c = complete_calls.clone();
        handle
            .on_progress(move |_| {
                p.fetch_add(1, Ordering::SeqCst);
            })
            .on_complete(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });

        for i in 0..10 {
            hub.publish_progress("t1", json!({"progress": i * 10, "stage": "sampling"}));
        }
        hub.publish_completed("t1");
        hub.publish_completed("t1");

        let result = handle.wait(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(result, completed_result("t1"));
        assert_eq!(progress_calls.load(Ordering::SeqCst), 10);
        assert_eq!(complete_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.result_calls.lock().unwrap().len(), 1);
        assert_eq!(handle.status().state, TaskState::Completed);
        assert!(handle.is_settled());

        // 结束后自动退订
        wait_until(|| hub.channel_count() == 0).await;
    }

    #[tokio::test]
    async fn test_failed_message_rejects_with_task_error() {
        let hub = PushHub::new();
        let handle = TaskHandle::new("t1", Arc::new(StubTaskApi::default()), &hub);
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = seen.clone();
        handle.on_error(move |e| {
            *seen_cb.lock().unwrap() = Some(e.to_string());
        });

        hub.publish_progress("t1", json!({"progress": 50}));
        hub.publish_failed("t1", "GPU out of memory");

        match handle.wait(None).await.unwrap_err() {
            ClientError::TaskFailed { task_id, message } => {
                assert_eq!(task_id, "t1");
                assert_eq!(message, "GPU out of memory");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(seen.lock().unwrap().as_deref().unwrap().contains("GPU out of memory"));
        assert_eq!(handle.status().state, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_message_rejects() {
        let hub = PushHub::new();
        let handle = TaskHandle::new("t1", Arc::new(StubTaskApi::default()), &hub);
        hub.publish_cancelled("t1");
        assert!(matches!(
            handle.wait(None).await,
            Err(ClientError::TaskCancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_rejects_waiters() {
        let hub = PushHub::new();
        let handle = TaskHandle::new("t1", Arc::new(StubTaskApi::default().with_result("t1")), &hub);
        let waiter = handle.waiter();

        handle.dispose();
        handle.dispose();

        assert!(matches!(waiter.wait().await, Err(ClientError::Disposed)));
        assert!(handle.is_disposed());
        wait_until(|| hub.channel_count() == 0).await;

        // 释放后的消息不再影响结果
        hub.publish_completed("t1");
        assert!(matches!(handle.wait(None).await, Err(ClientError::Disposed)));
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let hub = PushHub::new();
        let handle = TaskHandle::new("t1", Arc::new(StubTaskApi::default()), &hub);
        let err = handle.wait(Some(Duration::from_millis(20))).await.unwrap_err();
        assert!(matches!(err, ClientError::WaitTimeout { .. }));
        assert!(!handle.is_settled());
    }

    #[tokio::test]
    async fn test_cancel_disposes_even_when_request_fails() {
        let hub = PushHub::new();
        let api = Arc::new(StubTaskApi::default());
        *api.cancel_error.lock().unwrap() = Some(ClientError::server(409, "Conflict", "already done"));
        let handle = TaskHandle::new("t1", api.clone(), &hub);

        assert!(handle.cancel().await.is_err());
        assert!(handle.is_disposed());
        assert_eq!(*api.cancelled.lock().unwrap(), vec!["t1".to_string()]);
        assert!(matches!(handle.wait(None).await, Err(ClientError::Disposed)));
    }

    #[tokio::test]
    async fn test_refresh_status_settles_terminal_task() {
        let hub = PushHub::new();
        let api = Arc::new(StubTaskApi::default().with_result("t1"));
        let mut done = TaskStatus::pending("t1");
        done.state = TaskState::Completed;
        api.statuses.lock().unwrap().insert("t1".into(), done);

        let handle = TaskHandle::new("t1", api, &hub);
        let status = handle.refresh_status().await.unwrap();
        assert_eq!(status.state, TaskState::Completed);
        assert_eq!(handle.wait(None).await.unwrap().task_id, "t1");
    }
}
