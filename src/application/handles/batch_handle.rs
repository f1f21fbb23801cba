//! Batch Handle - 批量任务的联合跟踪
//!
//! 每个成员独立跟踪：先拉取一次初始状态，再等待其完成结果并记录结果或错误。
//! 所有成员都结算后批量才结算；有任何错误时以 `BatchFailed` 拒绝，
//! 错误中携带完整的结果/错误表。

use futures_util::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::task_handle::TaskHandle;
use crate::application::completion::{Completion, CompletionWaiter};
use crate::application::error::ClientError;
use crate::domain::{TaskResult, TaskStatus, Violation};

/// 批量结果报告
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub batch_id: String,
    pub results: BTreeMap<String, TaskResult>,
    pub errors: BTreeMap<String, ClientError>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.results.len() + self.errors.len()
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// 失败的任务名
    pub fn failed_tasks(&self) -> Vec<&str> {
        self.errors.keys().map(String::as_str).collect()
    }
}

/// 批量进度
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchProgress {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub tasks: BTreeMap<String, TaskStatus>,
}

type BatchProgressListener = Arc<dyn Fn(&BatchProgress) + Send + Sync>;
type BatchCompleteListener = Arc<dyn Fn(&BatchReport) + Send + Sync>;
type BatchErrorListener = Arc<dyn Fn(&ClientError) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    progress: Option<BatchProgressListener>,
    complete: Option<BatchCompleteListener>,
    error: Option<BatchErrorListener>,
}

#[derive(Default)]
struct Bookkeeping {
    members: BTreeMap<String, TaskHandle>,
    results: BTreeMap<String, TaskResult>,
    errors: BTreeMap<String, ClientError>,
}

struct BatchInner {
    batch_id: String,
    total: usize,
    book: Mutex<Bookkeeping>,
    listeners: Mutex<Listeners>,
    completion: Completion<BatchReport>,
    disposed: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 任务名在批量内必须唯一，否则报告无法区分成员
pub(crate) fn check_unique_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<(), ClientError> {
    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            duplicates.insert(name);
        }
    }
    if duplicates.is_empty() {
        return Ok(());
    }
    Err(ClientError::validation(
        duplicates
            .into_iter()
            .map(|name| Violation::DuplicateTaskName {
                name: name.to_string(),
            })
            .collect(),
    ))
}

impl BatchInner {
    fn progress(&self) -> BatchProgress {
        let book = lock(&self.book);
        BatchProgress {
            completed: book.results.len(),
            failed: book.errors.len(),
            total: self.total,
            tasks: book
                .members
                .iter()
                .map(|(name, handle)| (name.clone(), handle.status()))
                .collect(),
        }
    }

    fn report(&self) -> BatchReport {
        let book = lock(&self.book);
        BatchReport {
            batch_id: self.batch_id.clone(),
            results: book.results.clone(),
            errors: book.errors.clone(),
        }
    }

    fn record(&self, name: &str, outcome: Result<TaskResult, ClientError>) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut book = lock(&self.book);
            match outcome {
                Ok(result) => {
                    book.results.insert(name.to_string(), result);
                }
                Err(error) => {
                    tracing::warn!(batch_id = %self.batch_id, task = %name, error = %error, "Batch member failed");
                    book.errors.insert(name.to_string(), error);
                }
            }
        }

        let listener = lock(&self.listeners).progress.clone();
        if let Some(listener) = listener {
            listener(&self.progress());
        }
    }

    fn settle(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let report = self.report();
        let listeners = std::mem::take(&mut *lock(&self.listeners));

        if report.is_success() {
            tracing::info!(batch_id = %self.batch_id, total = report.total(), "Batch completed");
            if let Some(listener) = listeners.complete {
                listener(&report);
            }
            self.completion.resolve(report);
        } else {
            let error = ClientError::BatchFailed(Box::new(report));
            tracing::warn!(batch_id = %self.batch_id, error = %error, "Batch failed");
            if let Some(listener) = listeners.error {
                listener(&error);
            }
            self.completion.reject(error);
        }
    }
}

/// 批量任务句柄
#[derive(Clone)]
pub struct BatchHandle {
    inner: Arc<BatchInner>,
}

impl BatchHandle {
    /// 以 `任务名 -> 句柄` 创建并开始跟踪所有成员
    ///
    /// 任务名重复时返回 `Validation`，传入的成员句柄会被释放
    pub fn new(batch_id: impl Into<String>, members: Vec<(String, TaskHandle)>) -> Result<Self, ClientError> {
        if let Err(error) = check_unique_names(members.iter().map(|(name, _)| name.as_str())) {
            for (_, handle) in &members {
                handle.dispose();
            }
            return Err(error);
        }

        let inner = Arc::new(BatchInner {
            batch_id: batch_id.into(),
            total: members.len(),
            book: Mutex::new(Bookkeeping {
                members: members.iter().cloned().collect(),
                ..Default::default()
            }),
            listeners: Mutex::new(Listeners::default()),
            completion: Completion::new(),
            disposed: AtomicBool::new(false),
            monitor: Mutex::new(None),
        });

        let monitor = tokio::spawn(Self::monitor(inner.clone(), members));
        *lock(&inner.monitor) = Some(monitor);

        Ok(Self { inner })
    }

    async fn monitor(inner: Arc<BatchInner>, members: Vec<(String, TaskHandle)>) {
        let watchers = members.into_iter().map(|(name, handle)| {
            let inner = inner.clone();
            async move {
                if let Err(error) = handle.refresh_status().await {
                    tracing::debug!(task = %name, error = %error, "Initial status fetch failed");
                }
                let outcome = handle.waiter().wait().await;
                inner.record(&name, outcome);
            }
        });

        join_all(watchers).await;
        inner.settle();
    }

    pub fn batch_id(&self) -> &str {
        &self.inner.batch_id
    }

    /// 按任务名取成员句柄
    pub fn task(&self, name: &str) -> Option<TaskHandle> {
        lock(&self.inner.book).members.get(name).cloned()
    }

    pub fn task_names(&self) -> Vec<String> {
        lock(&self.inner.book).members.keys().cloned().collect()
    }

    pub fn on_batch_progress(&self, listener: impl Fn(&BatchProgress) + Send + Sync + 'static) -> &Self {
        lock(&self.inner.listeners).progress = Some(Arc::new(listener));
        self
    }

    pub fn on_batch_complete(&self, listener: impl Fn(&BatchReport) + Send + Sync + 'static) -> &Self {
        lock(&self.inner.listeners).complete = Some(Arc::new(listener));
        self
    }

    pub fn on_batch_error(&self, listener: impl Fn(&ClientError) + Send + Sync + 'static) -> &Self {
        lock(&self.inner.listeners).error = Some(Arc::new(listener));
        self
    }

    /// 当前进度（纯读取）
    pub fn progress(&self) -> BatchProgress {
        self.inner.progress()
    }

    pub fn waiter(&self) -> CompletionWaiter<BatchReport> {
        self.inner.completion.waiter()
    }

    pub async fn wait(&self, timeout: Option<Duration>) -> Result<BatchReport, ClientError> {
        let waiter = self.waiter();
        match timeout {
            Some(timeout) => waiter.wait_timeout(timeout, format!("batch {}", self.inner.batch_id)).await,
            None => waiter.wait().await,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.inner.completion.is_settled()
    }

    /// 尽力取消所有成员（忽略单个失败），然后释放
    pub async fn cancel(&self) {
        let members: Vec<(String, TaskHandle)> = lock(&self.inner.book)
            .members
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect();

        // 停止记录，避免成员释放被当作失败
        if let Some(monitor) = lock(&self.inner.monitor).take() {
            monitor.abort();
        }

        for (name, handle) in members {
            let settled = handle.is_settled() || handle.status().state.is_terminal();
            if settled {
                continue;
            }
            if let Err(error) = handle.cancel().await {
                tracing::debug!(task = %name, error = %error, "Ignoring member cancel failure");
            }
        }

        self.dispose();
    }

    /// 释放所有成员并清空记录；未结算的批量结果以 `Disposed` 拒绝
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(monitor) = lock(&self.inner.monitor).take() {
            monitor.abort();
        }

        let members = {
            let mut book = lock(&self.inner.book);
            book.results.clear();
            book.errors.clear();
            std::mem::take(&mut book.members)
        };
        for handle in members.values() {
            handle.dispose();
        }

        *lock(&self.inner.listeners) = Listeners::default();
        self.inner.completion.reject(ClientError::Disposed);
        tracing::debug!(batch_id = %self.inner.batch_id, "Batch handle disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::handles::test_support::StubTaskApi;
    use crate::application::ports::PushChannelPort;
    use crate::infrastructure::events::PushHub;
    use serde_json::json;

    fn batch(hub: &PushHub, api: Arc<StubTaskApi>, names: &[(&str, &str)]) -> BatchHandle {
        let members = names
            .iter()
            .map(|(name, task_id)| {
                (name.to_string(), TaskHandle::new(*task_id, api.clone(), hub as &dyn PushChannelPort))
            })
            .collect();
        BatchHandle::new("b1", members).unwrap()
    }

    #[tokio::test]
    async fn test_mixed_outcome_settles_failed_after_all_members() {
        let hub = PushHub::new();
        let api = Arc::new(StubTaskApi::default().with_result("ta"));
        let handle = batch(&hub, api, &[("A", "ta"), ("B", "tb")]);

        hub.publish_failed("tb", "invalid prompt");
        // B 已失败但 A 未结束，批量不能结算
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_settled());
        assert_eq!(handle.progress().failed, 1);
        assert_eq!(handle.progress().completed, 0);

        hub.publish_completed("ta");
        match handle.wait(Some(Duration::from_secs(2))).await.unwrap_err() {
            ClientError::BatchFailed(report) => {
                assert_eq!(report.batch_id, "b1");
                assert_eq!(report.results["A"].task_id, "ta");
                assert!(matches!(report.errors["B"], ClientError::TaskFailed { .. }));
                assert_eq!(report.failed_tasks(), vec!["B"]);
                assert_eq!(report.total(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_all_success_resolves_with_report() {
        let hub = PushHub::new();
        let api = Arc::new(StubTaskApi::default().with_result("ta").with_result("tb"));
        let handle = batch(&hub, api, &[("A", "ta"), ("B", "tb")]);

        let updates = Arc::new(Mutex::new(Vec::new()));
        let seen = updates.clone();
        handle.on_batch_progress(move |p| seen.lock().unwrap().push((p.completed, p.total)));

        hub.publish_progress("ta", json!({"progress": 50}));
        hub.publish_completed("ta");
        hub.publish_completed("tb");

        let report = handle.wait(Some(Duration::from_secs(2))).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.results.len(), 2);

        let updates = updates.lock().unwrap().clone();
        assert_eq!(updates.last(), Some(&(2, 2)));
    }

    #[tokio::test]
    async fn test_cancel_swallows_member_errors_and_disposes() {
        let hub = PushHub::new();
        let api = Arc::new(StubTaskApi::default());
        *api.cancel_error.lock().unwrap() = Some(ClientError::Network("reset".into()));
        let handle = batch(&hub, api.clone(), &[("A", "ta"), ("B", "tb")]);

        handle.cancel().await;

        assert_eq!(api.cancelled.lock().unwrap().len(), 2);
        assert!(matches!(handle.wait(None).await, Err(ClientError::Disposed)));
        assert!(handle.task_names().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_member_names_are_rejected() {
        let hub = PushHub::new();
        let api = Arc::new(StubTaskApi::default().with_result("ta").with_result("tb"));
        let first = TaskHandle::new("ta", api.clone(), &hub as &dyn PushChannelPort);
        let second = TaskHandle::new("tb", api, &hub as &dyn PushChannelPort);

        let Err(err) = BatchHandle::new(
            "b1",
            vec![("A".to_string(), first.clone()), ("A".to_string(), second.clone())],
        ) else {
            panic!("duplicate names must be rejected");
        };

        assert!(err.is_validation());
        assert!(err.to_string().contains("duplicate batch task name 'A'"));
        assert!(first.is_disposed());
        assert!(second.is_disposed());
    }

    #[tokio::test]
    async fn test_dispose_disposes_members() {
        let hub = PushHub::new();
        let api = Arc::new(StubTaskApi::default());
        let handle = batch(&hub, api, &[("A", "ta")]);
        let member = handle.task("A").unwrap();

        handle.dispose();
        handle.dispose();

        assert!(member.is_disposed());
        assert_eq!(handle.progress().total, 1);
        assert!(handle.progress().tasks.is_empty());
        assert!(matches!(handle.wait(None).await, Err(ClientError::Disposed)));
    }
}
