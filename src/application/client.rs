//! Functions Client - 客户端编排入口
//!
//! 所有网络调用都经过 `request()`：
//! 离线拦截 → 管线准入 → 重试 → 带超时的传输调用 → 错误分类。
//!
//! 客户端独占自己的管线、缓存与离线队列；任务句柄交给调用方自行释放。

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::application::error::ClientError;
use crate::application::handles::{check_unique_names, BatchHandle, TaskApi, TaskHandle};
use crate::application::ports::{
    ApiExecutor, ApiRequest, ApiResponse, CacheStats, HttpTransport, NetworkStatusPort,
    OfflineStorePort, PushChannelPort,
};
use crate::domain::{
    BatchTaskSpec, QualityTier, SubmitBatchResponse, SubmitTaskResponse, TaskPriority,
    TaskResult, TaskStatus, TaskSubmission, Template, TemplateFilter, Violation,
};
use crate::domain::task::BatchTaskBody;
use crate::infrastructure::cache::{ResponseCache, DEFAULT_CACHE_TTL};
use crate::infrastructure::events::PushHub;
use crate::infrastructure::memory::{MemoryOfflineStore, DEFAULT_MAX_CACHE_BYTES};
use crate::infrastructure::network::NetworkMonitor;
use crate::infrastructure::offline::{DrainReport, OfflineQueue};
use crate::infrastructure::pipeline::{PipelineConfig, RequestPipeline, RetryPolicy};
use crate::infrastructure::upload::{Uploader, DEFAULT_CHUNK_SIZE};

const TEMPLATES_PATH: &str = "/functions/templates";
const TASKS_PATH: &str = "/functions/tasks";
const BATCHES_PATH: &str = "/functions/batches";

/// 模板读取的默认缓存时间
pub const DEFAULT_TEMPLATE_TTL: Duration = Duration::from_secs(600);

/// 客户端选项
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub pipeline: PipelineConfig,
    pub retry: RetryPolicy,
    pub template_ttl: Duration,
    /// 断网时是否排队等待重连
    pub offline_enabled: bool,
    pub chunk_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            retry: RetryPolicy::default(),
            template_ttl: DEFAULT_TEMPLATE_TTL,
            offline_enabled: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// 单任务提交选项
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// 粗粒度质量标签，如 "fast" / "balanced" / "best"
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// 批量提交选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    pub parallel: bool,
    pub stop_on_error: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            stop_on_error: false,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TemplateList {
    Wrapped { templates: Vec<Template> },
    Bare(Vec<Template>),
}

impl TemplateList {
    fn into_vec(self) -> Vec<Template> {
        match self {
            TemplateList::Wrapped { templates } => templates,
            TemplateList::Bare(templates) => templates,
        }
    }
}

fn resolve_quality(label: Option<&str>) -> Result<QualityTier, ClientError> {
    match label {
        None => Ok(QualityTier::default()),
        Some(label) => QualityTier::from_label(label).ok_or_else(|| {
            ClientError::validation(vec![Violation::UnknownQuality {
                label: label.to_string(),
            }])
        }),
    }
}

/// 非 2xx 响应转为 `Server` 错误
fn classify(response: ApiResponse) -> Result<ApiResponse, ClientError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(ClientError::server(
            response.status,
            response.status_text.clone(),
            response.text(),
        ))
    }
}

/// 客户端构建器
pub struct FunctionsClientBuilder {
    transport: Arc<dyn HttpTransport>,
    push: Option<Arc<dyn PushChannelPort>>,
    network: Option<Arc<dyn NetworkStatusPort>>,
    cache: Option<ResponseCache>,
    offline_store: Option<Arc<dyn OfflineStorePort>>,
    options: ClientOptions,
}

impl FunctionsClientBuilder {
    pub fn push_channel(mut self, push: Arc<dyn PushChannelPort>) -> Self {
        self.push = Some(push);
        self
    }

    pub fn network(mut self, network: Arc<dyn NetworkStatusPort>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn offline_store(mut self, store: Arc<dyn OfflineStorePort>) -> Self {
        self.offline_store = Some(store);
        self
    }

    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// 构建客户端，重新加载离线队列并开始监听网络恢复
    pub async fn build(self) -> Result<FunctionsClient, ClientError> {
        let options = self.options;
        let network = self
            .network
            .unwrap_or_else(|| NetworkMonitor::online().arc());
        let store = self
            .offline_store
            .unwrap_or_else(|| Arc::new(MemoryOfflineStore::new()));
        let offline = OfflineQueue::load(store, options.retry.clone()).await?;

        let inner = Arc::new(ClientInner {
            transport: self.transport,
            push: self.push.unwrap_or_else(|| PushHub::new().arc()),
            cache: self
                .cache
                .unwrap_or_else(|| ResponseCache::in_memory(DEFAULT_MAX_CACHE_BYTES, DEFAULT_CACHE_TTL)),
            pipeline: RequestPipeline::new(options.pipeline.clone()),
            retry: options.retry.clone(),
            offline,
            replay_kick: Arc::new(Notify::new()),
            template_keys: Mutex::new(HashSet::new()),
            watcher: Mutex::new(None),
            disposed: AtomicBool::new(false),
            network,
            options,
        });

        // 首轮检查会回放从存储恢复的请求
        let watcher = ClientInner::spawn_replay_worker(&inner);
        *lock(&inner.watcher) = Some(watcher);

        tracing::info!(
            cache_tier = inner.cache.tier(),
            max_concurrent = inner.pipeline.config().max_concurrent,
            offline_enabled = inner.options.offline_enabled,
            "Functions client built"
        );

        Ok(FunctionsClient { inner })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ClientInner {
    transport: Arc<dyn HttpTransport>,
    push: Arc<dyn PushChannelPort>,
    network: Arc<dyn NetworkStatusPort>,
    cache: ResponseCache,
    pipeline: RequestPipeline,
    retry: RetryPolicy,
    offline: OfflineQueue,
    /// 入队后唤醒回放任务
    replay_kick: Arc<Notify>,
    options: ClientOptions,
    /// 已写入的模板缓存键
    template_keys: Mutex<HashSet<String>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

/// 跳过离线拦截的执行器，用于回放离线队列
struct OnlineExecutor<'a>(&'a ClientInner);

#[async_trait]
impl ApiExecutor for OnlineExecutor<'_> {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        self.0.execute_online(request).await
    }
}

impl ClientInner {
    /// 回放任务：在线且队列非空时回放
    ///
    /// 唤醒来源为网络状态变化、入队通知，以及回放停在可重试失败后的退避计时。
    fn spawn_replay_worker(inner: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(inner);
        let mut rx = inner.network.watch();
        let kick = inner.replay_kick.clone();
        tokio::spawn(async move {
            let mut stalls: u32 = 0;
            loop {
                let backoff = {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    if inner.network.is_online() && !inner.offline.is_empty() {
                        let report = inner.replay_offline().await;
                        if report.remaining > 0 && inner.network.is_online() {
                            let delay = inner.retry.delay_for(stalls);
                            stalls = stalls.saturating_add(1);
                            tracing::debug!(
                                remaining = report.remaining,
                                delay_ms = delay.as_millis() as u64,
                                "Offline replay stalled, retrying later"
                            );
                            Some(delay)
                        } else {
                            stalls = 0;
                            None
                        }
                    } else {
                        stalls = 0;
                        None
                    }
                };

                // 等待期间只持有 Weak，客户端可以正常释放
                let sleep = async {
                    match backoff {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        rx.borrow_and_update();
                    }
                    _ = kick.notified() => {}
                    _ = sleep => {}
                }
            }
        })
    }

    async fn replay_offline(&self) -> DrainReport {
        let report = self.offline.drain(&OnlineExecutor(self)).await;
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

    async fn request(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ClientError::Disposed);
        }

        // 队列非空时新请求也要排在后面，保证回放顺序
        if self.options.offline_enabled && (!self.network.is_online() || !self.offline.is_empty()) {
            let ticket = self.offline.enqueue(request).await;
            self.replay_kick.notify_one();
            if self.disposed.load(Ordering::SeqCst) {
                self.offline.release_waiters();
            }
            return ticket.wait().await;
        }

        self.execute_online(request).await
    }

    async fn execute_online(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let _permit = self.pipeline.admit().await?;
        let label = format!("{} {}", request.method, request.path);

        self.retry
            .run(&label, |attempt| {
                let request = request.clone();
                async move {
                    if attempt > 0 {
                        tracing::debug!(request = %request.path, attempt, "Retrying request");
                    }
                    let response = self.pipeline.timed(self.transport.execute(request)).await?;
                    classify(response)
                }
            })
            .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ClientError> {
        let response = self.request(request).await?;
        Ok(response.json()?)
    }

    async fn cached<T>(&self, key: String, request: ApiRequest) -> Result<T, ClientError>
    where
        T: serde::de::DeserializeOwned + Serialize,
    {
        if let Some(value) = self.cache.get::<T>(&key).await {
            return Ok(value);
        }
        let value: T = self.get_json(request).await?;
        self.cache.set(&key, &value, Some(self.options.template_ttl)).await;
        lock(&self.template_keys).insert(key);
        Ok(value)
    }

    async fn list_templates(&self, filter: &TemplateFilter) -> Result<Vec<Template>, ClientError> {
        let key = ResponseCache::key("list_templates", &serde_json::to_value(filter)?);
        let request = ApiRequest::get(TEMPLATES_PATH).query(filter.to_query());
        let list: Vec<Template> = match self.cache.get::<Vec<Template>>(&key).await {
            Some(list) => list,
            None => {
                let list = self.get_json::<TemplateList>(request).await?.into_vec();
                self.cache.set(&key, &list, Some(self.options.template_ttl)).await;
                lock(&self.template_keys).insert(key);
                list
            }
        };
        Ok(list)
    }

    async fn get_template(&self, template_id: &str) -> Result<Template, ClientError> {
        let key = ResponseCache::key("get_template", &json!({ "id": template_id }));
        self.cached(key, ApiRequest::get(format!("{}/{}", TEMPLATES_PATH, template_id)))
            .await
    }

    async fn validated_inputs(
        &self,
        template_id: &str,
        inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ClientError> {
        let template = self.get_template(template_id).await?;
        template.validate_inputs(inputs).map_err(|violations| {
            tracing::debug!(template_id, violations = violations.len(), "Input validation failed");
            ClientError::validation(violations)
        })
    }

    async fn fetch_status(&self, task_id: &str) -> Result<TaskStatus, ClientError> {
        self.get_json(ApiRequest::get(format!("{}/{}/status", TASKS_PATH, task_id)))
            .await
    }

    async fn fetch_result(&self, task_id: &str) -> Result<TaskResult, ClientError> {
        let mut result: TaskResult = self
            .get_json(ApiRequest::get(format!("{}/{}/result", TASKS_PATH, task_id)))
            .await?;

        let files: Vec<(String, String)> = result
            .outputs
            .iter()
            .filter(|(_, output)| output.is_file())
            .filter_map(|(name, output)| output.url.clone().map(|url| (name.clone(), url)))
            .collect();

        let downloads = files.into_iter().map(|(name, url)| async move {
            let outcome = self.request(ApiRequest::get(url.clone())).await;
            (name, url, outcome)
        });

        for (name, url, outcome) in join_all(downloads).await {
            match outcome {
                Ok(response) => {
                    if let Some(output) = result.outputs.get_mut(&name) {
                        output.data = Some(response.body);
                    }
                }
                Err(error) => {
                    tracing::warn!(task_id, output = %name, url = %url, error = %error, "Output download failed");
                }
            }
        }

        Ok(result)
    }

    async fn cancel(&self, task_id: &str) -> Result<(), ClientError> {
        self.request(ApiRequest::post(format!("{}/{}/cancel", TASKS_PATH, task_id)))
            .await?;
        tracing::info!(task_id, "Task cancel requested");
        Ok(())
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
    }
}

#[async_trait]
impl ApiExecutor for ClientInner {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        self.request(request).await
    }
}

#[async_trait]
impl TaskApi for ClientInner {
    async fn get_task_status(&self, task_id: &str) -> Result<TaskStatus, ClientError> {
        self.fetch_status(task_id).await
    }

    async fn get_task_result(&self, task_id: &str) -> Result<TaskResult, ClientError> {
        self.fetch_result(task_id).await
    }

    async fn cancel_task(&self, task_id: &str) -> Result<(), ClientError> {
        self.cancel(task_id).await
    }
}

/// 函数执行服务客户端
#[derive(Clone)]
pub struct FunctionsClient {
    inner: Arc<ClientInner>,
}

impl FunctionsClient {
    pub fn builder(transport: Arc<dyn HttpTransport>) -> FunctionsClientBuilder {
        FunctionsClientBuilder {
            transport,
            push: None,
            network: None,
            cache: None,
            offline_store: None,
            options: ClientOptions::default(),
        }
    }

    /// 发送任意请求（经过完整的请求路径）
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        self.inner.request(request).await
    }

    pub async fn list_templates(&self, filter: &TemplateFilter) -> Result<Vec<Template>, ClientError> {
        self.inner.list_templates(filter).await
    }

    pub async fn get_template(&self, template_id: &str) -> Result<Template, ClientError> {
        self.inner.get_template(template_id).await
    }

    /// 清除模板缓存
    pub async fn invalidate_templates(&self) {
        let keys: Vec<String> = lock(&self.inner.template_keys).drain().collect();
        for key in &keys {
            self.inner.cache.remove(key).await;
        }
        tracing::debug!(count = keys.len(), "Template cache invalidated");
    }

    /// 校验并提交任务，返回订阅了 `task.<id>` 的句柄
    pub async fn submit_task(
        &self,
        template_id: &str,
        inputs: Map<String, Value>,
        options: SubmitOptions,
    ) -> Result<TaskHandle, ClientError> {
        let inputs = self.inner.validated_inputs(template_id, &inputs).await?;
        let quality = resolve_quality(options.quality.as_deref())?;

        let submission = TaskSubmission {
            template_id: template_id.to_string(),
            inputs,
            quality,
            priority: options.priority,
            metadata: options.metadata,
        };
        let response: SubmitTaskResponse = self
            .inner
            .get_json(ApiRequest::post(TASKS_PATH).json(serde_json::to_value(&submission)?))
            .await?;

        tracing::info!(
            task_id = %response.task_id,
            template_id,
            quality = %quality,
            "Task submitted"
        );

        let mut status = TaskStatus::pending(response.task_id.clone());
        status.state = response.status;
        status.queue_position = response.queue_position;

        Ok(TaskHandle::with_status(
            status,
            self.inner.clone(),
            self.inner.push.as_ref(),
        ))
    }

    /// 校验并一次性提交多个任务
    ///
    /// 成员句柄优先按响应回传的任务名匹配，缺失时按位置匹配
    pub async fn submit_batch(
        &self,
        tasks: Vec<BatchTaskSpec>,
        options: BatchOptions,
    ) -> Result<BatchHandle, ClientError> {
        check_unique_names(tasks.iter().map(|task| task.name.as_str()))?;

        let mut bodies = Vec::with_capacity(tasks.len());
        for task in tasks {
            let inputs = self
                .inner
                .validated_inputs(&task.template_id, &task.inputs)
                .await
                .inspect_err(|_| tracing::debug!(task = %task.name, "Batch task rejected"))?;
            bodies.push(BatchTaskBody {
                quality: resolve_quality(task.quality.as_deref())?,
                name: task.name,
                template_id: task.template_id,
                inputs,
                priority: task.priority,
            });
        }

        let body = json!({
            "tasks": bodies,
            "parallel": options.parallel,
            "stop_on_error": options.stop_on_error,
        });
        let response: SubmitBatchResponse = self
            .inner
            .get_json(ApiRequest::post(BATCHES_PATH).json(body))
            .await?;

        let names: Vec<String> = bodies.into_iter().map(|b| b.name).collect();
        let known: HashSet<&str> = names.iter().map(String::as_str).collect();

        let mut members = Vec::with_capacity(response.tasks.len());
        for (position, ack) in response.tasks.iter().enumerate() {
            let name = match ack.name.as_deref() {
                Some(name) if known.contains(name) => name.to_string(),
                _ => names
                    .get(position)
                    .cloned()
                    .unwrap_or_else(|| ack.task_id.clone()),
            };
            let mut status = TaskStatus::pending(ack.task_id.clone());
            if let Some(state) = ack.status {
                status.state = state;
            }
            let handle = TaskHandle::with_status(status, self.inner.clone(), self.inner.push.as_ref());
            members.push((name, handle));
        }

        tracing::info!(batch_id = %response.batch_id, tasks = members.len(), "Batch submitted");
        BatchHandle::new(response.batch_id, members)
    }

    pub async fn get_task_status(&self, task_id: &str) -> Result<TaskStatus, ClientError> {
        self.inner.fetch_status(task_id).await
    }

    /// 拉取结果，并下载文件类输出
    pub async fn get_task_result(&self, task_id: &str) -> Result<TaskResult, ClientError> {
        self.inner.fetch_result(task_id).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<(), ClientError> {
        self.inner.cancel(task_id).await
    }

    pub fn upload(&self) -> Uploader {
        Uploader::new(self.inner.clone(), self.inner.options.chunk_size)
    }

    /// 立即回放离线队列
    pub async fn drain_offline(&self) -> DrainReport {
        self.inner.replay_offline().await
    }

    pub fn offline_len(&self) -> usize {
        self.inner.offline.len()
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats().await
    }

    pub fn in_flight(&self) -> usize {
        self.inner.pipeline.in_flight()
    }

    pub fn queued(&self) -> usize {
        self.inner.pipeline.queued()
    }

    pub fn push_channel(&self) -> Arc<dyn PushChannelPort> {
        self.inner.push.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// 关闭管线、清空缓存并停止回放任务；离线等待端以 `Disposed` 结束，已返回的句柄不受影响
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.pipeline.close();
        if let Some(watcher) = lock(&self.inner.watcher).take() {
            watcher.abort();
        }
        // 持久化的离线请求保留到下次会话回放
        self.inner.offline.release_waiters();
        self.inner.cache.clear().await;
        lock(&self.inner.template_keys).clear();
        tracing::info!("Functions client disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{HttpMethod, OfflineStorePort, TransportError};
    use crate::domain::TaskState;
    use crate::infrastructure::adapters::FakeTransport;
    use crate::infrastructure::persistence::{open_database, DatabaseConfig, SqliteOfflineStore};

    fn template_json() -> Value {
        json!({
            "id": "image-upscale",
            "name": "Image Upscale",
            "parameters": [
                {"name": "image", "type": "file", "required": true},
                {"name": "scale", "type": "integer", "default": 2, "minimum": 1, "maximum": 8}
            ]
        })
    }

    fn fast_options() -> ClientOptions {
        ClientOptions {
            retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            ..Default::default()
        }
    }

    async fn client(transport: &Arc<FakeTransport>) -> FunctionsClient {
        FunctionsClient::builder(transport.clone())
            .options(fast_options())
            .build()
            .await
            .unwrap()
    }

    fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_retries_network_failures_then_succeeds() {
        let transport = FakeTransport::new().arc();
        let path = "/functions/tasks/t1/status";
        transport.enqueue(HttpMethod::Get, path, Err(TransportError::Network("reset".into())));
        transport.enqueue(HttpMethod::Get, path, Err(TransportError::Network("reset".into())));
        transport.enqueue_json(HttpMethod::Get, path, 200, json!({"task_id": "t1", "status": "running"}));

        let client = client(&transport).await;
        let status = client.get_task_status("t1").await.unwrap();

        assert_eq!(status.state, TaskState::Running);
        assert_eq!(transport.calls_to(HttpMethod::Get, path), 3);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let transport = FakeTransport::new().arc();
        transport.always_json(HttpMethod::Post, "/functions/tasks/t1/cancel", 400, json!({"error": "bad"}));

        let client = client(&transport).await;
        let err = client.cancel_task("t1").await.unwrap_err();

        assert_eq!(err.status(), Some(400));
        assert_eq!(transport.calls_to(HttpMethod::Post, "/functions/tasks/t1/cancel"), 1);
    }

    #[tokio::test]
    async fn test_invalid_inputs_never_reach_the_network() {
        let transport = FakeTransport::new().arc();
        transport.always_json(HttpMethod::Get, "/functions/templates/image-upscale", 200, template_json());

        let client = client(&transport).await;
        let Err(err) = client
            .submit_task("image-upscale", inputs(json!({"scale": 4})), SubmitOptions::default())
            .await
        else {
            panic!("submission without the required image must fail");
        };

        assert!(err.is_validation());
        assert!(err.to_string().contains("image"));
        assert_eq!(transport.calls_to(HttpMethod::Post, TASKS_PATH), 0);
    }

    #[tokio::test]
    async fn test_submit_task_fills_defaults_and_maps_quality() {
        let transport = FakeTransport::new().arc();
        transport.always_json(HttpMethod::Get, "/functions/templates/image-upscale", 200, template_json());
        transport.enqueue_json(HttpMethod::Post, TASKS_PATH, 200, json!({"task_id": "t9", "status": "queued", "queue_position": 3}));

        let client = client(&transport).await;
        let handle = client
            .submit_task(
                "image-upscale",
                inputs(json!({"image": "file-1", "extra": true})),
                SubmitOptions {
                    quality: Some("best".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(handle.task_id(), "t9");
        assert_eq!(handle.status().state, TaskState::Queued);
        assert_eq!(handle.status().queue_position, Some(3));

        let calls = transport.calls();
        let body = calls.iter().find(|c| c.path == TASKS_PATH).unwrap().json_body().unwrap();
        assert_eq!(body["quality"], "ultra");
        assert_eq!(body["inputs"], json!({"image": "file-1", "scale": 2}));
        handle.dispose();
    }

    #[tokio::test]
    async fn test_template_reads_are_cached_and_invalidated() {
        let transport = FakeTransport::new().arc();
        transport.always_json(HttpMethod::Get, TEMPLATES_PATH, 200, json!({"templates": [template_json()]}));

        let client = client(&transport).await;
        let filter = TemplateFilter::default();
        assert_eq!(client.list_templates(&filter).await.unwrap().len(), 1);
        assert_eq!(client.list_templates(&filter).await.unwrap().len(), 1);
        assert_eq!(transport.calls_to(HttpMethod::Get, TEMPLATES_PATH), 1);

        client.invalidate_templates().await;
        client.list_templates(&filter).await.unwrap();
        assert_eq!(transport.calls_to(HttpMethod::Get, TEMPLATES_PATH), 2);
        assert_eq!(client.cache_stats().await.hit_count, 1);
    }

    #[tokio::test]
    async fn test_result_downloads_file_outputs() {
        let transport = FakeTransport::new().arc();
        transport.always_json(
            HttpMethod::Get,
            "/functions/tasks/t1/result",
            200,
            json!({
                "task_id": "t1",
                "state": "completed",
                "outputs": {
                    "image": {"type": "file", "url": "/files/out.png"},
                    "thumb": {"type": "file", "url": "/files/missing.png"},
                    "score": {"type": "value", "value": 0.9}
                }
            }),
        );
        transport.always(HttpMethod::Get, "/files/out.png", Ok(ApiResponse::new(200, vec![7u8, 8, 9])));

        let client = client(&transport).await;
        let result = client.get_task_result("t1").await.unwrap();

        assert_eq!(result.outputs["image"].data, Some(vec![7, 8, 9]));
        assert_eq!(result.outputs["thumb"].data, None);
        assert_eq!(result.outputs["score"].data, None);
    }

    #[tokio::test]
    async fn test_batch_matches_members_by_echoed_name() {
        let transport = FakeTransport::new().arc();
        transport.always_json(HttpMethod::Get, "/functions/templates/image-upscale", 200, template_json());
        transport.enqueue_json(
            HttpMethod::Post,
            BATCHES_PATH,
            200,
            json!({
                "batch_id": "b1",
                "tasks": [
                    {"task_id": "tb", "name": "second"},
                    {"task_id": "ta", "name": "first"}
                ]
            }),
        );

        let client = client(&transport).await;
        let spec = |name: &str| BatchTaskSpec {
            name: name.to_string(),
            template_id: "image-upscale".to_string(),
            inputs: inputs(json!({"image": "f"})),
            quality: None,
            priority: TaskPriority::Normal,
        };
        let batch = client
            .submit_batch(vec![spec("first"), spec("second")], BatchOptions::default())
            .await
            .unwrap();

        assert_eq!(batch.batch_id(), "b1");
        assert_eq!(batch.task("first").unwrap().task_id(), "ta");
        assert_eq!(batch.task("second").unwrap().task_id(), "tb");

        let calls = transport.calls();
        let body = calls.iter().find(|c| c.path == BATCHES_PATH).unwrap().json_body().unwrap();
        assert_eq!(body["parallel"], true);
        assert_eq!(body["tasks"][0]["inputs"]["scale"], 2);
        batch.dispose();
    }

    #[tokio::test]
    async fn test_batch_rejects_duplicate_names_before_network() {
        let transport = FakeTransport::new().arc();
        let client = client(&transport).await;
        let spec = |name: &str| BatchTaskSpec {
            name: name.to_string(),
            template_id: "image-upscale".to_string(),
            inputs: inputs(json!({"image": "f"})),
            quality: None,
            priority: TaskPriority::Normal,
        };

        let Err(err) = client
            .submit_batch(vec![spec("A"), spec("A")], BatchOptions::default())
            .await
        else {
            panic!("duplicate task names must be rejected");
        };

        assert!(matches!(
            &err,
            ClientError::Validation(v) if v == &vec![Violation::DuplicateTaskName { name: "A".into() }]
        ));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_request_survives_restart_and_replays() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConfig::new(dir.path().join("offline.db"));
        let transport = FakeTransport::new().arc();
        transport.always_json(HttpMethod::Post, "/functions/tasks/t1/cancel", 200, json!({}));

        {
            let store = Arc::new(SqliteOfflineStore::new(open_database(&db).await.unwrap()));
            let client = FunctionsClient::builder(transport.clone())
                .network(NetworkMonitor::offline().arc())
                .offline_store(store.clone())
                .options(fast_options())
                .build()
                .await
                .unwrap();

            let pending = {
                let client = client.clone();
                tokio::spawn(async move { client.cancel_task("t1").await })
            };
            while store.load_all().await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            pending.abort();
            client.dispose().await;
        }
        assert_eq!(transport.call_count(), 0);

        let pool = open_database(&db).await.unwrap();
        let network = NetworkMonitor::offline().arc();
        let client = FunctionsClient::builder(transport.clone())
            .network(network.clone())
            .offline_store(Arc::new(SqliteOfflineStore::new(pool)))
            .options(fast_options())
            .build()
            .await
            .unwrap();
        assert_eq!(client.offline_len(), 1);

        network.set_online(true);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while client.offline_len() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(client.offline_len(), 0);
        assert_eq!(transport.calls_to(HttpMethod::Post, "/functions/tasks/t1/cancel"), 1);
    }

    #[tokio::test]
    async fn test_offline_waiter_resolves_after_reconnect() {
        let transport = FakeTransport::new().arc();
        transport.always_json(HttpMethod::Get, "/functions/tasks/t1/status", 200, json!({"task_id": "t1", "status": "completed"}));
        let network = NetworkMonitor::offline().arc();
        let client = FunctionsClient::builder(transport.clone())
            .network(network.clone())
            .options(fast_options())
            .build()
            .await
            .unwrap();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.get_task_status("t1").await })
        };
        while client.offline_len() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(transport.call_count(), 0);

        network.set_online(true);
        let status = pending.await.unwrap().unwrap();
        assert_eq!(status.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_dispose_releases_offline_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteOfflineStore::new(
            open_database(&DatabaseConfig::new(dir.path().join("offline.db"))).await.unwrap(),
        ));
        let transport = FakeTransport::new().arc();
        let client = FunctionsClient::builder(transport.clone())
            .network(NetworkMonitor::offline().arc())
            .offline_store(store.clone())
            .options(fast_options())
            .build()
            .await
            .unwrap();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.get_task_status("t1").await })
        };
        while client.offline_len() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        client.dispose().await;

        let outcome = tokio::time::timeout(Duration::from_millis(500), pending)
            .await
            .expect("offline waiter must settle after dispose")
            .unwrap();
        assert!(matches!(outcome, Err(ClientError::Disposed)));
        assert_eq!(client.offline_len(), 1);
        assert_eq!(store.load_all().await.unwrap().len(), 1);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_replay_retries_and_keeps_order() {
        let transport = FakeTransport::new().arc();
        let cancel = "/functions/tasks/t1/cancel";
        let status = "/functions/tasks/t2/status";
        // 4 次尝试（含 3 次重试）全部 503，回放停在队首
        for _ in 0..4 {
            transport.enqueue_json(HttpMethod::Post, cancel, 503, json!({"error": "busy"}));
        }
        transport.enqueue_json(HttpMethod::Post, cancel, 200, json!({}));
        transport.always_json(HttpMethod::Get, status, 200, json!({"task_id": "t2", "status": "running"}));

        let network = NetworkMonitor::offline().arc();
        let client = FunctionsClient::builder(transport.clone())
            .network(network.clone())
            .options(fast_options())
            .build()
            .await
            .unwrap();

        let queued_cancel = {
            let client = client.clone();
            tokio::spawn(async move { client.cancel_task("t1").await })
        };
        while client.offline_len() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        network.set_online(true);
        let later = client.get_task_status("t2").await.unwrap();
        assert_eq!(later.state, TaskState::Running);

        let cancelled = tokio::time::timeout(Duration::from_secs(2), queued_cancel)
            .await
            .expect("queued cancel must settle while online")
            .unwrap();
        assert!(cancelled.is_ok());
        assert_eq!(client.offline_len(), 0);
        assert_eq!(transport.calls_to(HttpMethod::Post, cancel), 5);

        // 状态查询排在取消之后
        let paths: Vec<String> = transport.calls().iter().map(|c| c.path.clone()).collect();
        let last_cancel = paths.iter().rposition(|p| p == cancel).unwrap();
        let first_status = paths.iter().position(|p| p == status).unwrap();
        assert!(last_cancel < first_status);
    }

    #[tokio::test]
    async fn test_enqueue_after_reconnect_still_replays() {
        let transport = FakeTransport::new().arc();
        transport.always_json(HttpMethod::Post, "/functions/tasks/t1/cancel", 200, json!({}));
        let network = NetworkMonitor::offline().arc();
        let client = FunctionsClient::builder(transport.clone())
            .network(network.clone())
            .options(fast_options())
            .build()
            .await
            .unwrap();

        // 重连时队列为空，之后才有请求入队
        network.set_online(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let ticket = client
            .inner
            .offline
            .enqueue(ApiRequest::post("/functions/tasks/t1/cancel"))
            .await;
        client.inner.replay_kick.notify_one();

        let outcome = tokio::time::timeout(Duration::from_secs(2), ticket.wait())
            .await
            .expect("late enqueue must be replayed without another reconnect");
        assert!(outcome.is_ok());
        assert_eq!(client.offline_len(), 0);
    }

    #[tokio::test]
    async fn test_dispose_rejects_new_requests() {
        let transport = FakeTransport::new().arc();
        let client = client(&transport).await;
        client.dispose().await;
        client.dispose().await;

        assert!(client.is_disposed());
        assert!(matches!(client.get_task_status("t1").await, Err(ClientError::Disposed)));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_pipeline_limits_concurrency() {
        let transport = FakeTransport::new().arc();
        transport.set_delay(Duration::from_millis(20));
        transport.always_json(HttpMethod::Get, "/functions/tasks/t1/status", 200, json!({"task_id": "t1", "status": "running"}));

        let client = FunctionsClient::builder(transport.clone())
            .options(ClientOptions {
                pipeline: PipelineConfig {
                    max_concurrent: 2,
                    timeout: Duration::from_secs(5),
                },
                ..fast_options()
            })
            .build()
            .await
            .unwrap();

        let calls = (0..6).map(|_| client.get_task_status("t1"));
        let results = join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(transport.peak_in_flight(), 2);
    }
}
