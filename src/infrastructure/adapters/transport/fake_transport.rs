//! Fake Transport - 用于测试的脚本化传输
//!
//! 按 "METHOD path" 路由返回预先排队的响应，记录所有调用并统计最大并发数，
//! 不访问网络

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::application::ports::{
    ApiRequest, ApiResponse, HttpMethod, HttpTransport, TransportError, UploadProgress,
};

type Scripted = Result<ApiResponse, TransportError>;

#[derive(Default)]
struct FakeState {
    /// 一次性响应，按顺序消费
    queued: HashMap<String, VecDeque<Scripted>>,
    /// 队列耗尽后的固定响应
    fallback: HashMap<String, Scripted>,
    calls: Vec<ApiRequest>,
    delay: Duration,
}

/// Fake Transport
pub struct FakeTransport {
    state: Mutex<FakeState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    healthy: AtomicBool,
}

fn route(method: HttpMethod, path: &str) -> String {
    format!("{} {}", method, path)
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 追加一次性响应
    pub fn enqueue(&self, method: HttpMethod, path: &str, result: Scripted) {
        self.lock()
            .queued
            .entry(route(method, path))
            .or_default()
            .push_back(result);
    }

    /// 追加一次性 JSON 响应
    pub fn enqueue_json(&self, method: HttpMethod, path: &str, status: u16, body: Value) {
        self.enqueue(method, path, Ok(ApiResponse::json_value(status, &body)));
    }

    /// 设置固定响应
    pub fn always(&self, method: HttpMethod, path: &str, result: Scripted) {
        self.lock().fallback.insert(route(method, path), result);
    }

    pub fn always_json(&self, method: HttpMethod, path: &str, status: u16, body: Value) {
        self.always(method, path, Ok(ApiResponse::json_value(status, &body)));
    }

    /// 每次调用的模拟延迟
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// 指定路由的调用次数
    pub fn calls_to(&self, method: HttpMethod, path: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .count()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_result(&self, request: &ApiRequest) -> Scripted {
        let key = route(request.method, &request.path);
        let mut state = self.lock();
        if let Some(result) = state.queued.get_mut(&key).and_then(|q| q.pop_front()) {
            return result;
        }
        state
            .fallback
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Ok(ApiResponse::new(404, format!("no route for {}", key))))
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let delay = {
            let mut state = self.lock();
            state.calls.push(request.clone());
            state.delay
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        tracing::debug!(method = %request.method, path = %request.path, "FakeTransport: scripted response");

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        // 模拟分两段发送文件内容
        if let (Some(form), Some(progress)) = (request.multipart_body(), &request.progress) {
            let total = form.file_bytes();
            progress(UploadProgress::new(total / 2, total));
            progress(UploadProgress::new(total, total));
        }

        let result = self.next_result(&request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
