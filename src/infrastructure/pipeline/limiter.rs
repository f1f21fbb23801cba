//! Request Pipeline - 并发限制
//!
//! 最多 K 个请求同时在途，多余的按到达顺序排队（tokio Semaphore 为公平 FIFO）。
//! 不按任务优先级排序。每次传输调用都有独立超时。

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::application::error::ClientError;
use crate::application::ports::TransportError;

/// 管线配置
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// 最大并发请求数
    pub max_concurrent: usize,
    /// 单次请求超时
    pub timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

/// 请求管线
pub struct RequestPipeline {
    semaphore: Semaphore,
    config: PipelineConfig,
    in_flight: AtomicUsize,
    queued: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// 在途许可，drop 时释放槽位
pub struct PipelinePermit<'a> {
    _permit: SemaphorePermit<'a>,
    pipeline: &'a RequestPipeline,
}

impl Drop for PipelinePermit<'_> {
    fn drop(&mut self) {
        self.pipeline.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct QueuedGuard<'a>(&'a AtomicUsize);

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RequestPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            semaphore: Semaphore::new(max_concurrent),
            config: PipelineConfig {
                max_concurrent,
                ..config
            },
            in_flight: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// 等待空闲槽位
    ///
    /// 管线关闭后返回 `Disposed`
    pub async fn admit(&self) -> Result<PipelinePermit<'_>, ClientError> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let guard = QueuedGuard(&self.queued);
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ClientError::Disposed)?;
        drop(guard);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        Ok(PipelinePermit {
            _permit: permit,
            pipeline: self,
        })
    }

    /// 在超时内执行一次传输调用
    ///
    /// 超时会丢弃（中止）传输 future 并返回 `Timeout`
    pub async fn timed<T, Fut>(&self, call: Fut) -> Result<T, ClientError>
    where
        Fut: Future<Output = Result<T, TransportError>>,
    {
        match tokio::time::timeout(self.config.timeout, call).await {
            Ok(result) => result.map_err(ClientError::from),
            Err(_) => {
                tracing::debug!(timeout_ms = self.config.timeout.as_millis() as u64, "Request timed out");
                Err(ClientError::Timeout)
            }
        }
    }

    /// 获取槽位后执行
    pub async fn run<T, F, Fut>(&self, operation: F) -> Result<T, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let _permit = self.admit().await?;
        operation().await
    }

    /// 关闭管线，排队中和后续的请求都会失败
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// 观察到的最大在途数
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn pipeline(max_concurrent: usize, timeout_ms: u64) -> Arc<RequestPipeline> {
        Arc::new(RequestPipeline::new(PipelineConfig {
            max_concurrent,
            timeout: Duration::from_millis(timeout_ms),
        }))
    }

    #[tokio::test]
    async fn test_never_exceeds_limit() {
        let pipeline = pipeline(3, 1000);
        let mut joins = Vec::new();

        for _ in 0..20 {
            let pipeline = pipeline.clone();
            joins.push(tokio::spawn(async move {
                pipeline
                    .run(|| async {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok::<_, ClientError>(())
                    })
                    .await
            }));
        }
        for join in joins {
            join.await.unwrap().unwrap();
        }

        assert!(pipeline.peak_in_flight() <= 3);
        assert_eq!(pipeline.peak_in_flight(), 3);
        assert_eq!(pipeline.in_flight(), 0);
        assert_eq!(pipeline.queued(), 0);
    }

    #[tokio::test]
    async fn test_admission_is_fifo() {
        let pipeline = pipeline(1, 1000);
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = pipeline.admit().await.unwrap();
        let mut joins = Vec::new();
        for i in 0..5 {
            let queued = pipeline.clone();
            let order = order.clone();
            joins.push(tokio::spawn(async move {
                let _permit = queued.admit().await.unwrap();
                order.lock().await.push(i);
            }));
            // 保证按顺序进入等待队列
            while pipeline.queued() < i + 1 {
                tokio::task::yield_now().await;
            }
        }
        drop(first);
        for join in joins {
            join.await.unwrap();
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_timeout_frees_slot() {
        let pipeline = pipeline(1, 20);

        let result: Result<(), ClientError> = pipeline
            .run(|| {
                pipeline.timed(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<(), TransportError>(())
                })
            })
            .await;
        assert!(matches!(result, Err(ClientError::Timeout)));

        let next = pipeline.run(|| async { Ok::<_, ClientError>(7) }).await;
        assert_eq!(next.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_closed_pipeline_rejects() {
        let pipeline = pipeline(1, 1000);
        pipeline.close();
        assert!(matches!(pipeline.admit().await, Err(ClientError::Disposed)));
    }
}
