//! Retry Policy - 失败重试与指数退避

use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

pub use crate::application::error::DEFAULT_RETRYABLE_STATUSES;
use crate::application::error::ClientError;

/// 抖动比例 (±25%)
const JITTER_RATIO: f64 = 0.25;

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数（总尝试次数 = max_retries + 1）
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retryable_statuses: HashSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// 不重试
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    /// 判断错误是否可重试
    ///
    /// 网络失败、超时、以及状态码在可重试集合中的服务端错误
    pub fn is_retryable(&self, error: &ClientError) -> bool {
        match error {
            ClientError::Network(_) | ClientError::Timeout => true,
            ClientError::Server { status, .. } => self.retryable_statuses.contains(status),
            _ => false,
        }
    }

    /// 未加抖动的退避时间 `min(base * 2^attempt, cap)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// 给定抖动系数（-1.0..=1.0）计算退避时间
    pub fn backoff_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let base = self.backoff(attempt).as_secs_f64();
        let factor = 1.0 + JITTER_RATIO * jitter.clamp(-1.0, 1.0);
        Duration::from_secs_f64((base * factor).max(0.0))
    }

    /// 第 attempt 次失败后的等待时间（带随机抖动）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(-1.0..=1.0);
        self.backoff_with_jitter(attempt, jitter)
    }

    /// 执行操作，失败时按策略重试
    ///
    /// 重试耗尽后原样返回最后一次错误
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, ClientError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= self.max_retries || !self.is_retryable(&error) {
                        return Err(error);
                    }

                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        request = %label,
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
