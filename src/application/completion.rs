//! Completion - 单次结算的完成结果
//!
//! 基于 watch 通道：只有第一次 `settle` 生效，之后的结算被忽略。
//! 任意多个等待方都能读到同一个结果。

use std::time::Duration;
use tokio::sync::watch;

use super::error::ClientError;

type Outcome<T> = Option<Result<T, ClientError>>;

/// 完成结果的写端
pub struct Completion<T> {
    tx: watch::Sender<Outcome<T>>,
}

impl<T: Clone + Send + Sync + 'static> Completion<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// 结算；已结算时返回 false
    pub fn settle(&self, outcome: Result<T, ClientError>) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = outcome.take();
            true
        })
    }

    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: ClientError) -> bool {
        self.settle(Err(error))
    }

    pub fn is_settled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// 已结算时返回结果副本
    pub fn peek(&self) -> Option<Result<T, ClientError>> {
        self.tx.borrow().clone()
    }

    pub fn waiter(&self) -> CompletionWaiter<T> {
        CompletionWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// 完成结果的读端
#[derive(Clone)]
pub struct CompletionWaiter<T> {
    rx: watch::Receiver<Outcome<T>>,
}

impl<T: Clone + Send + Sync + 'static> CompletionWaiter<T> {
    /// 等待结算
    ///
    /// 写端在结算前被丢弃时返回 `Disposed`
    pub async fn wait(mut self) -> Result<T, ClientError> {
        loop {
            if let Some(outcome) = self.rx.borrow_and_update().clone() {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                return self
                    .rx
                    .borrow()
                    .clone()
                    .unwrap_or(Err(ClientError::Disposed));
            }
        }
    }

    /// 带超时等待
    pub async fn wait_timeout(
        self,
        timeout: Duration,
        target: impl Into<String>,
    ) -> Result<T, ClientError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ClientError::WaitTimeout {
                target: target.into(),
                waited: timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settles_exactly_once() {
        let completion: Completion<u32> = Completion::new();
        let waiter = completion.waiter();

        assert!(completion.resolve(1));
        assert!(!completion.resolve(2));
        assert!(!completion.reject(ClientError::Disposed));

        assert_eq!(waiter.clone().wait().await.unwrap(), 1);
        assert_eq!(waiter.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_waiter_created_before_settle() {
        let completion: Completion<&'static str> = Completion::new();
        let waiter = completion.waiter();
        let join = tokio::spawn(waiter.wait());
        tokio::task::yield_now().await;
        completion.reject(ClientError::Aborted);
        assert!(matches!(join.await.unwrap(), Err(ClientError::Aborted)));
    }

    #[tokio::test]
    async fn test_dropped_writer_reports_disposed() {
        let completion: Completion<u32> = Completion::new();
        let waiter = completion.waiter();
        drop(completion);
        assert!(matches!(waiter.wait().await, Err(ClientError::Disposed)));
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let completion: Completion<u32> = Completion::new();
        let err = completion
            .waiter()
            .wait_timeout(Duration::from_millis(20), "task t1")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::WaitTimeout { .. }));
        assert!(!completion.is_settled());
    }
}
