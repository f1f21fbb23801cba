//! Network Monitor - 连通性状态
//!
//! 可轮询也可订阅的连通性提供者。状态由调用方设置，
//! 或由后台健康探测根据传输层的 `health_check` 更新。

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::application::ports::{HttpTransport, NetworkStatusPort};

/// 网络状态监视器
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// 更新状态，只有真正变化时才通知订阅者
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });

        if changed {
            if online {
                tracing::info!("Network connectivity restored");
            } else {
                tracing::warn!("Network connectivity lost");
            }
        }
    }

    /// 启动后台健康探测
    ///
    /// 监视器被释放后探测任务自动退出
    pub fn spawn_health_probe(
        self: &Arc<Self>,
        transport: Arc<dyn HttpTransport>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let healthy = transport.health_check().await;
                match monitor.upgrade() {
                    Some(monitor) => monitor.set_online(healthy),
                    None => break,
                }
            }

            tracing::debug!("Network health probe stopped");
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::online()
    }
}

impl NetworkStatusPort for NetworkMonitor {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::adapters::FakeTransport;

    #[tokio::test]
    async fn test_watch_sees_transitions() {
        let monitor = NetworkMonitor::offline();
        let mut rx = monitor.watch();
        assert!(!monitor.is_online());

        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        // 相同状态不触发通知
        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_health_probe_updates_status() {
        let monitor = NetworkMonitor::online().arc();
        let transport = Arc::new(FakeTransport::new());
        transport.set_healthy(false);

        let mut rx = monitor.watch();
        let probe = monitor.spawn_health_probe(transport.clone(), Duration::from_millis(10));

        rx.changed().await.unwrap();
        assert!(!monitor.is_online());

        transport.set_healthy(true);
        rx.changed().await.unwrap();
        assert!(monitor.is_online());

        probe.abort();
    }
}
