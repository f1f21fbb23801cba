//! Network Status Port - 网络连通性

use tokio::sync::watch;

/// Network Status Port
///
/// 既可轮询（`is_online`），也可订阅变化（`watch`）
pub trait NetworkStatusPort: Send + Sync {
    fn is_online(&self) -> bool;

    /// 订阅连通性变化，值为 true 表示在线
    fn watch(&self) -> watch::Receiver<bool>;
}
