//! In-Memory Offline Store
//!
//! 无持久化能力时的回退实现，进程退出后队列丢失

use async_trait::async_trait;
use std::sync::Mutex;

use crate::application::ports::{OfflineRequest, OfflineStoreError, OfflineStorePort};

/// 内存离线请求存储
#[derive(Default)]
pub struct MemoryOfflineStore {
    requests: Mutex<Vec<OfflineRequest>>,
}

impl MemoryOfflineStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OfflineRequest>> {
        self.requests.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl OfflineStorePort for MemoryOfflineStore {
    async fn load_all(&self) -> Result<Vec<OfflineRequest>, OfflineStoreError> {
        Ok(self.lock().clone())
    }

    async fn append(&self, request: &OfflineRequest) -> Result<(), OfflineStoreError> {
        self.lock().push(request.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), OfflineStoreError> {
        self.lock().retain(|r| r.id != id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), OfflineStoreError> {
        self.lock().clear();
        Ok(())
    }
}
