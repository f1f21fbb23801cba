//! Handles - 任务与批量任务的生命周期句柄
//!
//! 句柄通过 `TaskApi` 回到客户端查询状态、拉取结果、取消任务，
//! 不直接依赖传输层。

mod batch_handle;
mod task_handle;

pub use batch_handle::{BatchHandle, BatchProgress, BatchReport};
pub(crate) use batch_handle::check_unique_names;
pub use task_handle::{next_transition, ProgressUpdate, TaskHandle, Transition};

use async_trait::async_trait;

use crate::application::error::ClientError;
use crate::domain::{TaskResult, TaskStatus};

/// 句柄回调客户端的任务接口
#[async_trait]
pub trait TaskApi: Send + Sync {
    async fn get_task_status(&self, task_id: &str) -> Result<TaskStatus, ClientError>;

    async fn get_task_result(&self, task_id: &str) -> Result<TaskResult, ClientError>;

    async fn cancel_task(&self, task_id: &str) -> Result<(), ClientError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::domain::TaskState;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    /// 内存中的任务接口桩
    #[derive(Default)]
    pub struct StubTaskApi {
        pub statuses: Mutex<HashMap<String, TaskStatus>>,
        pub results: Mutex<HashMap<String, Result<TaskResult, ClientError>>>,
        pub cancel_error: Mutex<Option<ClientError>>,
        pub cancelled: Mutex<Vec<String>>,
        pub result_calls: Mutex<Vec<String>>,
    }

    impl StubTaskApi {
        pub fn with_result(self, task_id: &str) -> Self {
            self.results
                .lock()
                .unwrap()
                .insert(task_id.to_string(), Ok(completed_result(task_id)));
            self
        }
    }

    pub fn completed_result(task_id: &str) -> TaskResult {
        TaskResult {
            task_id: task_id.to_string(),
            state: TaskState::Completed,
            outputs: BTreeMap::new(),
            started_at: None,
            completed_at: None,
            duration_ms: Some(1200),
            worker_id: Some("worker-1".to_string()),
        }
    }

    #[async_trait]
    impl TaskApi for StubTaskApi {
        async fn get_task_status(&self, task_id: &str) -> Result<TaskStatus, ClientError> {
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .get(task_id)
                .cloned()
                .unwrap_or_else(|| TaskStatus::pending(task_id)))
        }

        async fn get_task_result(&self, task_id: &str) -> Result<TaskResult, ClientError> {
            self.result_calls.lock().unwrap().push(task_id.to_string());
            self.results
                .lock()
                .unwrap()
                .get(task_id)
                .cloned()
                .unwrap_or_else(|| Err(ClientError::server(404, "Not Found", "no result")))
        }

        async fn cancel_task(&self, task_id: &str) -> Result<(), ClientError> {
            self.cancelled.lock().unwrap().push(task_id.to_string());
            match self.cancel_error.lock().unwrap().clone() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
    }
}
