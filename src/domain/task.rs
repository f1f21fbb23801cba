//! Task Context - 任务提交、状态与结果

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::template::QualityTier;

/// 任务优先级
///
/// 仅作为远端调度器的提示，客户端管线不按优先级排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// 任务生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// 已提交，等待调度
    Pending,
    /// 在远端队列中
    Queued,
    /// 正在执行
    Running,
    /// 收到进度更新
    Progress,
    /// 执行完成
    Completed,
    /// 执行失败
    Failed,
    /// 已取消
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Progress => "progress",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

/// 任务提交（发送后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub template_id: String,
    pub inputs: Map<String, Value>,
    pub quality: QualityTier,
    pub priority: TaskPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// 提交响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: String,
    #[serde(default = "default_submitted_state")]
    pub status: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,
}

fn default_submitted_state() -> TaskState {
    TaskState::Pending
}

/// 任务状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    #[serde(alias = "status")]
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    pub fn pending(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            state: TaskState::Pending,
            stage: None,
            progress: None,
            message: None,
            eta_seconds: None,
            queue_position: None,
            created_at: Some(Utc::now()),
            updated_at: None,
        }
    }
}

/// 单个输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    #[serde(rename = "type", default = "default_output_type")]
    pub output_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// 文件类输出下载后的内容，下载失败时为空
    #[serde(skip)]
    pub data: Option<Vec<u8>>,
}

fn default_output_type() -> String {
    "value".to_string()
}

impl TaskOutput {
    pub fn is_file(&self) -> bool {
        self.output_type == "file" && self.url.is_some()
    }
}

/// 任务结果（终态时创建一次）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    #[serde(alias = "status")]
    pub state: TaskState,
    #[serde(default)]
    pub outputs: BTreeMap<String, TaskOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// 批量提交中的单个任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTaskSpec {
    /// 调用方指定的任务名，服务端响应需原样回传
    pub name: String,
    pub template_id: String,
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
}

/// 批量提交请求体中的单个任务
#[derive(Debug, Clone, Serialize)]
pub(crate) struct BatchTaskBody {
    pub name: String,
    pub template_id: String,
    pub inputs: Map<String, Value>,
    pub quality: QualityTier,
    pub priority: TaskPriority,
}

/// 批量提交响应中的单个任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTaskAck {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskState>,
}

/// 批量提交响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitBatchResponse {
    pub batch_id: String,
    pub tasks: Vec<BatchTaskAck>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Progress.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
    }

    #[test]
    fn test_status_accepts_status_alias() {
        let status: TaskStatus = serde_json::from_value(json!({
            "task_id": "t1",
            "status": "running",
            "progress": 42.5
        }))
        .unwrap();
        assert_eq!(status.state, TaskState::Running);
        assert_eq!(status.progress, Some(42.5));
    }

    #[test]
    fn test_result_file_outputs() {
        let result: TaskResult = serde_json::from_value(json!({
            "task_id": "t1",
            "state": "completed",
            "outputs": {
                "image": {"type": "file", "url": "/files/out.png", "mime_type": "image/png"},
                "score": {"type": "value", "value": 0.93}
            },
            "worker_id": "gpu-7"
        }))
        .unwrap();
        assert!(result.outputs["image"].is_file());
        assert!(!result.outputs["score"].is_file());
        assert_eq!(result.outputs["image"].data, None);
    }
}
