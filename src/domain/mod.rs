//! Domain Layer - 领域层
//!
//! 包含两个上下文:
//! - Template Context: 函数模板、参数 schema 与校验
//! - Task Context: 任务提交、状态与结果

pub mod task;
pub mod template;

pub use task::{
    BatchTaskAck, BatchTaskSpec, SubmitBatchResponse, SubmitTaskResponse, TaskOutput,
    TaskPriority, TaskResult, TaskState, TaskStatus, TaskSubmission,
};
pub use template::{
    ParamType, ParameterSpec, QualityPreset, QualityTier, ResourceRequirements, Template,
    TemplateFilter, Violation,
};
