//! Pipeline - 请求准入与重试

mod limiter;
mod retry;

pub use limiter::{PipelineConfig, PipelinePermit, RequestPipeline};
pub use retry::{RetryPolicy, DEFAULT_RETRYABLE_STATUSES};
