//! Configuration Types
//!
//! 定义所有配置结构体，以及到运行时选项的转换

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::application::client::{ClientOptions, DEFAULT_TEMPLATE_TTL};
use crate::application::error::DEFAULT_RETRYABLE_STATUSES;
use crate::infrastructure::adapters::ReqwestTransportConfig;
use crate::infrastructure::cache::CacheTier;
use crate::infrastructure::memory::DEFAULT_MAX_CACHE_BYTES;
use crate::infrastructure::pipeline::{PipelineConfig, RetryPolicy};
use crate::infrastructure::upload::{UploadMode, DEFAULT_CHUNK_SIZE};

/// 应用主配置
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// 执行服务连接
    #[serde(default)]
    pub client: ClientSettings,

    /// 请求管线
    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    /// 响应缓存
    #[serde(default)]
    pub cache: CacheSettings,

    /// 离线队列
    #[serde(default)]
    pub offline: OfflineSettings,

    #[serde(default)]
    pub upload: UploadSettings,

    /// 日志配置
    #[serde(default)]
    pub log: LogSettings,
}

impl AppConfig {
    /// 组装客户端选项
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            pipeline: self.pipeline.to_pipeline_config(),
            retry: self.retry.to_policy(),
            template_ttl: Duration::from_secs(self.cache.template_ttl_secs),
            offline_enabled: self.offline.enabled,
            chunk_size: self.upload.chunk_size_bytes,
        }
    }
}

/// 执行服务连接配置
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    /// 执行服务基础 URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token
    #[serde(default)]
    pub api_key: Option<String>,

    /// 建立连接超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// 健康探测间隔（秒），0 表示不探测
    #[serde(default)]
    pub health_probe_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            connect_timeout_secs: default_connect_timeout(),
            health_path: default_health_path(),
            health_probe_secs: 0,
        }
    }
}

impl ClientSettings {
    pub fn to_transport_config(&self) -> ReqwestTransportConfig {
        ReqwestTransportConfig {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            connect_timeout_secs: self.connect_timeout_secs,
            health_path: self.health_path.clone(),
        }
    }
}

/// 请求管线配置
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    /// 最大并发请求数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// 单次请求超时（毫秒）
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_timeout_ms() -> u64 {
    60_000
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl PipelineSettings {
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_concurrent: self.max_concurrent,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

/// 重试配置
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_retryable_statuses() -> Vec<u16> {
    DEFAULT_RETRYABLE_STATUSES.to_vec()
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_statuses(self.retryable_statuses.iter().copied())
    }
}

/// 响应缓存配置
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// memory / sled / sqlite
    #[serde(default)]
    pub tier: CacheTier,

    /// 持久化层级的存储路径
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// 字节预算；sled 层级为配额，0 表示不限制
    #[serde(default = "default_cache_max_bytes")]
    pub max_size_bytes: u64,

    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,

    /// 模板读取的缓存时间（秒）
    #[serde(default = "default_template_ttl")]
    pub template_ttl_secs: u64,
}

fn default_cache_max_bytes() -> u64 {
    DEFAULT_MAX_CACHE_BYTES
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_template_ttl() -> u64 {
    DEFAULT_TEMPLATE_TTL.as_secs()
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            tier: CacheTier::default(),
            path: None,
            max_size_bytes: default_cache_max_bytes(),
            default_ttl_secs: default_cache_ttl(),
            template_ttl_secs: default_template_ttl(),
        }
    }
}

/// 离线队列配置
#[derive(Debug, Clone, Deserialize)]
pub struct OfflineSettings {
    #[serde(default = "default_offline_enabled")]
    pub enabled: bool,

    /// 是否持久化到 SQLite，否则只保存在内存中
    #[serde(default = "default_offline_persistent")]
    pub persistent: bool,

    #[serde(default = "default_offline_db_path")]
    pub db_path: PathBuf,
}

fn default_offline_enabled() -> bool {
    true
}

fn default_offline_persistent() -> bool {
    true
}

fn default_offline_db_path() -> PathBuf {
    PathBuf::from("data/funclient.db")
}

impl Default for OfflineSettings {
    fn default() -> Self {
        Self {
            enabled: default_offline_enabled(),
            persistent: default_offline_persistent(),
            db_path: default_offline_db_path(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Deserialize)]
pub struct UploadSettings {
    /// 断点续传分片大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,

    /// 多文件上传方式
    #[serde(default)]
    pub mode: UploadMode,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size(),
            mode: UploadMode::default(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.client.base_url, "http://localhost:8080/api");
        assert_eq!(config.pipeline.max_concurrent, 5);
        assert_eq!(config.retry.retryable_statuses, vec![408, 429, 500, 502, 503, 504]);
        assert_eq!(config.cache.tier, CacheTier::Memory);
        assert_eq!(config.upload.chunk_size_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn test_client_options() {
        let mut config = AppConfig::default();
        config.pipeline.timeout_ms = 1500;
        config.retry.max_retries = 1;
        config.offline.enabled = false;

        let options = config.client_options();
        assert_eq!(options.pipeline.timeout, Duration::from_millis(1500));
        assert_eq!(options.retry.max_retries, 1);
        assert_eq!(options.template_ttl, Duration::from_secs(600));
        assert!(!options.offline_enabled);
    }

    #[test]
    fn test_transport_config() {
        let mut settings = ClientSettings::default();
        settings.api_key = Some("secret".to_string());
        let transport = settings.to_transport_config();
        assert_eq!(transport.api_key.as_deref(), Some("secret"));
        assert_eq!(transport.connect_timeout_secs, 10);
    }
}
