//! Configuration Loader
//!
//! 实现多源配置加载与合并逻辑
//!
//! 优先级（从高到低）：
//! 1. 环境变量
//! 2. 配置文件（funclient.toml）
//! 3. 默认值

use config::{Config, ConfigError as ConfigCrateError, Environment, File};
use std::path::Path;
use thiserror::Error;

use super::types::AppConfig;
use crate::application::error::ClientError;

/// 配置加载错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigCrateError> for ConfigError {
    fn from(err: ConfigCrateError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

/// 配置文件搜索路径
const CONFIG_FILE_NAMES: &[&str] = &["funclient", "funclient.local"];

/// 加载应用配置
///
/// 按优先级从高到低合并配置：
/// 1. 环境变量（前缀 `FUNCLIENT_`，层级分隔符 `__`）
/// 2. 配置文件（funclient.toml 或 funclient.local.toml）
/// 3. 默认值
///
/// # 环境变量示例
/// - `FUNCLIENT_CLIENT__BASE_URL=https://functions.example.com/api`
/// - `FUNCLIENT_PIPELINE__MAX_CONCURRENT=8`
/// - `FUNCLIENT_CACHE__TIER=sled`
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from_path(None)
}

/// 从指定路径加载配置
///
/// # 参数
/// - `config_path` - 可选的配置文件路径，如果为 None 则使用默认搜索路径
pub fn load_config_from_path(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        builder = builder.add_source(File::from(path).required(true));
    } else {
        for name in CONFIG_FILE_NAMES {
            builder = builder.add_source(File::with_name(name).required(false));
        }
    }

    // 例如: FUNCLIENT_RETRY__MAX_RETRIES=5
    builder = builder.add_source(
        Environment::with_prefix("FUNCLIENT")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;

    // 缺省字段由 serde default 填充
    let app_config: AppConfig = config.try_deserialize().map_err(|e| {
        ConfigError::ParseError(format!("Failed to deserialize config: {}", e))
    })?;

    validate_config(&app_config)?;

    Ok(app_config)
}

/// 验证配置有效性
fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    if config.client.base_url.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "Base URL cannot be empty".to_string(),
        ));
    }

    if config.pipeline.max_concurrent == 0 {
        return Err(ConfigError::ValidationError(
            "max_concurrent must be at least 1".to_string(),
        ));
    }

    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        return Err(ConfigError::ValidationError(format!(
            "Retry base delay {}ms exceeds cap {}ms",
            config.retry.base_delay_ms, config.retry.max_delay_ms
        )));
    }

    if config.upload.chunk_size_bytes == 0 {
        return Err(ConfigError::ValidationError(
            "Upload chunk size cannot be 0".to_string(),
        ));
    }

    if config.cache.tier.is_persistent() && config.cache.path.is_none() {
        return Err(ConfigError::ValidationError(format!(
            "Cache tier '{}' requires cache.path",
            config.cache.tier.as_str()
        )));
    }

    Ok(())
}

/// 打印配置信息（用于启动时日志）
pub fn print_config(config: &AppConfig) {
    tracing::info!("=== Client Configuration ===");
    tracing::info!("Base URL: {}", config.client.base_url);
    tracing::info!("API Key: {}", if config.client.api_key.is_some() { "set" } else { "none" });
    tracing::info!(
        "Pipeline: max {} concurrent, {}ms timeout",
        config.pipeline.max_concurrent,
        config.pipeline.timeout_ms
    );
    tracing::info!(
        "Retry: {} retries, {}ms base, {}ms cap",
        config.retry.max_retries,
        config.retry.base_delay_ms,
        config.retry.max_delay_ms
    );
    tracing::info!("Cache Tier: {}", config.cache.tier.as_str());
    if let Some(path) = &config.cache.path {
        tracing::info!("Cache Path: {:?}", path);
    }
    tracing::info!("Offline Queue: {}", config.offline.enabled);
    if config.offline.enabled && config.offline.persistent {
        tracing::info!("Offline Store: {:?}", config.offline.db_path);
    }
    tracing::info!("Chunk Size: {} bytes", config.upload.chunk_size_bytes);
    tracing::info!("Log Level: {}", config.log.level);
    tracing::info!("============================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::cache::CacheTier;

    #[test]
    fn test_validation_passes_for_valid_config() {
        let config = AppConfig::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validation_error_for_empty_base_url() {
        let mut config = AppConfig::default();
        config.client.base_url = "  ".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validation_error_for_zero_concurrency() {
        let mut config = AppConfig::default();
        config.pipeline.max_concurrent = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validation_error_for_inverted_delays() {
        let mut config = AppConfig::default();
        config.retry.base_delay_ms = 60_000;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_persistent_tier_requires_path() {
        let mut config = AppConfig::default();
        config.cache.tier = CacheTier::Sled;
        assert!(validate_config(&config).is_err());
        config.cache.path = Some("data/cache.sled".into());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("funclient.toml");
        std::fs::write(
            &path,
            r#"
[client]
base_url = "https://functions.example.com/api"

[pipeline]
max_concurrent = 8

[cache]
tier = "sqlite"
path = "data/cache.db"
template_ttl_secs = 120
"#,
        )
        .unwrap();

        let config = load_config_from_path(Some(&path)).unwrap();
        assert_eq!(config.client.base_url, "https://functions.example.com/api");
        assert_eq!(config.pipeline.max_concurrent, 8);
        assert_eq!(config.pipeline.timeout_ms, 60_000);
        assert_eq!(config.cache.tier, CacheTier::Sqlite);
        assert_eq!(config.cache.template_ttl_secs, 120);
        assert_eq!(config.retry.max_retries, 3);
    }
}
