//! Template Context - 函数模板与参数校验
//!
//! 模板由远端执行服务提供，客户端只读缓存。
//! 提交任务前使用类型化的参数 schema 校验输入，返回结构化的违规列表。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// 参数类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    /// 文件参数（通常是上传后返回的 file_id 或 URL）
    File,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::File => "file",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    /// 检查 JSON 值是否符合该类型
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            // 文件可以是 file_id 字符串，也可以是 {file_id, url} 对象
            ParamType::File => value.is_string() || value.is_object(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

/// 单个参数定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<Value>>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            default: None,
            description: None,
            minimum: None,
            maximum: None,
            allowed_values: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_range(mut self, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        self.minimum = minimum;
        self.maximum = maximum;
        self
    }

    pub fn with_allowed(mut self, values: Vec<Value>) -> Self {
        self.allowed_values = Some(values);
        self
    }
}

/// 资源需求
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub gpu: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_seconds: Option<u64>,
}

/// 质量预设
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityPreset {
    pub tier: QualityTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_seconds: Option<u64>,
}

/// 函数模板
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub quality_presets: Vec<QualityPreset>,
}

impl Template {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// 校验输入参数
    ///
    /// 成功时返回清洗后的输入：未知参数被丢弃，缺失的可选参数填充默认值。
    pub fn validate_inputs(&self, inputs: &Map<String, Value>) -> Result<Map<String, Value>, Vec<Violation>> {
        let mut violations = Vec::new();
        let mut sanitized = Map::new();

        for spec in &self.parameters {
            match inputs.get(&spec.name) {
                Some(Value::Null) | None => {
                    if let Some(default) = &spec.default {
                        sanitized.insert(spec.name.clone(), default.clone());
                    } else if spec.required {
                        violations.push(Violation::Missing {
                            parameter: spec.name.clone(),
                        });
                    }
                }
                Some(value) => match check_value(spec, value) {
                    Some(violation) => violations.push(violation),
                    None => {
                        sanitized.insert(spec.name.clone(), value.clone());
                    }
                },
            }
        }

        for name in inputs.keys() {
            if self.parameter(name).is_none() {
                tracing::debug!(template_id = %self.id, parameter = %name, "Dropping unknown parameter");
            }
        }

        if violations.is_empty() {
            Ok(sanitized)
        } else {
            Err(violations)
        }
    }
}

fn check_value(spec: &ParameterSpec, value: &Value) -> Option<Violation> {
    if !spec.param_type.accepts(value) {
        return Some(Violation::TypeMismatch {
            parameter: spec.name.clone(),
            expected: spec.param_type,
        });
    }

    if let Some(number) = value.as_f64() {
        let below = spec.minimum.map_or(false, |min| number < min);
        let above = spec.maximum.map_or(false, |max| number > max);
        if below || above {
            return Some(Violation::OutOfRange {
                parameter: spec.name.clone(),
                minimum: spec.minimum,
                maximum: spec.maximum,
            });
        }
    }

    if let Some(allowed) = &spec.allowed_values {
        if !allowed.contains(value) {
            return Some(Violation::NotAllowed {
                parameter: spec.name.clone(),
                value: value.clone(),
            });
        }
    }

    None
}

/// 参数校验违规项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// 缺少必填参数
    Missing { parameter: String },
    /// 类型不匹配
    TypeMismatch { parameter: String, expected: ParamType },
    /// 数值超出范围
    OutOfRange {
        parameter: String,
        minimum: Option<f64>,
        maximum: Option<f64>,
    },
    /// 不在允许的取值中
    NotAllowed { parameter: String, value: Value },
    /// 质量标签无法识别
    UnknownQuality { label: String },
    /// 批量任务名重复
    DuplicateTaskName { name: String },
}

impl Violation {
    pub fn parameter(&self) -> Option<&str> {
        match self {
            Violation::Missing { parameter }
            | Violation::TypeMismatch { parameter, .. }
            | Violation::OutOfRange { parameter, .. }
            | Violation::NotAllowed { parameter, .. } => Some(parameter),
            Violation::UnknownQuality { .. } | Violation::DuplicateTaskName { .. } => None,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Missing { parameter } => write!(f, "missing required parameter '{}'", parameter),
            Violation::TypeMismatch { parameter, expected } => {
                write!(f, "parameter '{}' must be of type {}", parameter, expected.as_str())
            }
            Violation::OutOfRange {
                parameter,
                minimum,
                maximum,
            } => write!(
                f,
                "parameter '{}' out of range [{}, {}]",
                parameter,
                minimum.map_or("-inf".to_string(), |v| v.to_string()),
                maximum.map_or("+inf".to_string(), |v| v.to_string())
            ),
            Violation::NotAllowed { parameter, value } => {
                write!(f, "parameter '{}' does not allow value {}", parameter, value)
            }
            Violation::UnknownQuality { label } => write!(f, "unknown quality label '{}'", label),
            Violation::DuplicateTaskName { name } => write!(f, "duplicate batch task name '{}'", name),
        }
    }
}

/// 执行服务的质量档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Draft,
    #[default]
    Standard,
    High,
    Ultra,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Draft => "draft",
            QualityTier::Standard => "standard",
            QualityTier::High => "high",
            QualityTier::Ultra => "ultra",
        }
    }

    /// 将粗粒度的质量标签映射到执行服务的档位词汇
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "draft" | "low" | "fast" | "preview" => Some(QualityTier::Draft),
            "standard" | "medium" | "normal" | "balanced" => Some(QualityTier::Standard),
            "high" | "quality" | "hq" => Some(QualityTier::High),
            "ultra" | "max" | "best" | "production" => Some(QualityTier::Ultra),
            _ => None,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 模板列表过滤条件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<bool>,
}

impl TemplateFilter {
    /// 转为查询参数，按键名排序
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if let Some(category) = &self.category {
            query.push(("category".to_string(), category.clone()));
        }
        if let Some(gpu) = self.gpu {
            query.push(("gpu".to_string(), gpu.to_string()));
        }
        if let Some(search) = &self.search {
            query.push(("search".to_string(), search.clone()));
        }
        query
    }
}
