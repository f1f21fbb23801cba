//! Reqwest Transport - 基于 reqwest 的 HTTP 传输
//!
//! 实现 HttpTransport trait。任意 HTTP 状态码都作为响应返回，不在这里重试。
//! multipart 文件部分以 64KiB 分片流式发送，并按已发送字节回调进度。

use async_trait::async_trait;
use futures_util::stream;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::application::ports::{
    canonical_reason, ApiRequest, ApiResponse, HttpMethod, HttpTransport, MultipartForm,
    ProgressCallback, RequestBody, TransportError, UploadProgress,
};

/// 流式上传的分片大小
const STREAM_SLICE_BYTES: usize = 64 * 1024;

/// Reqwest 传输配置
#[derive(Debug, Clone)]
pub struct ReqwestTransportConfig {
    /// 执行服务基础 URL
    pub base_url: String,
    /// Bearer token
    pub api_key: Option<String>,
    /// 建立连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 健康检查路径
    pub health_path: String,
}

impl Default for ReqwestTransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            api_key: None,
            connect_timeout_secs: 10,
            health_path: "/health".to_string(),
        }
    }
}

impl ReqwestTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

/// Reqwest HTTP 传输
pub struct ReqwestTransport {
    client: Client,
    config: ReqwestTransportConfig,
}

impl ReqwestTransport {
    pub fn new(config: ReqwestTransportConfig) -> Result<Self, TransportError> {
        // 单次请求超时由请求管线控制
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// 相对路径拼接 base URL，绝对 URL 原样使用
    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
        }
    }

    fn method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        }
    }

    /// 构造流式 multipart 表单
    fn build_form(
        form: MultipartForm,
        progress: Option<ProgressCallback>,
    ) -> Result<Form, TransportError> {
        let total = form.file_bytes();
        let sent = Arc::new(AtomicU64::new(0));
        let mut multipart = Form::new();

        for (name, value) in form.fields {
            multipart = multipart.text(name, value);
        }

        for file in form.files {
            let length = file.data.len() as u64;
            let slices: Vec<Vec<u8>> = file
                .data
                .chunks(STREAM_SLICE_BYTES)
                .map(|slice| slice.to_vec())
                .collect();

            let sent = sent.clone();
            let progress = progress.clone();
            let body_stream = stream::iter(slices.into_iter().map(move |slice| {
                let loaded = sent.fetch_add(slice.len() as u64, Ordering::SeqCst) + slice.len() as u64;
                if let Some(callback) = &progress {
                    callback(UploadProgress::new(loaded, total));
                }
                Ok::<Vec<u8>, std::io::Error>(slice)
            }));

            let part = Part::stream_with_length(reqwest::Body::wrap_stream(body_stream), length)
                .file_name(file.filename)
                .mime_str(&file.mime_type)
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            multipart = multipart.part(file.field, part);
        }

        Ok(multipart)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.url(&request.path);

        tracing::debug!(
            method = %request.method,
            url = %url,
            "Sending request"
        );

        let mut builder = self
            .client
            .request(Self::method(request.method), &url)
            .query(&request.query);

        if let Some(api_key) = &self.config.api_key {
            builder = builder.bearer_auth(api_key);
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart(form) => {
                builder.multipart(Self::build_form(form, request.progress.clone())?)
            }
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else if e.is_connect() {
                TransportError::Network(format!("Cannot connect to execution service: {}", e))
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        let status_text = status
            .canonical_reason()
            .unwrap_or_else(|| canonical_reason(status.as_u16()))
            .to_string();

        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(format!("Failed to read response: {}", e)))?
            .to_vec();

        tracing::debug!(
            url = %url,
            status = status.as_u16(),
            body_size = body.len(),
            "Response received"
        );

        Ok(ApiResponse {
            status: status.as_u16(),
            status_text,
            body,
        })
    }

    async fn health_check(&self) -> bool {
        match self
            .client
            .get(self.url(&self.config.health_path))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
