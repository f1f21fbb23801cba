//! Uploader - 单次上传与多文件上传
//!
//! 所有请求都经由 `ApiExecutor` 回到客户端，因此同样受管线并发限制和重试策略约束。

use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::resumable::ResumableUpload;
use crate::application::error::ClientError;
use crate::application::ports::{
    ApiExecutor, ApiRequest, MultipartForm, ProgressCallback, UploadProgress,
};

pub(crate) const UPLOAD_PATH: &str = "/functions/upload";

/// 分片默认大小 5 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// 待上传文件
#[derive(Debug, Clone, PartialEq)]
pub struct UploadFile {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl UploadFile {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    /// 从磁盘读取文件，按扩展名推断 MIME 类型
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| ClientError::UploadFailed(format!("{}: {}", path.display(), e)))?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin")
            .to_string();
        let mime_type = guess_mime(&filename).to_string();
        Ok(Self::new(filename, mime_type, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

fn guess_mime(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "json" => "application/json",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// 上传完成后服务端返回的文件信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    #[serde(alias = "id")]
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// 多文件上传方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    #[default]
    Parallel,
    Sequential,
}

/// 非 2xx 的上传响应统一为 `UploadFailed`
pub(crate) fn upload_error(error: ClientError) -> ClientError {
    match error {
        ClientError::Server {
            status,
            status_text,
            ..
        } => ClientError::UploadFailed(format!("{} {}", status, status_text)),
        other => other,
    }
}

/// 上传器
#[derive(Clone)]
pub struct Uploader {
    executor: Arc<dyn ApiExecutor>,
    chunk_size: usize,
}

impl Uploader {
    pub fn new(executor: Arc<dyn ApiExecutor>, chunk_size: usize) -> Self {
        Self {
            executor,
            chunk_size: if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size },
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// 单次上传
    pub async fn upload(
        &self,
        file: UploadFile,
        metadata: Option<Value>,
        progress: Option<ProgressCallback>,
    ) -> Result<UploadedFile, ClientError> {
        let filename = file.filename.clone();
        let size = file.size();

        let mut form = MultipartForm::new().file("file", file.filename, file.mime_type, file.data);
        if let Some(metadata) = metadata {
            form = form.text("metadata", metadata.to_string());
        }

        let mut request = ApiRequest::post(UPLOAD_PATH).multipart(form);
        if let Some(progress) = progress {
            request = request.with_progress(progress);
        }

        let response = self.executor.execute(request).await.map_err(upload_error)?;
        let uploaded: UploadedFile = response.json()?;

        tracing::info!(
            filename = %filename,
            size_bytes = size,
            file_id = %uploaded.file_id,
            "Upload finished"
        );
        Ok(uploaded)
    }

    /// 多文件上传
    ///
    /// 进度回调收到的是所有文件累计的字节数
    pub async fn upload_many(
        &self,
        files: Vec<UploadFile>,
        mode: UploadMode,
        progress: Option<ProgressCallback>,
    ) -> Result<Vec<UploadedFile>, ClientError> {
        let total: u64 = files.iter().map(UploadFile::size).sum();

        match mode {
            UploadMode::Parallel => {
                let loaded = Arc::new(Mutex::new(vec![0u64; files.len()]));
                let uploads = files.into_iter().enumerate().map(|(index, file)| {
                    let callback = progress.clone().map(|outer| {
                        let loaded = loaded.clone();
                        Arc::new(move |p: UploadProgress| {
                            let sum = {
                                let mut loaded = loaded.lock().unwrap_or_else(|e| e.into_inner());
                                loaded[index] = p.loaded;
                                loaded.iter().sum()
                            };
                            outer(UploadProgress::new(sum, total));
                        }) as ProgressCallback
                    });
                    self.upload(file, None, callback)
                });
                try_join_all(uploads).await
            }
            UploadMode::Sequential => {
                let completed = Arc::new(AtomicU64::new(0));
                let mut uploaded = Vec::with_capacity(files.len());
                for file in files {
                    let size = file.size();
                    let callback = progress.clone().map(|outer| {
                        let completed = completed.clone();
                        Arc::new(move |p: UploadProgress| {
                            let before = completed.load(Ordering::SeqCst);
                            outer(UploadProgress::new(before + p.loaded.min(size), total));
                        }) as ProgressCallback
                    });
                    uploaded.push(self.upload(file, None, callback).await?);
                    completed.fetch_add(size, Ordering::SeqCst);
                }
                Ok(uploaded)
            }
        }
    }

    /// 创建断点续传会话
    pub async fn create_resumable(
        &self,
        file: UploadFile,
        chunk_size: Option<usize>,
    ) -> Result<ResumableUpload, ClientError> {
        let chunk_size = chunk_size.filter(|size| *size > 0).unwrap_or(self.chunk_size);
        ResumableUpload::create(self.executor.clone(), file, chunk_size).await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::TransportExecutor;
    use super::*;
    use crate::application::ports::HttpMethod;
    use crate::infrastructure::adapters::FakeTransport;
    use serde_json::json;

    fn uploader(transport: &Arc<FakeTransport>) -> Uploader {
        Uploader::new(Arc::new(TransportExecutor(transport.clone())), 0)
    }

    #[tokio::test]
    async fn test_single_upload_with_metadata() {
        let transport = FakeTransport::new().arc();
        transport.enqueue_json(HttpMethod::Post, UPLOAD_PATH, 200, json!({"file_id": "f1", "size": 4}));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressCallback = Arc::new(move |p| sink.lock().unwrap().push(p.loaded));

        let uploaded = uploader(&transport)
            .upload(
                UploadFile::new("a.png", "image/png", vec![1, 2, 3, 4]),
                Some(json!({"purpose": "input"})),
                Some(progress),
            )
            .await
            .unwrap();

        assert_eq!(uploaded.file_id, "f1");
        assert_eq!(*seen.lock().unwrap(), vec![2, 4]);

        let calls = transport.calls();
        let form = calls[0].multipart_body().unwrap();
        assert_eq!(form.files[0].field, "file");
        assert_eq!(form.field("metadata"), Some(r#"{"purpose":"input"}"#));
    }

    #[tokio::test]
    async fn test_failed_status_is_upload_failed() {
        let transport = FakeTransport::new().arc();
        transport.enqueue_json(HttpMethod::Post, UPLOAD_PATH, 413, json!({"error": "too large"}));

        let err = uploader(&transport)
            .upload(UploadFile::new("a.bin", "application/octet-stream", vec![0; 8]), None, None)
            .await
            .unwrap_err();
        match err {
            ClientError::UploadFailed(message) => assert!(message.contains("413")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_sequential_progress_is_byte_weighted() {
        let transport = FakeTransport::new().arc();
        transport.always_json(HttpMethod::Post, UPLOAD_PATH, 200, json!({"file_id": "f"}));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressCallback =
            Arc::new(move |p| sink.lock().unwrap().push((p.loaded, p.total)));

        let files = vec![
            UploadFile::new("a.bin", "application/octet-stream", vec![0; 10]),
            UploadFile::new("b.bin", "application/octet-stream", vec![0; 30]),
        ];
        let uploaded = uploader(&transport)
            .upload_many(files, UploadMode::Sequential, Some(progress))
            .await
            .unwrap();

        assert_eq!(uploaded.len(), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(5, 40), (10, 40), (25, 40), (40, 40)]
        );
    }

    #[tokio::test]
    async fn test_parallel_upload_aggregates() {
        let transport = FakeTransport::new().arc();
        transport.always_json(HttpMethod::Post, UPLOAD_PATH, 200, json!({"file_id": "f"}));

        let last = Arc::new(Mutex::new(None));
        let sink = last.clone();
        let progress: ProgressCallback = Arc::new(move |p| *sink.lock().unwrap() = Some(p));

        let files = (0..3)
            .map(|i| UploadFile::new(format!("{i}.bin"), "application/octet-stream", vec![0; 8]))
            .collect();
        let uploaded = uploader(&transport)
            .upload_many(files, UploadMode::Parallel, Some(progress))
            .await
            .unwrap();

        assert_eq!(uploaded.len(), 3);
        assert_eq!(transport.calls_to(HttpMethod::Post, UPLOAD_PATH), 3);
        let last = last.lock().unwrap().unwrap();
        assert_eq!((last.loaded, last.total), (24, 24));
    }

    #[tokio::test]
    async fn test_from_path_guesses_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.JPG");
        tokio::fs::write(&path, b"jpeg").await.unwrap();

        let file = UploadFile::from_path(&path).await.unwrap();
        assert_eq!(file.filename, "photo.JPG");
        assert_eq!(file.mime_type, "image/jpeg");
        assert_eq!(file.size(), 4);
    }
}
