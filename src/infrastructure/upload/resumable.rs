//! Resumable Upload - 分片断点续传
//!
//! 流程：创建会话 → 查询已接收分片 → 按序上传缺失分片 → 全部接收后调用一次 finalize。
//! `abort()` 在每个分片前检查，进行中的分片请求通过 `select!` 直接丢弃。

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use super::uploader::{upload_error, UploadFile, UploadedFile, UPLOAD_PATH};
use crate::application::error::ClientError;
use crate::application::ports::{ApiExecutor, ApiRequest, MultipartForm, UploadProgress};

/// 断点续传会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub session_id: String,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: usize,
    pub total_chunks: u32,
    /// 服务端已接收的分片序号
    pub accepted: BTreeSet<u32>,
}

impl UploadSession {
    pub fn is_complete(&self) -> bool {
        self.accepted.len() as u32 >= self.total_chunks
            && (0..self.total_chunks).all(|i| self.accepted.contains(&i))
    }

    /// 已接收分片的百分比 (0-100)
    pub fn percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        self.accepted.len() as f64 / self.total_chunks as f64 * 100.0
    }

    /// 尚未接收的分片，升序
    pub fn missing(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.accepted.contains(i))
            .collect()
    }
}

#[derive(Deserialize)]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Deserialize)]
struct SessionStatusResponse {
    #[serde(default)]
    uploaded_chunks: Vec<u32>,
}

type ChunkListener = Arc<dyn Fn(&UploadSession) + Send + Sync>;

/// 分片续传上传
pub struct ResumableUpload {
    executor: Arc<dyn ApiExecutor>,
    file: UploadFile,
    session: Mutex<UploadSession>,
    cancel: CancellationToken,
    finalized: AtomicBool,
    on_chunk: Mutex<Option<ChunkListener>>,
}

fn resumable_path(suffix: &str) -> String {
    format!("{}/resumable{}", UPLOAD_PATH, suffix)
}

impl ResumableUpload {
    pub(crate) async fn create(
        executor: Arc<dyn ApiExecutor>,
        file: UploadFile,
        chunk_size: usize,
    ) -> Result<Self, ClientError> {
        let total_size = file.size();
        let total_chunks = total_size.div_ceil(chunk_size as u64) as u32;

        let body = json!({
            "filename": file.filename,
            "total_size": total_size,
            "mime_type": file.mime_type,
            "chunk_size": chunk_size,
            "total_chunks": total_chunks,
        });
        let response = executor
            .execute(ApiRequest::post(resumable_path("")).json(body))
            .await
            .map_err(upload_error)?;
        let created: CreateSessionResponse = response.json()?;

        tracing::info!(
            session_id = %created.session_id,
            filename = %file.filename,
            total_size,
            total_chunks,
            "Resumable upload session created"
        );

        Ok(Self {
            session: Mutex::new(UploadSession {
                session_id: created.session_id,
                filename: file.filename.clone(),
                total_size,
                chunk_size,
                total_chunks,
                accepted: BTreeSet::new(),
            }),
            executor,
            file,
            cancel: CancellationToken::new(),
            finalized: AtomicBool::new(false),
            on_chunk: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, UploadSession> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session(&self) -> UploadSession {
        self.lock().clone()
    }

    pub fn session_id(&self) -> String {
        self.lock().session_id.clone()
    }

    pub fn progress(&self) -> UploadProgress {
        let session = self.lock();
        let loaded = session
            .accepted
            .iter()
            .map(|i| self.chunk_range(&session, *i).len() as u64)
            .sum();
        UploadProgress::new(loaded, session.total_size)
    }

    /// 每个分片被接收后回调
    pub fn on_chunk(&self, listener: impl Fn(&UploadSession) + Send + Sync + 'static) -> &Self {
        *self.on_chunk.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(listener));
        self
    }

    /// 中止上传，后续分片不再发送
    pub fn abort(&self) {
        tracing::info!(session_id = %self.session_id(), "Resumable upload aborted");
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn chunk_range(&self, session: &UploadSession, index: u32) -> std::ops::Range<usize> {
        let start = index as usize * session.chunk_size;
        let end = (start + session.chunk_size).min(self.file.data.len());
        start.min(end)..end
    }

    /// 查询服务端已接收的分片并合并到本地会话
    pub async fn refresh(&self) -> Result<UploadSession, ClientError> {
        let session_id = self.session_id();
        let response = self
            .executor
            .execute(ApiRequest::get(resumable_path(&format!("/{}/status", session_id))))
            .await
            .map_err(upload_error)?;
        let status: SessionStatusResponse = response.json()?;

        let mut session = self.lock();
        let total_chunks = session.total_chunks;
        session
            .accepted
            .extend(status.uploaded_chunks.into_iter().filter(|i| *i < total_chunks));
        Ok(session.clone())
    }

    async fn send_chunk(&self, session_id: &str, index: u32) -> Result<(), ClientError> {
        let chunk = {
            let session = self.lock();
            self.file.data[self.chunk_range(&session, index)].to_vec()
        };
        let digest = format!("{:x}", md5::compute(&chunk));

        let form = MultipartForm::new()
            .file("chunk", self.file.filename.clone(), "application/octet-stream", chunk)
            .text("chunk_index", index.to_string())
            .text("session_id", session_id)
            .text("chunk_md5", digest);
        let request = ApiRequest::post(resumable_path("/chunk")).multipart(form);

        tokio::select! {
            _ = self.cancel.cancelled() => Err(ClientError::Aborted),
            result = self.executor.execute(request) => result.map(|_| ()).map_err(upload_error),
        }
    }

    /// 上传所有缺失分片并完成会话
    pub async fn start(&self) -> Result<UploadedFile, ClientError> {
        let session = self.refresh().await?;
        let session_id = session.session_id.clone();

        for index in session.missing() {
            if self.cancel.is_cancelled() {
                return Err(ClientError::Aborted);
            }

            self.send_chunk(&session_id, index).await?;

            let snapshot = {
                let mut session = self.lock();
                session.accepted.insert(index);
                session.clone()
            };
            tracing::debug!(
                session_id = %session_id,
                chunk_index = index,
                percent = snapshot.percent(),
                "Chunk accepted"
            );
            let listener = self.on_chunk.lock().unwrap_or_else(|p| p.into_inner()).clone();
            if let Some(listener) = listener {
                listener(&snapshot);
            }
        }

        self.finalize().await
    }

    async fn finalize(&self) -> Result<UploadedFile, ClientError> {
        let session = self.session();
        if !session.is_complete() {
            return Err(ClientError::UploadFailed(format!(
                "session {} has {} of {} chunks",
                session.session_id,
                session.accepted.len(),
                session.total_chunks
            )));
        }
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Err(ClientError::UploadFailed(format!(
                "session {} already finalized",
                session.session_id
            )));
        }

        let response = self
            .executor
            .execute(ApiRequest::post(resumable_path(&format!(
                "/{}/finalize",
                session.session_id
            ))))
            .await
            .map_err(upload_error)?;
        let uploaded: UploadedFile = response.json()?;

        tracing::info!(
            session_id = %session.session_id,
            file_id = %uploaded.file_id,
            "Upload finalized"
        );
        Ok(uploaded)
    }
}
