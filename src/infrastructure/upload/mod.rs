//! Upload - 文件上传
//!
//! - 单次上传 (multipart)
//! - 多文件上传 (并行 / 顺序)
//! - 分片断点续传

mod resumable;
mod uploader;

pub use resumable::{ResumableUpload, UploadSession};
pub use uploader::{UploadFile, UploadMode, UploadedFile, Uploader, DEFAULT_CHUNK_SIZE};
