pub mod object;

use crate::config::UploadConfig;
use crate::core::{Credentials, UploadToken};
use crate::error::TransferError;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

pub use object::ObjectUploader;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 上传接口
///
/// 两种策略都只在对象完整写入远程后返回 `Ok`。
#[async_trait]
pub trait Uploader: Send + Sync {
    /// 单次请求上传整个文件
    async fn simple_upload(
        &self,
        token: &UploadToken,
        key: &str,
        local_path: &Path,
    ) -> Result<(), TransferError>;

    /// 分块上传（大文件）
    async fn resumable_upload(
        &self,
        token: &UploadToken,
        key: &str,
        local_path: &Path,
    ) -> Result<(), TransferError>;

    /// 获取目标名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据配置创建上传器
pub fn create_uploader(config: &UploadConfig) -> Result<Arc<dyn Uploader>> {
    let credentials = Credentials::new(&config.access_key, &config.secret_key);

    let uploader = match &config.local_target {
        Some(root) => {
            tracing::info!("上传目标为本地目录: {}", root.display());
            ObjectUploader::fs(root, &config.bucket, credentials, config.chunk_size)?
        }
        None => {
            tracing::info!(
                "上传目标为 S3: bucket={}, region={}",
                config.bucket,
                config.region
            );
            ObjectUploader::s3(
                &config.bucket,
                &config.region,
                config.endpoint.as_deref(),
                credentials,
                config.chunk_size,
            )?
        }
    };

    Ok(Arc::new(uploader))
}
