use super::{Uploader, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use crate::core::{Credentials, UploadToken};
use crate::error::TransferError;
use async_trait::async_trait;
use bytes::Bytes;
use opendal::{layers::TimeoutLayer, Operator};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

// 添加超时层
fn timeout_layer() -> TimeoutLayer {
    TimeoutLayer::default()
        .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
        .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS))
}

/// 基于 opendal 的对象上传器（S3 或本地目录）
pub struct ObjectUploader {
    operator: Operator,
    bucket: String,
    credentials: Credentials,
    chunk_size: usize,
    name: String,
}

impl ObjectUploader {
    /// S3 兼容存储
    pub fn s3(
        bucket: &str,
        region: &str,
        endpoint: Option<&str>,
        credentials: Credentials,
        chunk_size: usize,
    ) -> Result<Self, TransferError> {
        use opendal::services::S3;

        let (access_key, secret_key) = credentials.keys();
        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        let operator = Operator::new(builder)?.layer(timeout_layer()).finish();
        Ok(Self {
            operator,
            bucket: bucket.to_string(),
            credentials,
            chunk_size,
            name: format!("s3://{}", bucket),
        })
    }

    /// 本地目录，对象写到 `<root>/<bucket>/<key>`
    ///
    /// 写入先落到 `<root>/.uploading` 下的临时文件，关闭时再重命名到目标位置。
    pub fn fs(
        root: &Path,
        bucket: &str,
        credentials: Credentials,
        chunk_size: usize,
    ) -> Result<Self, TransferError> {
        use opendal::services::Fs;

        let bucket_root = root.join(bucket);
        let staging = root.join(".uploading");
        let builder = Fs::default()
            .root(&bucket_root.to_string_lossy())
            .atomic_write_dir(&staging.to_string_lossy());

        let operator = Operator::new(builder)?.layer(timeout_layer()).finish();
        Ok(Self {
            operator,
            bucket: bucket.to_string(),
            credentials,
            chunk_size,
            name: format!("fs://{}", bucket_root.display()),
        })
    }

    /// 校验凭证并检查仅新增策略
    async fn authorize(&self, token: &UploadToken, key: &str) -> Result<(), TransferError> {
        let policy = self.credentials.verify(token)?;
        policy.permits(&self.bucket, key, chrono::Utc::now().timestamp())?;

        if policy.insert_only {
            match self.operator.stat(key).await {
                Ok(_) => return Err(TransferError::AlreadyExists(key.to_string())),
                Err(e) if e.kind() == opendal::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Uploader for ObjectUploader {
    async fn simple_upload(
        &self,
        token: &UploadToken,
        key: &str,
        local_path: &Path,
    ) -> Result<(), TransferError> {
        self.authorize(token, key).await?;

        let data = tokio::fs::read(local_path).await?;
        debug!("  单次上传: {} ({} 字节)", key, data.len());
        self.operator.write(key, data).await?;
        Ok(())
    }

    async fn resumable_upload(
        &self,
        token: &UploadToken,
        key: &str,
        local_path: &Path,
    ) -> Result<(), TransferError> {
        self.authorize(token, key).await?;

        let mut file = tokio::fs::File::open(local_path).await?;
        let mut writer = self
            .operator
            .writer_with(key)
            .chunk(self.chunk_size)
            .await?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut parts = 0usize;
        loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e.into());
                }
            };
            if let Err(e) = writer.write(Bytes::copy_from_slice(&buf[..n])).await {
                let _ = writer.abort().await;
                return Err(e.into());
            }
            parts += 1;
        }

        if let Err(e) = writer.close().await {
            let _ = writer.abort().await;
            return Err(e.into());
        }
        debug!("  分块上传完成: {} ({} 次写入)", key, parts);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
