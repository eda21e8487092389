//! 错误类型

use std::path::PathBuf;
use thiserror::Error;

/// 同步运行中的错误
///
/// `Config`、`StateStoreUnavailable` 以及清单构建阶段的 `Filesystem` 会终止本次运行，
/// 其余错误只影响单行清单或单个上传任务。
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("文件系统错误 `{}': {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("无法打开同步状态库 `{}': {message}", path.display())]
    StateStoreUnavailable { path: PathBuf, message: String },

    #[error("清单第 {line_number} 行格式错误 `{line}': {reason}")]
    ManifestParse {
        line_number: usize,
        line: String,
        reason: String,
    },

    #[error("上传 `{}' => `{remote_key}' 失败: {source}", local_path.display())]
    Transfer {
        local_path: PathBuf,
        remote_key: String,
        #[source]
        source: TransferError,
    },

    #[error("写入同步记录 `{key}' 失败: {message}")]
    StateCommit { key: String, message: String },

    #[error("读取同步记录 `{key}' 失败: {message}")]
    StateLookup { key: String, message: String },
}

impl SyncError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Filesystem {
            path: path.into(),
            source,
        }
    }
}

/// 传输协作方返回的错误
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("上传凭证无效: {0}")]
    Unauthorized(String),

    #[error("目标对象已存在且上传策略禁止覆盖: {0}")]
    AlreadyExists(String),

    #[error("读取本地文件失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("存储服务错误: {0}")]
    Storage(#[from] opendal::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
