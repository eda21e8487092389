pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::UploadConfig;
pub use core::{SyncConfig, SyncEngine, SyncReport};
pub use error::{Result, SyncError, TransferError};
pub use storage::{create_uploader, ObjectUploader, Uploader};

// 用户目录，不引入 dirs 依赖
pub mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        let var = if cfg!(target_os = "windows") {
            "USERPROFILE"
        } else {
            "HOME"
        };
        std::env::var_os(var)
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
    }

    /// 默认状态根目录 `~/.synctools`，取不到用户目录时使用当前目录
    pub fn default_state_root() -> PathBuf {
        home_dir()
            .map(|h| h.join(".synctools"))
            .unwrap_or_else(|| PathBuf::from(".synctools"))
    }
}
