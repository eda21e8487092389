//! 上传配置模块
//!
//! 配置文件为 JSON，例如：
//!
//! ```json
//! {
//!     "src_dir"    : "/Users/jemy/Photos",
//!     "access_key" : "<AccessKey>",
//!     "secret_key" : "<SecretKey>",
//!     "bucket"     : "test-bucket",
//!     "ignore_dir" : false,
//!     "key_prefix" : "2014/12/01/",
//!     "overwrite"  : false
//! }
//! ```

use crate::core::KeyPolicy;
use crate::error::{Result, SyncError};
use crate::logging::LogConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// 大文件阈值默认值：超过此大小的文件使用分块上传
pub const DEFAULT_PUT_THRESHOLD: u64 = 100 * (1 << 20);

/// 上传配置，加载后在整个运行期间只读
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub src_dir: PathBuf,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    /// 远程 key 前缀，原样拼接，不会自动补 `/`
    #[serde(default)]
    pub key_prefix: String,
    /// 忽略目录结构，只保留文件名
    #[serde(default)]
    pub ignore_dir: bool,
    /// 允许覆盖远程已存在的同名对象
    #[serde(default)]
    pub overwrite: bool,

    /// S3 兼容服务地址
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// 设置后上传到本地目录（`<local_target>/<bucket>/<key>`）而不是 S3
    #[serde(default)]
    pub local_target: Option<PathBuf>,
    #[serde(default = "default_put_threshold")]
    pub put_threshold: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// 上传凭证有效期（秒）
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_put_threshold() -> u64 {
    DEFAULT_PUT_THRESHOLD
}

fn default_chunk_size() -> usize {
    4 * 1024 * 1024 // 4MB
}

fn default_token_ttl() -> u64 {
    24 * 3600
}

impl UploadConfig {
    /// 从配置文件加载并校验
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("读取配置文件 `{}' 失败: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// 解析 JSON 配置并校验必填项
    pub fn from_json(content: &str) -> Result<Self> {
        let config: UploadConfig = serde_json::from_str(content)
            .map_err(|e| SyncError::Config(format!("解析配置文件失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let required = [
            ("src_dir", self.src_dir.as_os_str().is_empty()),
            ("access_key", self.access_key.is_empty()),
            ("secret_key", self.secret_key.is_empty()),
            ("bucket", self.bucket.is_empty()),
        ];
        if let Some((name, _)) = required.iter().find(|(_, missing)| *missing) {
            return Err(SyncError::Config(format!("缺少必填参数 `{}'", name)));
        }

        let meta = fs::metadata(&self.src_dir).map_err(|e| {
            SyncError::Config(format!(
                "参数 `src_dir' 无效 `{}': {}",
                self.src_dir.display(),
                e
            ))
        })?;
        if !meta.is_dir() {
            return Err(SyncError::Config(format!(
                "参数 `src_dir' 不是目录: {}",
                self.src_dir.display()
            )));
        }

        if self.chunk_size == 0 {
            return Err(SyncError::Config("`chunk_size' 必须大于 0".to_string()));
        }

        Ok(())
    }

    /// key 映射策略
    pub fn key_policy(&self) -> KeyPolicy<'_> {
        KeyPolicy {
            key_prefix: &self.key_prefix,
            ignore_dir: self.ignore_dir,
        }
    }
}
