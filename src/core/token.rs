//! 上传凭证
//!
//! 凭证格式: `<AccessKey>:<签名>:<编码后的上传策略>`，
//! 其中签名为 `Base64Url(HMAC-SHA1(SecretKey, 编码后的上传策略))`，
//! 上传策略为 JSON 经 Base64Url 编码。

use crate::error::TransferError;
use base64::engine::general_purpose::URL_SAFE as BASE64_URL;
use base64::Engine;
use hmac::{Hmac, KeyInit, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// 上传策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPolicy {
    /// `bucket` 或 `bucket:key`
    pub scope: String,
    /// 过期时间（Unix 秒）
    pub deadline: i64,
    /// 仅允许新增，远程已存在同名对象时拒绝上传
    pub insert_only: bool,
}

impl UploadPolicy {
    /// 检查策略是否允许向 `bucket/key` 上传
    pub fn permits(&self, bucket: &str, key: &str, now: i64) -> Result<(), TransferError> {
        let allowed = match self.scope.split_once(':') {
            Some((b, k)) => b == bucket && k == key,
            None => self.scope == bucket,
        };
        if !allowed {
            return Err(TransferError::Unauthorized(format!(
                "凭证作用域 `{}' 不包含 `{}:{}'",
                self.scope, bucket, key
            )));
        }
        if now > self.deadline {
            return Err(TransferError::Unauthorized(format!(
                "凭证已于 {} 过期",
                self.deadline
            )));
        }
        Ok(())
    }
}

/// 签名后的上传凭证
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadToken(String);

impl UploadToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 访问密钥
#[derive(Clone)]
pub struct Credentials {
    access_key: String,
    secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub(crate) fn keys(&self) -> (&str, &str) {
        (&self.access_key, &self.secret_key)
    }

    fn sign(&self, data: &str) -> String {
        let mut mac = HmacSha1::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can accept any key length");
        mac.update(data.as_bytes());
        BASE64_URL.encode(mac.finalize().into_bytes())
    }

    /// 为一次上传生成短期凭证
    ///
    /// 允许覆盖时作用域限定到具体 key，否则作用域为整个 bucket 且只允许新增。
    pub fn generate_token(
        &self,
        bucket: &str,
        key: Option<&str>,
        overwrite: bool,
        ttl_secs: u64,
    ) -> UploadToken {
        let scope = match (overwrite, key) {
            (true, Some(key)) => format!("{}:{}", bucket, key),
            _ => bucket.to_string(),
        };
        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        let policy = UploadPolicy {
            scope,
            deadline: chrono::Utc::now().timestamp().saturating_add(ttl),
            insert_only: !overwrite,
        };

        // 序列化只含字符串/整数/布尔的结构体不会失败
        let policy_json = serde_json::to_string(&policy).unwrap_or_default();
        let encoded_policy = BASE64_URL.encode(policy_json);
        let sign = self.sign(&encoded_policy);

        UploadToken(format!("{}:{}:{}", self.access_key, sign, encoded_policy))
    }

    /// 校验凭证签名并取出上传策略
    pub fn verify(&self, token: &UploadToken) -> Result<UploadPolicy, TransferError> {
        let invalid = |reason: &str| TransferError::Unauthorized(reason.to_string());

        let mut parts = token.as_str().splitn(3, ':');
        let (access_key, sign, encoded_policy) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(s), Some(p)) => (a, s, p),
            _ => return Err(invalid("凭证格式错误")),
        };
        if access_key != self.access_key {
            return Err(invalid("AccessKey 不匹配"));
        }
        if self.sign(encoded_policy) != sign {
            return Err(invalid("签名不匹配"));
        }

        let policy_json = BASE64_URL
            .decode(encoded_policy)
            .map_err(|_| invalid("上传策略编码错误"))?;
        serde_json::from_slice(&policy_json).map_err(|_| invalid("上传策略格式错误"))
    }
}
