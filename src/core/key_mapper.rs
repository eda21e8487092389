//! 远程 key 映射

use std::path::{Path, MAIN_SEPARATOR};

/// key 映射策略（借用自上传配置）
#[derive(Debug, Clone, Copy)]
pub struct KeyPolicy<'a> {
    pub key_prefix: &'a str,
    pub ignore_dir: bool,
}

fn is_separator(c: char) -> bool {
    c == '/' || c == MAIN_SEPARATOR
}

/// 把清单中的相对路径映射为远程 key
///
/// 依次执行：去掉目录（`ignore_dir`）、原样拼接前缀、把本地分隔符统一为 `/`。
pub fn map_key(relative_path: &str, policy: &KeyPolicy<'_>) -> String {
    let mut key = relative_path;
    if policy.ignore_dir {
        if let Some(i) = key.rfind(is_separator) {
            key = &key[i + 1..];
        }
    }

    let key = format!("{}{}", policy.key_prefix, key);
    if MAIN_SEPARATOR == '/' {
        key
    } else {
        key.replace(MAIN_SEPARATOR, "/")
    }
}

/// 同步状态库中的组合 key: `<本地路径> => <远程 key>`
pub fn composite_key(local_path: &Path, remote_key: &str) -> String {
    format!("{} => {}", local_path.display(), remote_key)
}
