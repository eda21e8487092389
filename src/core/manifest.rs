//! 本地文件清单
//!
//! 每次运行都完整遍历源目录，生成以制表符分隔的清单文件：
//! `相对路径 \t 大小 \t 修改时间(秒)`。增量判断不在这里做，而是交给同步状态库。

use crate::error::{Result, SyncError};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 清单中的一条文件记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub relative_path: String,
    pub size: u64,
    pub mod_time: i64,
}

impl ManifestEntry {
    fn to_line(&self) -> String {
        format!("{}\t{}\t{}", self.relative_path, self.size, self.mod_time)
    }

    /// 解析一行清单
    ///
    /// 少于 2 个字段、缺少修改时间或修改时间不是整数都视为格式错误。
    /// 大小字段仅供参考，分发时会重新 stat 文件。
    pub fn parse_line(line_number: usize, line: &str) -> Result<Self> {
        let malformed = |reason: &str| SyncError::ManifestParse {
            line_number,
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let line = line.trim();
        let items: Vec<&str> = line.split('\t').collect();
        if items.len() < 2 {
            return Err(malformed("字段数不足"));
        }
        let mod_time = items
            .get(2)
            .ok_or_else(|| malformed("缺少修改时间"))?
            .parse::<i64>()
            .map_err(|_| malformed("修改时间不是整数"))?;

        Ok(Self {
            relative_path: items[0].to_string(),
            size: items[1].parse().unwrap_or(0),
            mod_time,
        })
    }
}

/// 清单生成结果
#[derive(Debug, Default)]
pub struct ManifestStats {
    /// 写入清单的文件数
    pub listed: usize,
    /// 文件名无法写入清单（非 UTF-8 或含制表符/换行）的文件
    pub unlisted: Vec<PathBuf>,
}

fn unix_seconds(meta: &fs::Metadata) -> io::Result<i64> {
    let modified = meta.modified()?;
    Ok(match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    })
}

/// 遍历 `src_dir` 生成清单文件
///
/// 先写临时文件，落盘后再重命名，失败时不会留下不完整的清单。
/// 无法写入清单的文件不会被丢弃，而是记在 `ManifestStats::unlisted` 中。
pub fn build_manifest(src_dir: &Path, manifest_path: &Path) -> Result<ManifestStats> {
    let root_meta = fs::metadata(src_dir).map_err(|e| SyncError::fs(src_dir, e))?;
    if !root_meta.is_dir() {
        return Err(SyncError::fs(
            src_dir,
            io::Error::new(io::ErrorKind::Other, "不是目录"),
        ));
    }

    if let Some(parent) = manifest_path.parent() {
        fs::create_dir_all(parent).map_err(|e| SyncError::fs(parent, e))?;
    }
    let tmp_path = manifest_path.with_extension("manifest.tmp");
    let file = File::create(&tmp_path).map_err(|e| SyncError::fs(&tmp_path, e))?;
    let mut writer = BufWriter::new(file);

    info!("开始生成文件清单: {}", src_dir.display());

    let mut stats = ManifestStats::default();
    for entry in WalkDir::new(src_dir)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src_dir).to_path_buf();
            let source = e
                .into_io_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "目录遍历失败"));
            SyncError::fs(path, source)
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = match path.strip_prefix(src_dir).ok().and_then(|p| p.to_str()) {
            Some(r) if !r.contains(['\t', '\n', '\r']) => r.to_string(),
            _ => {
                warn!("文件名无法写入清单，本次不会上传: {:?}", path);
                stats.unlisted.push(path.to_path_buf());
                continue;
            }
        };

        let meta = entry.metadata().map_err(|e| {
            let source = e
                .into_io_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "读取元数据失败"));
            SyncError::fs(path, source)
        })?;
        let mod_time = unix_seconds(&meta).map_err(|e| SyncError::fs(path, e))?;

        let line = ManifestEntry {
            relative_path: relative,
            size: meta.len(),
            mod_time,
        }
        .to_line();
        writeln!(writer, "{}", line).map_err(|e| SyncError::fs(&tmp_path, e))?;
        stats.listed += 1;
    }

    let file = writer
        .into_inner()
        .map_err(|e| SyncError::fs(&tmp_path, e.into_error()))?;
    file.sync_all().map_err(|e| SyncError::fs(&tmp_path, e))?;
    drop(file);
    fs::rename(&tmp_path, manifest_path).map_err(|e| SyncError::fs(manifest_path, e))?;

    info!(
        "文件清单生成完成: {} 个文件, {} 个未列入",
        stats.listed,
        stats.unlisted.len()
    );
    Ok(stats)
}

/// 顺序读取清单
pub struct ManifestReader<R = tokio::fs::File> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    line_number: usize,
}

impl ManifestReader {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| SyncError::fs(path, e))?;
        Ok(Self::new(file))
    }
}

impl<R: AsyncRead + Unpin> ManifestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
            line_number: 0,
        }
    }

    /// 读取下一行，返回 `None` 表示读完
    ///
    /// 外层错误为读取失败；内层错误为单行格式错误，调用方跳过该行即可。
    pub async fn next_entry(&mut self) -> io::Result<Option<Result<ManifestEntry>>> {
        loop {
            self.buf.clear();
            let n = self.reader.read_until(b'\n', &mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.line_number += 1;

            let parsed = match std::str::from_utf8(&self.buf) {
                Ok(line) if line.trim().is_empty() => {
                    debug!("跳过清单空行 {}", self.line_number);
                    continue;
                }
                Ok(line) => ManifestEntry::parse_line(self.line_number, line),
                Err(_) => Err(SyncError::ManifestParse {
                    line_number: self.line_number,
                    line: String::from_utf8_lossy(&self.buf).trim().to_string(),
                    reason: "不是有效的 UTF-8".to_string(),
                }),
            };
            return Ok(Some(parsed));
        }
    }
}
