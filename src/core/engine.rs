use crate::config::UploadConfig;
use crate::core::key_mapper::{composite_key, map_key};
use crate::core::manifest::{build_manifest, ManifestReader};
use crate::core::progress::ProgressEvent;
use crate::core::state::SyncStateStore;
use crate::core::token::Credentials;
use crate::error::{Result, SyncError};
use crate::storage::Uploader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 最小并发上传数
pub const MIN_UPLOAD_THREAD_COUNT: usize = 1;
/// 最大并发上传数
pub const MAX_UPLOAD_THREAD_COUNT: usize = 100;

/// 同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 最大并发传输数
    pub max_concurrent_transfers: usize,
    /// 大文件阈值（字节），超过此大小的文件使用分块上传
    pub large_file_threshold: u64,
    /// 上传凭证有效期（秒）
    pub token_ttl_secs: u64,
    /// 状态根目录，清单和状态库都放在这里
    pub state_root: PathBuf,
}

impl SyncConfig {
    pub fn new(config: &UploadConfig, threads: usize, state_root: PathBuf) -> Self {
        let clamped = threads.clamp(MIN_UPLOAD_THREAD_COUNT, MAX_UPLOAD_THREAD_COUNT);
        if clamped != threads {
            warn!(
                "并发数 {} 超出范围 [{}, {}]，使用 {}",
                threads, MIN_UPLOAD_THREAD_COUNT, MAX_UPLOAD_THREAD_COUNT, clamped
            );
        }
        Self {
            max_concurrent_transfers: clamped,
            large_file_threshold: config.put_threshold,
            token_ttl_secs: config.token_ttl_secs,
            state_root,
        }
    }
}

/// 一个 (源目录, bucket) 组合对应的本地文件位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub job_id: String,
    pub dir: PathBuf,
    pub manifest: PathBuf,
    pub database: PathBuf,
}

impl JobPaths {
    /// 由源目录和 bucket 确定性地推导
    ///
    /// `job_id` 取 `blake3("<src_dir>:<bucket>")` 的前 32 个十六进制字符。
    pub fn derive(state_root: &Path, src_dir: &Path, bucket: &str) -> Self {
        let seed = format!("{}:{}", src_dir.display(), bucket);
        let job_id = blake3::hash(seed.as_bytes()).to_hex()[..32].to_string();
        let dir = state_root.join("upload").join(&job_id);

        Self {
            manifest: dir.join(format!("{}.manifest", job_id)),
            database: dir.join(format!("{}.db", job_id)),
            dir,
            job_id,
        }
    }
}

/// 上传策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    /// 单次请求上传
    Simple,
    /// 分块上传
    Resumable,
}

impl UploadStrategy {
    /// 大小严格超过阈值时使用分块上传
    pub fn for_size(size: u64, threshold: u64) -> Self {
        if size > threshold {
            UploadStrategy::Resumable
        } else {
            UploadStrategy::Simple
        }
    }
}

/// 失败类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 本地文件在分发时已不可读
    Filesystem,
    /// 上传失败
    Transfer,
    /// 上传成功但同步记录写入失败，下次运行会重新上传
    StateCommit,
    /// 文件名无法写入清单，未参与本次同步
    Unlisted,
    /// 上传任务异常退出
    Aborted,
}

/// 单个文件的失败记录
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub local_path: PathBuf,
    pub remote_key: String,
    pub kind: FailureKind,
    pub message: String,
}

/// 同步报告
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// 清单中的文件数
    pub total: usize,
    pub skipped: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub commit_failed: usize,
    /// 清单中格式错误的行数
    pub malformed: usize,
    /// 文件名无法写入清单的文件数
    pub unlisted: usize,
    /// 清单读取中断的原因，此后的条目都未处理
    pub scan_error: Option<String>,
    pub bytes_uploaded: u64,
    pub duration: Duration,
    pub failures: Vec<JobFailure>,
}

impl SyncReport {
    /// 所有文件都已确认同步
    pub fn is_clean(&self) -> bool {
        self.failed == 0
            && self.commit_failed == 0
            && self.malformed == 0
            && self.unlisted == 0
            && self.scan_error.is_none()
    }

    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Uploaded { bytes } => {
                self.uploaded += 1;
                self.bytes_uploaded += bytes;
            }
            JobOutcome::Failed(failure) => {
                self.failed += 1;
                self.failures.push(failure);
            }
            JobOutcome::CommitFailed(failure) => {
                self.commit_failed += 1;
                self.failures.push(failure);
            }
        }
    }
}

/// 一次上传任务，由执行它的协程独占
#[derive(Debug)]
struct UploadJob {
    index: usize,
    local_path: PathBuf,
    remote_key: String,
    composite_key: String,
    size: u64,
    mod_time: i64,
}

impl UploadJob {
    fn failure(&self, kind: FailureKind, err: &SyncError) -> JobFailure {
        JobFailure {
            local_path: self.local_path.clone(),
            remote_key: self.remote_key.clone(),
            kind,
            message: err.to_string(),
        }
    }
}

enum JobOutcome {
    Uploaded { bytes: u64 },
    Failed(JobFailure),
    CommitFailed(JobFailure),
}

/// 上传任务共享的只读上下文
struct JobContext {
    store: SyncStateStore,
    uploader: Arc<dyn Uploader>,
    credentials: Credentials,
    bucket: String,
    overwrite: bool,
    token_ttl_secs: u64,
    large_file_threshold: u64,
    progress_tx: Option<mpsc::Sender<ProgressEvent>>,
}

/// 同步引擎
pub struct SyncEngine {
    config: Arc<UploadConfig>,
    sync_config: SyncConfig,
    uploader: Arc<dyn Uploader>,
}

impl SyncEngine {
    pub fn new(
        config: Arc<UploadConfig>,
        sync_config: SyncConfig,
        uploader: Arc<dyn Uploader>,
    ) -> Self {
        Self {
            config,
            sync_config,
            uploader,
        }
    }

    /// 当前配置对应的清单和状态库位置
    pub fn paths(&self) -> JobPaths {
        JobPaths::derive(
            &self.sync_config.state_root,
            &self.config.src_dir,
            &self.config.bucket,
        )
    }

    /// 运行一次同步
    ///
    /// 只有生成清单或打开状态库失败会返回错误，此时尚未启动任何上传。
    pub async fn run(
        &self,
        progress_tx: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<SyncReport> {
        let paths = self.paths();
        info!(
            "开始同步: {} => {} (任务 {})",
            self.config.src_dir.display(),
            self.uploader.name(),
            paths.job_id
        );

        let src_dir = self.config.src_dir.clone();
        let manifest = paths.manifest.clone();
        let stats = tokio::task::spawn_blocking(move || build_manifest(&src_dir, &manifest))
            .await
            .map_err(|e| {
                SyncError::fs(
                    &self.config.src_dir,
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                )
            })??;

        let store = SyncStateStore::open(&paths.database).await?;
        let reader = ManifestReader::open(&paths.manifest).await;
        let result = match reader {
            Ok(reader) => {
                self.dispatch(reader, stats.listed, store.clone(), progress_tx)
                    .await
            }
            Err(e) => Err(e),
        };
        store.close().await;

        let mut report = result?;
        report.unlisted = stats.unlisted.len();
        report
            .failures
            .extend(stats.unlisted.into_iter().map(|local_path| JobFailure {
                local_path,
                remote_key: String::new(),
                kind: FailureKind::Unlisted,
                message: "文件名不是 UTF-8 或包含制表符/换行，无法写入清单".to_string(),
            }));

        info!(
            "同步完成: 共 {} 个文件, 上传 {}, 跳过 {}, 失败 {}, 记录失败 {}",
            report.total, report.uploaded, report.skipped, report.failed, report.commit_failed
        );
        Ok(report)
    }

    /// 顺序读取清单并分发上传任务，等待所有任务结束后返回
    async fn dispatch<R: AsyncRead + Unpin>(
        &self,
        mut reader: ManifestReader<R>,
        total: usize,
        store: SyncStateStore,
        progress_tx: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<SyncReport> {
        let started = Instant::now();
        let mut report = SyncReport {
            total,
            ..Default::default()
        };

        let semaphore = Arc::new(Semaphore::new(self.sync_config.max_concurrent_transfers));
        let ctx = Arc::new(JobContext {
            store: store.clone(),
            uploader: self.uploader.clone(),
            credentials: Credentials::new(&self.config.access_key, &self.config.secret_key),
            bucket: self.config.bucket.clone(),
            overwrite: self.config.overwrite,
            token_ttl_secs: self.sync_config.token_ttl_secs,
            large_file_threshold: self.sync_config.large_file_threshold,
            progress_tx: progress_tx.clone(),
        });
        let policy = self.config.key_policy();

        let mut handles: Vec<(PathBuf, String, JoinHandle<JobOutcome>)> = Vec::new();
        let mut index = 0usize;

        loop {
            let parsed = match reader.next_entry().await {
                Ok(Some(parsed)) => parsed,
                Ok(None) => break,
                Err(e) => {
                    // 已提交的任务仍会等待完成
                    error!("读取清单失败，其余条目未处理: {}", e);
                    report.scan_error = Some(e.to_string());
                    break;
                }
            };
            let entry = match parsed {
                Ok(entry) => entry,
                Err(e) => {
                    error!("{}", e);
                    report.malformed += 1;
                    continue;
                }
            };
            index += 1;

            let remote_key = map_key(&entry.relative_path, &policy);
            let local_path = self.config.src_dir.join(&entry.relative_path);
            let key = composite_key(&local_path, &remote_key);
            debug!("检查 {} ...", key);

            match store.lookup(&key).await {
                Ok(Some(confirmed)) if confirmed == entry.mod_time => {
                    report.skipped += 1;
                    send_progress(&progress_tx, ProgressEvent::Skipped { index, total }).await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => warn!("{}，按未同步处理", e),
            }

            let size = match tokio::fs::metadata(&local_path).await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    let err = SyncError::fs(&local_path, e);
                    error!("{}", err);
                    report.record(JobOutcome::Failed(JobFailure {
                        local_path,
                        remote_key,
                        kind: FailureKind::Filesystem,
                        message: err.to_string(),
                    }));
                    continue;
                }
            };

            send_progress(
                &progress_tx,
                ProgressEvent::Dispatched {
                    index,
                    total,
                    remote_key: remote_key.clone(),
                },
            )
            .await;

            // 达到并发上限时在这里等待
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                report.scan_error = Some("并发信号量已关闭".to_string());
                break;
            };

            let job = UploadJob {
                index,
                local_path,
                remote_key,
                composite_key: key,
                size,
                mod_time: entry.mod_time,
            };
            let ctx = ctx.clone();
            let (local_path, remote_key) = (job.local_path.clone(), job.remote_key.clone());
            let handle = tokio::spawn(async move {
                let outcome = Self::execute_job(&ctx, job).await;
                drop(permit);
                outcome
            });
            handles.push((local_path, remote_key, handle));
        }

        // 等待所有任务完成
        for (local_path, remote_key, handle) in handles {
            match handle.await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!("上传任务异常退出 `{}': {}", local_path.display(), e);
                    report.record(JobOutcome::Failed(JobFailure {
                        local_path,
                        remote_key,
                        kind: FailureKind::Aborted,
                        message: e.to_string(),
                    }));
                }
            }
        }

        report.duration = started.elapsed();
        Ok(report)
    }

    /// 执行单个上传任务，成功后才写入同步记录
    async fn execute_job(ctx: &JobContext, job: UploadJob) -> JobOutcome {
        let token = ctx.credentials.generate_token(
            &ctx.bucket,
            Some(&job.remote_key),
            ctx.overwrite,
            ctx.token_ttl_secs,
        );
        let strategy = UploadStrategy::for_size(job.size, ctx.large_file_threshold);
        debug!(
            "上传 #{}: {} => {} ({} 字节, {:?})",
            job.index,
            job.local_path.display(),
            job.remote_key,
            job.size,
            strategy
        );

        let result = match strategy {
            UploadStrategy::Simple => {
                ctx.uploader
                    .simple_upload(&token, &job.remote_key, &job.local_path)
                    .await
            }
            UploadStrategy::Resumable => {
                ctx.uploader
                    .resumable_upload(&token, &job.remote_key, &job.local_path)
                    .await
            }
        };

        let outcome = match result {
            Err(source) => {
                let err = SyncError::Transfer {
                    local_path: job.local_path.clone(),
                    remote_key: job.remote_key.clone(),
                    source,
                };
                error!("{}", err);
                JobOutcome::Failed(job.failure(FailureKind::Transfer, &err))
            }
            Ok(()) => match ctx.store.commit(&job.composite_key, job.mod_time).await {
                Ok(()) => {
                    debug!("已确认: {}", job.composite_key);
                    JobOutcome::Uploaded { bytes: job.size }
                }
                Err(err) => {
                    error!("{}，该文件下次运行将重新上传", err);
                    JobOutcome::CommitFailed(job.failure(FailureKind::StateCommit, &err))
                }
            },
        };

        send_progress(
            &ctx.progress_tx,
            ProgressEvent::Completed {
                remote_key: job.remote_key,
                success: matches!(outcome, JobOutcome::Uploaded { .. }),
            },
        )
        .await;

        outcome
    }
}

/// 发送进度更新
async fn send_progress(tx: &Option<mpsc::Sender<ProgressEvent>>, event: ProgressEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UploadToken;
    use crate::error::TransferError;
    use async_trait::async_trait;
    use filetime::{set_file_mtime, FileTime};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// 先返回一段清单内容，之后每次读取都失败
    struct BrokenManifest {
        head: Option<Vec<u8>>,
    }

    impl AsyncRead for BrokenManifest {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            match self.head.take() {
                Some(head) => {
                    buf.put_slice(&head);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "device gone",
                ))),
            }
        }
    }

    /// 记录调用的上传器，可注入失败
    #[derive(Default)]
    struct RecordingUploader {
        calls: Mutex<Vec<(UploadStrategy, String)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
        fail_keys: HashSet<String>,
        panic_keys: HashSet<String>,
        close_on_upload: Option<SyncStateStore>,
    }

    impl RecordingUploader {
        fn keys(&self) -> Vec<String> {
            let mut keys: Vec<String> = self
                .calls
                .lock()
                .unwrap()
                .iter()
                .map(|(_, k)| k.clone())
                .collect();
            keys.sort();
            keys
        }

        fn strategy_of(&self, key: &str) -> Option<UploadStrategy> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|(_, k)| k == key)
                .map(|(s, _)| *s)
        }

        async fn record(&self, strategy: UploadStrategy, key: &str) -> std::result::Result<(), TransferError> {
            if self.panic_keys.contains(key) {
                panic!("uploader crashed on {key}");
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.calls.lock().unwrap().push((strategy, key.to_string()));
            if let Some(store) = &self.close_on_upload {
                store.close().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_keys.contains(key) {
                Err(TransferError::Unauthorized("injected".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Uploader for RecordingUploader {
        async fn simple_upload(
            &self,
            _token: &UploadToken,
            key: &str,
            _local_path: &Path,
        ) -> std::result::Result<(), TransferError> {
            self.record(UploadStrategy::Simple, key).await
        }

        async fn resumable_upload(
            &self,
            _token: &UploadToken,
            key: &str,
            _local_path: &Path,
        ) -> std::result::Result<(), TransferError> {
            self.record(UploadStrategy::Resumable, key).await
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    struct Fixture {
        src: tempfile::TempDir,
        state: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                src: tempfile::tempdir().unwrap(),
                state: tempfile::tempdir().unwrap(),
            }
        }

        fn write(&self, rel: &str, size: usize, mtime: i64) {
            let path = self.src.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, vec![b'x'; size]).unwrap();
            self.touch(rel, mtime);
        }

        fn touch(&self, rel: &str, mtime: i64) {
            set_file_mtime(self.src.path().join(rel), FileTime::from_unix_time(mtime, 0)).unwrap();
        }

        fn config(&self, extra: &str) -> Arc<UploadConfig> {
            let json = format!(
                r#"{{"src_dir": {}, "access_key": "ak", "secret_key": "sk", "bucket": "photos"{}}}"#,
                serde_json::to_string(self.src.path()).unwrap(),
                extra
            );
            Arc::new(UploadConfig::from_json(&json).unwrap())
        }

        fn engine(
            &self,
            config: Arc<UploadConfig>,
            threads: usize,
            uploader: Arc<RecordingUploader>,
        ) -> SyncEngine {
            let sync_config = SyncConfig::new(&config, threads, self.state.path().to_path_buf());
            SyncEngine::new(config, sync_config, uploader)
        }
    }

    #[test]
    fn test_job_paths_are_deterministic() {
        let a = JobPaths::derive(Path::new("/state"), Path::new("/photos"), "bucket");
        let b = JobPaths::derive(Path::new("/state"), Path::new("/photos"), "bucket");
        let c = JobPaths::derive(Path::new("/state"), Path::new("/photos"), "other");

        assert_eq!(a, b);
        assert_ne!(a.job_id, c.job_id);
        assert_eq!(a.job_id.len(), 32);
        assert!(a.database.starts_with("/state/upload"));
    }

    #[test]
    fn test_strategy_threshold_is_strict() {
        assert_eq!(UploadStrategy::for_size(100, 100), UploadStrategy::Simple);
        assert_eq!(UploadStrategy::for_size(101, 100), UploadStrategy::Resumable);
    }

    #[test]
    fn test_thread_count_clamped() {
        let fx = Fixture::new();
        let config = fx.config("");
        assert_eq!(SyncConfig::new(&config, 0, PathBuf::new()).max_concurrent_transfers, 1);
        assert_eq!(SyncConfig::new(&config, 500, PathBuf::new()).max_concurrent_transfers, 100);
    }

    #[tokio::test]
    async fn test_incremental_runs() {
        let fx = Fixture::new();
        fx.write("a.jpg", 10 * 1024, 100);
        fx.write("b/c.jpg", 10 * 1024, 100);
        let config = fx.config(r#", "key_prefix": "2024/""#);

        let uploader = Arc::new(RecordingUploader::default());
        let report = fx.engine(config.clone(), 4, uploader.clone()).run(None).await.unwrap();
        assert_eq!(report.uploaded, 2);
        assert!(report.is_clean());
        assert_eq!(uploader.keys(), vec!["2024/a.jpg", "2024/b/c.jpg"]);

        // 没有变化，不应有任何上传
        let uploader = Arc::new(RecordingUploader::default());
        let report = fx.engine(config.clone(), 4, uploader.clone()).run(None).await.unwrap();
        assert_eq!(report.skipped, 2);
        assert!(uploader.keys().is_empty());

        fx.touch("a.jpg", 200);
        let uploader = Arc::new(RecordingUploader::default());
        let report = fx.engine(config, 4, uploader.clone()).run(None).await.unwrap();
        assert_eq!(uploader.keys(), vec!["2024/a.jpg"]);
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_content_change_with_same_mtime_not_detected() {
        let fx = Fixture::new();
        fx.write("a.jpg", 10, 100);
        let config = fx.config("");

        let uploader = Arc::new(RecordingUploader::default());
        fx.engine(config.clone(), 2, uploader).run(None).await.unwrap();

        fx.write("a.jpg", 20, 100);
        let uploader = Arc::new(RecordingUploader::default());
        let report = fx.engine(config, 2, uploader.clone()).run(None).await.unwrap();
        assert!(uploader.keys().is_empty());
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_strategy_routing_by_size() {
        let fx = Fixture::new();
        fx.write("big.bin", 1001, 100);
        fx.write("edge.bin", 1000, 100);
        let config = fx.config(r#", "put_threshold": 1000"#);

        let uploader = Arc::new(RecordingUploader::default());
        fx.engine(config, 2, uploader.clone()).run(None).await.unwrap();

        assert_eq!(uploader.strategy_of("big.bin"), Some(UploadStrategy::Resumable));
        assert_eq!(uploader.strategy_of("edge.bin"), Some(UploadStrategy::Simple));
    }

    #[tokio::test]
    async fn test_concurrency_bound_respected() {
        let fx = Fixture::new();
        for i in 0..24 {
            fx.write(&format!("f{i:02}.dat"), 4, 100);
        }
        let config = fx.config("");

        let uploader = Arc::new(RecordingUploader {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let report = fx.engine(config, 3, uploader.clone()).run(None).await.unwrap();

        // run 返回时所有任务都已结束
        assert_eq!(uploader.calls.lock().unwrap().len(), 24);
        assert_eq!(uploader.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(report.uploaded, 24);
        let peak = uploader.max_in_flight.load(Ordering::SeqCst);
        assert_eq!(peak, 3, "peak in-flight uploads was {peak}");
    }

    #[tokio::test]
    async fn test_failed_transfer_leaves_record_untouched() {
        let fx = Fixture::new();
        fx.write("a.jpg", 10, 100);
        fx.write("b.jpg", 10, 100);
        let config = fx.config("");

        let uploader = Arc::new(RecordingUploader::default());
        let engine = fx.engine(config.clone(), 2, uploader);
        engine.run(None).await.unwrap();
        let paths = engine.paths();

        fx.touch("a.jpg", 300);
        let uploader = Arc::new(RecordingUploader {
            fail_keys: HashSet::from(["a.jpg".to_string()]),
            ..Default::default()
        });
        let report = fx.engine(config.clone(), 2, uploader).run(None).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].kind, FailureKind::Transfer);
        assert_eq!(report.failures[0].remote_key, "a.jpg");
        assert!(!report.is_clean());

        let store = SyncStateStore::open(&paths.database).await.unwrap();
        let key = composite_key(&config.src_dir.join("a.jpg"), "a.jpg");
        assert_eq!(store.lookup(&key).await.unwrap(), Some(100));
        store.close().await;

        // 失败的文件下次运行会重新上传
        let uploader = Arc::new(RecordingUploader::default());
        fx.engine(config, 2, uploader.clone()).run(None).await.unwrap();
        assert_eq!(uploader.keys(), vec!["a.jpg"]);
    }

    #[tokio::test]
    async fn test_first_run_failure_creates_no_record() {
        let fx = Fixture::new();
        fx.write("a.jpg", 10, 100);
        let config = fx.config("");

        let uploader = Arc::new(RecordingUploader {
            fail_keys: HashSet::from(["a.jpg".to_string()]),
            ..Default::default()
        });
        let engine = fx.engine(config.clone(), 1, uploader);
        let report = engine.run(None).await.unwrap();
        assert_eq!(report.failed, 1);

        let store = SyncStateStore::open(&engine.paths().database).await.unwrap();
        assert!(store.records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_failure_is_reported() {
        let fx = Fixture::new();
        fx.write("a.jpg", 10, 100);
        let config = fx.config("");
        let probe = fx.engine(config.clone(), 1, Arc::new(RecordingUploader::default()));
        let paths = probe.paths();
        build_manifest(&config.src_dir, &paths.manifest).unwrap();
        let store = SyncStateStore::open(&paths.database).await.unwrap();

        let uploader = Arc::new(RecordingUploader {
            close_on_upload: Some(store.clone()),
            ..Default::default()
        });
        let engine = fx.engine(config, 1, uploader.clone());
        let report = engine
            .dispatch(ManifestReader::open(&paths.manifest).await.unwrap(), 1, store, None)
            .await
            .unwrap();

        assert_eq!(uploader.keys(), vec!["a.jpg"]);
        assert_eq!(report.uploaded, 0);
        assert_eq!(report.commit_failed, 1);
        assert_eq!(report.failures[0].kind, FailureKind::StateCommit);

        let store = SyncStateStore::open(&paths.database).await.unwrap();
        assert!(store.records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let fx = Fixture::new();
        fx.write("a.jpg", 10, 100);
        let config = fx.config("");
        let engine = fx.engine(config, 2, Arc::new(RecordingUploader::default()));
        let paths = engine.paths();
        std::fs::create_dir_all(&paths.dir).unwrap();
        std::fs::write(&paths.manifest, "garbage\na.jpg\t10\t100\nb.jpg\t10\n").unwrap();
        let store = SyncStateStore::open(&paths.database).await.unwrap();

        let report = engine
            .dispatch(ManifestReader::open(&paths.manifest).await.unwrap(), 3, store, None)
            .await
            .unwrap();
        assert_eq!(report.malformed, 2);
        assert_eq!(report.uploaded, 1);
    }

    #[tokio::test]
    async fn test_manifest_read_error_marks_report_incomplete() {
        let fx = Fixture::new();
        fx.write("a.jpg", 10, 100);
        let config = fx.config("");
        let uploader = Arc::new(RecordingUploader::default());
        let engine = fx.engine(config, 2, uploader.clone());
        let store = SyncStateStore::open(&engine.paths().database).await.unwrap();

        let reader = ManifestReader::new(BrokenManifest {
            head: Some(b"a.jpg\t10\t100\n".to_vec()),
        });
        let report = engine.dispatch(reader, 2, store, None).await.unwrap();

        // 中断前已分发的任务仍然完成
        assert_eq!(uploader.keys(), vec!["a.jpg"]);
        assert_eq!(report.uploaded, 1);
        assert!(report.scan_error.as_deref().unwrap().contains("device gone"));
        assert!(!report.is_clean());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_unlisted_files_make_report_unclean() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let fx = Fixture::new();
        fx.write("a.jpg", 10, 100);
        std::fs::write(fx.src.path().join("tab\tname.jpg"), b"t").unwrap();
        std::fs::write(fx.src.path().join(OsStr::from_bytes(b"caf\xe9.jpg")), b"c").unwrap();
        let config = fx.config("");

        let uploader = Arc::new(RecordingUploader::default());
        let report = fx.engine(config, 2, uploader.clone()).run(None).await.unwrap();

        assert_eq!(uploader.keys(), vec!["a.jpg"]);
        assert_eq!(report.total, 1);
        assert_eq!(report.unlisted, 2);
        assert_eq!(report.failures.len(), 2);
        assert!(report
            .failures
            .iter()
            .all(|f| f.kind == FailureKind::Unlisted));
        assert!(report
            .failures
            .iter()
            .any(|f| f.local_path == fx.src.path().join("tab\tname.jpg")));
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_crashed_job_reported_with_paths() {
        let fx = Fixture::new();
        fx.write("a.jpg", 10, 100);
        fx.write("b.jpg", 10, 100);
        let config = fx.config("");

        let uploader = Arc::new(RecordingUploader {
            panic_keys: HashSet::from(["a.jpg".to_string()]),
            ..Default::default()
        });
        let report = fx.engine(config.clone(), 2, uploader).run(None).await.unwrap();

        assert_eq!(report.uploaded, 1);
        assert_eq!(report.failed, 1);
        let failure = &report.failures[0];
        assert_eq!(failure.kind, FailureKind::Aborted);
        assert_eq!(failure.remote_key, "a.jpg");
        assert_eq!(failure.local_path, config.src_dir.join("a.jpg"));
    }

    #[tokio::test]
    async fn test_vanished_file_reported_per_job() {
        let fx = Fixture::new();
        fx.write("a.jpg", 10, 100);
        let config = fx.config("");
        let uploader = Arc::new(RecordingUploader::default());
        let engine = fx.engine(config, 2, uploader.clone());
        let paths = engine.paths();
        std::fs::create_dir_all(&paths.dir).unwrap();
        std::fs::write(&paths.manifest, "gone.jpg\t10\t100\na.jpg\t10\t100\n").unwrap();
        let store = SyncStateStore::open(&paths.database).await.unwrap();

        let report = engine
            .dispatch(ManifestReader::open(&paths.manifest).await.unwrap(), 2, store, None)
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].kind, FailureKind::Filesystem);
        assert_eq!(uploader.keys(), vec!["a.jpg"]);
    }

    #[tokio::test]
    async fn test_unusable_state_root_aborts_before_uploads() {
        let fx = Fixture::new();
        fx.write("a.jpg", 10, 100);
        let config = fx.config("");
        let blocker = fx.state.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let uploader = Arc::new(RecordingUploader::default());
        let sync_config = SyncConfig::new(&config, 2, blocker);
        let engine = SyncEngine::new(config, sync_config, uploader.clone());

        assert!(engine.run(None).await.is_err());
        assert!(uploader.keys().is_empty());
    }

    #[tokio::test]
    async fn test_progress_events_emitted() {
        let fx = Fixture::new();
        fx.write("a.jpg", 10, 100);
        let config = fx.config("");
        let (tx, mut rx) = mpsc::channel(16);

        fx.engine(config, 1, Arc::new(RecordingUploader::default()))
            .run(Some(tx))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(
            events[0],
            ProgressEvent::Dispatched { index: 1, total: 1, .. }
        ));
        assert!(matches!(
            events[1],
            ProgressEvent::Completed { success: true, .. }
        ));
    }
}
