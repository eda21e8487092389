use crate::config::UploadConfig;
use crate::core::{ProgressReporter, SyncConfig, SyncEngine, SyncReport};
use crate::storage::create_uploader;
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;

/// 上传命令参数
#[derive(Debug, Clone)]
pub struct UploadArgs {
    pub threads: usize,
    pub config_path: PathBuf,
    pub state_root: PathBuf,
    pub quiet: bool,
}

/// 执行一次上传并打印汇总
pub async fn run_upload(args: &UploadArgs) -> anyhow::Result<SyncReport> {
    let config = UploadConfig::load(&args.config_path)
        .with_context(|| format!("无法加载配置 {}", args.config_path.display()))?;
    let config = Arc::new(config);

    let sync_config = SyncConfig::new(&config, args.threads, args.state_root.clone());
    tracing::debug!(
        "同步配置: 并行数={}, 大文件阈值={} 字节",
        sync_config.max_concurrent_transfers,
        sync_config.large_file_threshold
    );

    let uploader = create_uploader(&config)?;
    let engine = SyncEngine::new(config, sync_config, uploader);

    // 启动进度监听任务
    let (progress_tx, progress_rx) = tokio::sync::mpsc::channel(100);
    let reporter = tokio::spawn(ProgressReporter::new(args.quiet).run(progress_rx));

    let result = engine.run(Some(progress_tx)).await;
    // 发送端已全部释放，等待进度行清理完毕再输出汇总
    let _ = reporter.await;

    let report = result?;
    print_summary(&report);
    Ok(report)
}

fn print_summary(report: &SyncReport) {
    println!(
        "共 {} 个文件: 上传 {} ({}), 跳过 {}, 失败 {}, 记录失败 {}, 清单错误 {}, 未列入 {}, 用时 {:.1}s",
        report.total,
        report.uploaded,
        format_size(report.bytes_uploaded),
        report.skipped,
        report.failed,
        report.commit_failed,
        report.malformed,
        report.unlisted,
        report.duration.as_secs_f64()
    );
    if let Some(e) = &report.scan_error {
        println!("清单读取中断，部分文件未处理: {}", e);
    }

    for failure in &report.failures {
        println!(
            "  [{:?}] {} => {}: {}",
            failure.kind,
            failure.local_path.display(),
            failure.remote_key,
            failure.message
        );
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
