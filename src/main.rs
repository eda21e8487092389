use bucket_sync_lib::commands::{run_upload, show_state, UploadArgs};
use bucket_sync_lib::config::UploadConfig;
use bucket_sync_lib::dirs::default_state_root;
use bucket_sync_lib::logging::{get_log_dir, LogConfig, SizeRotatingWriter};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "bucket-sync", version, about = "增量上传本地目录到对象存储")]
struct Cli {
    /// 日志级别，覆盖配置文件中的设置
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// 状态根目录（默认 ~/.synctools）
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// 不显示进度
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 上传配置中 src_dir 下新增或修改过的文件
    Upload {
        /// 并发上传数 (1-100)
        threads: usize,
        /// 配置文件路径
        config: PathBuf,
        /// 有文件未能确认同步时以非零状态退出
        #[arg(long)]
        fail_on_error: bool,
    },
    /// 查看已确认的同步记录
    State {
        /// 配置文件路径
        config: PathBuf,
    },
}

/// 初始化日志系统
///
/// 控制台输出到 stderr，文件日志写到 `<state_root>/logs/app.log`。
fn init_logging(
    state_root: &Path,
    config: &LogConfig,
    level_override: Option<&str>,
) -> Option<WorkerGuard> {
    let mut config = config.clone();
    if let Some(level) = level_override {
        config.level = level.to_string();
    }

    // RUST_LOG 优先
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "{},sqlx=warn,opendal=warn",
            config.tracing_level().as_str().to_lowercase()
        ))
    });

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let log_dir = get_log_dir(state_root);
    let file_writer = config
        .enabled
        .then(|| SizeRotatingWriter::new(&log_dir, config.max_size_mb))
        .and_then(|writer| {
            writer
                .map_err(|e| eprintln!("无法创建日志文件 {}: {}", log_dir.display(), e))
                .ok()
        });

    match file_writer {
        Some(writer) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false);

            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
            None
        }
    }
}

/// 读取配置中的日志设置；配置有误时用默认值，错误留给子命令报告
fn log_config_for(config_path: &Path) -> LogConfig {
    UploadConfig::load(config_path)
        .map(|c| c.log)
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let state_root = cli.state_dir.clone().unwrap_or_else(default_state_root);

    let config_path = match &cli.command {
        Command::Upload { config, .. } | Command::State { config } => config,
    };
    let _guard = init_logging(
        &state_root,
        &log_config_for(config_path),
        cli.log_level.as_deref(),
    );

    match cli.command {
        Command::Upload {
            threads,
            config,
            fail_on_error,
        } => {
            let args = UploadArgs {
                threads,
                config_path: config,
                state_root,
                quiet: cli.quiet,
            };
            match run_upload(&args).await {
                Ok(report) if fail_on_error && !report.is_clean() => ExitCode::FAILURE,
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!("上传失败: {:#}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Command::State { config } => match show_state(&config, &state_root).await {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("{:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}
