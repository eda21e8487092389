//! 上传进度显示
//!
//! 分发器和上传任务只向通道发送事件，由唯一的消费者负责绘制进度行。

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::sync::mpsc;

/// 进度事件
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// 已提交上传
    Dispatched {
        index: usize,
        total: usize,
        remote_key: String,
    },
    /// 未变化，跳过
    Skipped { index: usize, total: usize },
    /// 上传任务结束
    Completed { remote_key: String, success: bool },
}

/// 渲染单行进度
pub fn render_progress_line(index: usize, total: usize, remote_key: &str) -> String {
    let percent = if total == 0 {
        100.0
    } else {
        index as f64 * 100.0 / total as f64
    };
    format!(
        "正在上传 {} ({}/{}, {:.0}%) ...",
        remote_key, index, total, percent
    )
}

/// 进度显示器
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new(0);
            pb.set_style(
                ProgressStyle::with_template("{spinner:.green} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(120));
            pb
        };
        Self { bar }
    }

    /// 消费事件直到所有发送端关闭，返回处理的事件数
    pub async fn run(self, mut rx: mpsc::Receiver<ProgressEvent>) -> usize {
        let mut handled = 0;
        while let Some(event) = rx.recv().await {
            handled += 1;
            match event {
                ProgressEvent::Dispatched {
                    index,
                    total,
                    remote_key,
                } => {
                    self.bar.set_length(total as u64);
                    self.bar.set_position(index as u64);
                    self.bar
                        .set_message(render_progress_line(index, total, &remote_key));
                }
                ProgressEvent::Skipped { index, total } => {
                    self.bar.set_length(total as u64);
                    self.bar.set_position(index as u64);
                }
                ProgressEvent::Completed {
                    remote_key,
                    success: false,
                } => {
                    self.bar.println(format!("上传失败: {}", remote_key));
                }
                ProgressEvent::Completed { .. } => {}
            }
        }
        self.bar.finish_and_clear();
        handled
    }
}
