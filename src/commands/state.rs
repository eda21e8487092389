use crate::config::UploadConfig;
use crate::core::{JobPaths, SyncRecord, SyncStateStore};
use anyhow::Context;
use std::path::Path;

/// 列出某个配置对应的同步记录
pub async fn show_state(config_path: &Path, state_root: &Path) -> anyhow::Result<Vec<SyncRecord>> {
    let config = UploadConfig::load(config_path)
        .with_context(|| format!("无法加载配置 {}", config_path.display()))?;
    let paths = JobPaths::derive(state_root, &config.src_dir, &config.bucket);

    if !paths.database.exists() {
        println!("任务 {} 尚无同步记录", paths.job_id);
        return Ok(Vec::new());
    }

    let store = SyncStateStore::open(&paths.database).await?;
    let records = store.records().await;
    store.close().await;
    let records = records?;

    println!("任务 {} ({}):", paths.job_id, paths.database.display());
    for record in &records {
        let time = chrono::DateTime::from_timestamp(record.confirmed_mod_time, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| record.confirmed_mod_time.to_string());
        println!("  {}  {}", time, record.composite_key);
    }
    println!("共 {} 条记录", records.len());

    Ok(records)
}
