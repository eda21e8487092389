//! 同步状态库 - 记录已确认上传的对象，用于跨运行的增量同步

use crate::error::{Result, SyncError};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// 一条同步记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    pub composite_key: String,
    pub confirmed_mod_time: i64,
}

/// 同步状态库
///
/// SQLite 单表 `sync_records`（WITHOUT ROWID，按 key 有序）。
/// 每次提交都以 `synchronous = FULL` 落盘；连接池自行串行化写入，
/// 多个上传任务可以直接并发调用 `lookup`/`commit`。
#[derive(Clone)]
pub struct SyncStateStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SyncStateStore {
    /// 打开（不存在则创建）状态库
    pub async fn open(path: &Path) -> Result<Self> {
        let unavailable = |message: String| SyncError::StateStoreUnavailable {
            path: path.to_path_buf(),
            message,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| unavailable(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        debug!("同步状态库已打开: {}", path.display());

        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 查询已确认的修改时间
    ///
    /// 记录值不是整数时按未同步处理。
    pub async fn lookup(&self, key: &str) -> Result<Option<i64>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT mod_time FROM sync_records WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| SyncError::StateLookup {
                    key: key.to_string(),
                    message: e.to_string(),
                })?;

        Ok(row.and_then(|(value,)| match value.parse::<i64>() {
            Ok(t) => Some(t),
            Err(_) => {
                warn!("同步记录 `{}' 的值无法识别: {}", key, value);
                None
            }
        }))
    }

    /// 写入（或覆盖）一条同步记录
    pub async fn commit(&self, key: &str, mod_time: i64) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO sync_records (key, mod_time) VALUES (?, ?)
               ON CONFLICT(key) DO UPDATE SET mod_time = excluded.mod_time"#,
        )
        .bind(key)
        .bind(mod_time.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::StateCommit {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        Ok(())
    }

    /// 按 key 顺序列出全部记录
    pub async fn records(&self) -> Result<Vec<SyncRecord>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, mod_time FROM sync_records ORDER BY key")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| SyncError::StateLookup {
                    key: "*".to_string(),
                    message: e.to_string(),
                })?;

        Ok(rows
            .into_iter()
            .filter_map(|(key, value)| {
                value.parse().ok().map(|t| SyncRecord {
                    composite_key: key,
                    confirmed_mod_time: t,
                })
            })
            .collect())
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_lookup_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStateStore::open(&dir.path().join("job.db")).await.unwrap();

        assert_eq!(store.lookup("/a.jpg => a.jpg").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_commit_then_lookup_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("job.db");

        let store = SyncStateStore::open(&path).await.unwrap();
        store.commit("/a.jpg => 2024/a.jpg", 100).await.unwrap();
        store.commit("/a.jpg => 2024/a.jpg", 200).await.unwrap();
        store.close().await;

        let store = SyncStateStore::open(&path).await.unwrap();
        assert_eq!(store.lookup("/a.jpg => 2024/a.jpg").await.unwrap(), Some(200));
    }

    #[tokio::test]
    async fn test_unparsable_value_is_not_synced() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStateStore::open(&dir.path().join("job.db")).await.unwrap();
        sqlx::query("INSERT INTO sync_records (key, mod_time) VALUES (?, ?)")
            .bind("/big.bin => big.bin")
            .bind("Y")
            .execute(&store.pool)
            .await
            .unwrap();

        assert_eq!(store.lookup("/big.bin => big.bin").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_commits() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SyncStateStore::open(&dir.path().join("job.db")).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..32i64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.commit(&format!("/f{i:02} => f{i:02}"), i).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let records = store.records().await.unwrap();
        assert_eq!(records.len(), 32);
        assert_eq!(records[0].composite_key, "/f00 => f00");
        assert_eq!(records[31].confirmed_mod_time, 31);
    }

    #[tokio::test]
    async fn test_commit_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = SyncStateStore::open(&dir.path().join("job.db")).await.unwrap();
        store.close().await;

        let err = store.commit("/a => a", 1).await.unwrap_err();
        assert!(matches!(err, SyncError::StateCommit { .. }));
    }

    #[tokio::test]
    async fn test_open_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        // 父路径是普通文件，无法创建数据库
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let err = SyncStateStore::open(&blocker.join("job.db")).await.err().unwrap();
        assert!(matches!(err, SyncError::StateStoreUnavailable { .. }));
    }
}
