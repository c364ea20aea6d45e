//! SQLite 检查点存储（sqlx 异步，需 `async-sqlite` feature）
//!
//! `UNIQUE(session_id, sequence_no)` 加条件插入：只有当该会话不存在 >= 当前序号的记录时才写入，
//! 校验与写入在同一条语句内完成，不依赖外部锁。

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::{CheckpointError, CheckpointRecord, CheckpointStore};

impl From<sqlx::Error> for CheckpointError {
    fn from(e: sqlx::Error) -> Self {
        CheckpointError::Backend(e.to_string())
    }
}

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// 连接（必要时创建）数据库文件并建表
    pub async fn connect(db_path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    /// 从已有连接池创建（调用方负责建表前的连接配置）
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, CheckpointError> {
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                sequence_no INTEGER NOT NULL,
                state_blob TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (session_id, sequence_no)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_session ON checkpoints(session_id, sequence_no)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest_seq(&self, session_id: &str) -> Result<u64, sqlx::Error> {
        let row = sqlx::query("SELECT MAX(sequence_no) AS seq FROM checkpoints WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        let seq: Option<i64> = row.get("seq");
        Ok(seq.unwrap_or(0).max(0) as u64)
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<CheckpointRecord, CheckpointError> {
        let session_id: String = row.get("session_id");
        let sequence_no: i64 = row.get("sequence_no");
        let state_blob: String = row.get("state_blob");
        let created_at: String = row.get("created_at");
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        Ok(CheckpointRecord {
            session_id,
            sequence_no: sequence_no.max(0) as u64,
            state_blob,
            created_at,
        })
    }

    /// 关闭连接池
    pub async fn close_pool(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, session_id: &str, sequence_no: u64, state: &str) -> Result<(), CheckpointError> {
        let seq = i64::try_from(sequence_no)
            .map_err(|_| CheckpointError::Backend(format!("sequence number out of range: {sequence_no}")))?;
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            "INSERT INTO checkpoints (session_id, sequence_no, state_blob, created_at)
             SELECT ?, ?, ?, ?
             WHERE ? > 0 AND NOT EXISTS (
                 SELECT 1 FROM checkpoints WHERE session_id = ? AND sequence_no >= ?
             )",
        )
        .bind(session_id)
        .bind(seq)
        .bind(state)
        .bind(&now)
        .bind(seq)
        .bind(session_id)
        .bind(seq)
        .execute(&self.pool)
        .await;

        let stale = match result {
            Ok(r) => r.rows_affected() == 0,
            // 并发插入同一序号时由唯一约束兜底
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => true,
            Err(e) => return Err(e.into()),
        };
        if stale {
            let latest = self.latest_seq(session_id).await?;
            return Err(CheckpointError::Stale {
                session_id: session_id.to_string(),
                sequence_no,
                latest,
            });
        }
        Ok(())
    }

    async fn load_latest(&self, session_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let row = sqlx::query(
            "SELECT session_id, sequence_no, state_blob, created_at FROM checkpoints
             WHERE session_id = ? ORDER BY sequence_no DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn history(&self, session_id: &str) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let rows = sqlx::query(
            "SELECT session_id, sequence_no, state_blob, created_at FROM checkpoints
             WHERE session_id = ? ORDER BY sequence_no ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn close(&self) {
        self.close_pool().await;
    }
}
