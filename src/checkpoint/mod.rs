//! 检查点存储
//!
//! 会话 ID → 按序号递增的状态快照（只追加，序号从 1 开始）。序号最大的记录是恢复点；
//! `save` 对同一会话拒绝小于等于当前最新序号的写入（stale write），不同会话之间互不加锁。
//!
//! 后端：
//! - **memory**: 进程内，测试与单机演示
//! - **file**: 每会话一个 JSON Lines 文件，进程重启后可恢复
//! - **sqlite**: sqlx 异步 SQLite（需 `async-sqlite` feature）

pub mod file;
pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Session;

pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteCheckpointStore;

/// 检查点存储错误
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// 序号不大于已存储的最新序号
    #[error("stale checkpoint for {session_id}: seq {sequence_no} <= latest {latest}")]
    Stale {
        session_id: String,
        sequence_no: u64,
        latest: u64,
    },

    #[error("checkpoint backend error: {0}")]
    Backend(String),

    #[error("checkpoint serialization error: {0}")]
    Serialization(String),

    #[error("unsupported checkpoint backend: {0}")]
    Unsupported(String),
}

impl From<std::io::Error> for CheckpointError {
    fn from(e: std::io::Error) -> Self {
        CheckpointError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(e: serde_json::Error) -> Self {
        CheckpointError::Serialization(e.to_string())
    }
}

/// 一条持久化记录：session_id + 单调序号 + 不透明的会话快照
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub session_id: String,
    pub sequence_no: u64,
    pub state_blob: String,
    pub created_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(session_id: &str, sequence_no: u64, state_blob: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            sequence_no,
            state_blob: state_blob.to_string(),
            created_at: Utc::now(),
        }
    }

    /// 反序列化为 Session
    pub fn decode(&self) -> Result<Session, CheckpointError> {
        decode_state(&self.state_blob)
    }
}

/// 检查点存储接口（Orchestrator 唯一依赖的持久化边界）
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 写入一条检查点；sequence_no 必须严格大于该会话已存储的最新序号
    async fn save(&self, session_id: &str, sequence_no: u64, state: &str) -> Result<(), CheckpointError>;

    /// 返回序号最大的记录；未知会话返回 None
    async fn load_latest(&self, session_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError>;

    /// 按序号升序返回全部历史记录（审计 / 回放）
    async fn history(&self, session_id: &str) -> Result<Vec<CheckpointRecord>, CheckpointError>;

    /// 释放底层资源（连接池等）；默认无操作
    async fn close(&self) {}
}

pub fn encode_state(session: &Session) -> Result<String, CheckpointError> {
    Ok(serde_json::to_string(session)?)
}

pub fn decode_state(blob: &str) -> Result<Session, CheckpointError> {
    Ok(serde_json::from_str(blob)?)
}

/// 按连接串创建检查点存储
///
/// - `memory`
/// - `file:<dir>`
/// - `sqlite:<path>`（需 `async-sqlite` feature）
///
/// 未知或当前构建不支持的后端直接报错，不回退到内存存储（否则重启后状态静默丢失）。
pub async fn open_checkpoint_store(backend: &str) -> Result<Arc<dyn CheckpointStore>, CheckpointError> {
    let backend = backend.trim();
    if backend == "memory" {
        tracing::info!("Using in-memory checkpoint store");
        return Ok(Arc::new(InMemoryCheckpointStore::new()));
    }
    if let Some(dir) = backend.strip_prefix("file:") {
        let store = FileCheckpointStore::open(dir).await?;
        tracing::info!("Using file checkpoint store: {}", dir);
        return Ok(Arc::new(store));
    }
    if let Some(path) = backend.strip_prefix("sqlite:") {
        #[cfg(feature = "async-sqlite")]
        {
            let store = SqliteCheckpointStore::connect(path).await?;
            tracing::info!("Using sqlite checkpoint store: {}", path);
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "async-sqlite"))]
        {
            return Err(CheckpointError::Unsupported(format!(
                "sqlite:{path} requires the async-sqlite feature"
            )));
        }
    }
    Err(CheckpointError::Unsupported(backend.to_string()))
}
