//! 文件检查点存储
//!
//! 每个会话一个 `<dir>/<session>.jsonl`，每行一条 CheckpointRecord，只追加不改写。
//! 写入后 sync_data，进程崩溃时最多丢失未完成的最后一行（加载时跳过无法解析的行）。
//! 每次追加前检查文件尾，残行之后的新记录总是从新的一行开始。

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

use super::{CheckpointError, CheckpointRecord, CheckpointStore};

/// 每会话的写锁与最新序号缓存（None 表示尚未从磁盘读取）
type Slot = Arc<Mutex<Option<u64>>>;

pub struct FileCheckpointStore {
    dir: PathBuf,
    slots: RwLock<HashMap<String, Slot>>,
}

impl FileCheckpointStore {
    /// 打开（必要时创建）检查点目录
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            slots: RwLock::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 会话 ID 映射为文件名；含非安全字符时整体十六进制编码并加 `=` 前缀，
    /// 安全 ID 不含 `=`，两类文件名不会相撞
    fn path_for(&self, session_id: &str) -> PathBuf {
        let safe = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        let name = if safe {
            format!("{session_id}.jsonl")
        } else {
            let hex: String = session_id.bytes().map(|b| format!("{b:02x}")).collect();
            format!("={hex}.jsonl")
        };
        self.dir.join(name)
    }

    async fn slot(&self, session_id: &str) -> Slot {
        if let Some(slot) = self.slots.read().await.get(session_id) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(session_id.to_string()).or_default())
    }

    /// 追加一行；文件末尾是未换行的残行时先补换行，残行本身在读取时被跳过
    async fn append(&self, session_id: &str, encoded: &str) -> Result<(), CheckpointError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.path_for(session_id))
            .await?;
        let mut line = String::with_capacity(encoded.len() + 2);
        if ends_with_partial_line(&mut file).await? {
            line.push('\n');
        }
        line.push_str(encoded);
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn read_records(&self, session_id: &str) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let path = self.path_for(session_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for (lineno, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CheckpointRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) => {
                    tracing::warn!(session_id, line = lineno + 1, "skipping unreadable checkpoint line: {}", e);
                }
            }
        }
        records.sort_by_key(|r| r.sequence_no);
        Ok(records)
    }
}

async fn ends_with_partial_line(file: &mut tokio::fs::File) -> std::io::Result<bool> {
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, session_id: &str, sequence_no: u64, state: &str) -> Result<(), CheckpointError> {
        let slot = self.slot(session_id).await;
        let mut latest = slot.lock().await;
        // 本进程首次写该会话（或上次写入失败）：从磁盘恢复最新序号
        let current = match *latest {
            Some(seq) => seq,
            None => {
                let seq = self
                    .read_records(session_id)
                    .await?
                    .last()
                    .map(|r| r.sequence_no)
                    .unwrap_or(0);
                *latest = Some(seq);
                seq
            }
        };
        if sequence_no <= current {
            return Err(CheckpointError::Stale {
                session_id: session_id.to_string(),
                sequence_no,
                latest: current,
            });
        }

        let record = CheckpointRecord::new(session_id, sequence_no, state);
        let encoded = serde_json::to_string(&record)?;
        match self.append(session_id, &encoded).await {
            Ok(()) => {
                *latest = Some(sequence_no);
                Ok(())
            }
            Err(e) => {
                // 文件状态未知（可能已写入部分或全部），下次写入前重新扫描
                *latest = None;
                Err(e)
            }
        }
    }

    async fn load_latest(&self, session_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Ok(self.read_records(session_id).await?.pop())
    }

    async fn history(&self, session_id: &str) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        self.read_records(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_latest_and_stale() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        store.save("s1", 1, "A").await.unwrap();
        store.save("s1", 2, "B").await.unwrap();
        assert!(matches!(
            store.save("s1", 2, "C").await,
            Err(CheckpointError::Stale { .. })
        ));
        let latest = store.load_latest("s1").await.unwrap().unwrap();
        assert_eq!(latest.state_blob, "B");
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileCheckpointStore::open(dir.path()).await.unwrap();
            store.save("s1", 1, "A").await.unwrap();
            store.save("s1", 2, "B").await.unwrap();
        }
        let reopened = FileCheckpointStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.load_latest("s1").await.unwrap().unwrap().sequence_no, 2);
        // 重新打开后序号校验仍基于磁盘上的最新记录
        assert!(reopened.save("s1", 1, "old").await.is_err());
        reopened.save("s1", 3, "C").await.unwrap();
        assert_eq!(reopened.history("s1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_file_store_skips_torn_last_line() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        store.save("s1", 1, "A").await.unwrap();
        let path = store.path_for("s1");
        let mut f = tokio::fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        f.write_all(b"{\"session_id\":\"s1\",\"seq").await.unwrap();
        drop(f);

        let reopened = FileCheckpointStore::open(dir.path()).await.unwrap();
        let latest = reopened.load_latest("s1").await.unwrap().unwrap();
        assert_eq!(latest.sequence_no, 1);

        // 残行之后的新记录仍可读
        reopened.save("s1", 2, "B").await.unwrap();
        let latest = reopened.load_latest("s1").await.unwrap().unwrap();
        assert_eq!(latest.state_blob, "B");
    }

    #[tokio::test]
    async fn test_unsafe_session_id_is_encoded() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        let path = store.path_for("../../etc/passwd");
        assert_eq!(path.parent().unwrap(), dir.path());
        store.save("../../etc/passwd", 1, "A").await.unwrap();
        assert!(store.load_latest("../../etc/passwd").await.unwrap().is_some());
        assert!(store.load_latest("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_torn_tail_in_same_process_does_not_swallow_next_save() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        store.save("s1", 1, "A").await.unwrap();
        // 同一进程内写入中断，留下残行
        let mut f = tokio::fs::OpenOptions::new()
            .append(true)
            .open(store.path_for("s1"))
            .await
            .unwrap();
        f.write_all(b"{\"session_id\":\"s1\",\"seq").await.unwrap();
        drop(f);

        store.save("s1", 2, "B").await.unwrap();
        let latest = store.load_latest("s1").await.unwrap().unwrap();
        assert_eq!(latest.sequence_no, 2);
        assert_eq!(latest.state_blob, "B");
    }

    #[tokio::test]
    async fn test_failed_append_rescans_before_next_save() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        store.save("s1", 1, "A").await.unwrap();
        // 模拟写入已落盘但返回失败：缓存被清空后按磁盘内容判定
        *store.slot("s1").await.lock().await = None;
        let mut f = tokio::fs::OpenOptions::new()
            .append(true)
            .open(store.path_for("s1"))
            .await
            .unwrap();
        let record = CheckpointRecord::new("s1", 2, "B");
        f.write_all(format!("{}\n", serde_json::to_string(&record).unwrap()).as_bytes())
            .await
            .unwrap();
        drop(f);

        assert!(matches!(
            store.save("s1", 2, "B").await,
            Err(CheckpointError::Stale { latest: 2, .. })
        ));
        store.save("s1", 3, "C").await.unwrap();
        let seqs: Vec<u64> = store.history("s1").await.unwrap().iter().map(|r| r.sequence_no).collect();
        assert_eq!(seqs, [1, 2, 3]);
    }

    #[tokio::test]
    async fn test_encoded_name_cannot_collide_with_safe_id() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        assert_ne!(store.path_for(".."), store.path_for("x2e2e"));
        assert_ne!(store.path_for(".."), store.path_for("2e2e"));
        store.save("..", 1, "dots").await.unwrap();
        store.save("x2e2e", 1, "plain").await.unwrap();
        assert_eq!(store.load_latest("..").await.unwrap().unwrap().state_blob, "dots");
        assert_eq!(store.load_latest("x2e2e").await.unwrap().unwrap().state_blob, "plain");
    }
}
