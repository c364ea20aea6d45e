//! 内存检查点存储
//!
//! 外层 RwLock 只在首次创建会话槽位时写锁；每个会话一个独立 Mutex，
//! 不同会话的 save 互不阻塞，同一会话的 save 串行化后做序号校验。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::{CheckpointError, CheckpointRecord, CheckpointStore};

type Slot = Arc<Mutex<Vec<CheckpointRecord>>>;

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    slots: RwLock<HashMap<String, Slot>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, session_id: &str) -> Slot {
        if let Some(slot) = self.slots.read().await.get(session_id) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(session_id.to_string()).or_default())
    }

    async fn existing_slot(&self, session_id: &str) -> Option<Slot> {
        self.slots.read().await.get(session_id).cloned()
    }

    /// 已记录的会话数
    pub async fn session_count(&self) -> usize {
        self.slots.read().await.len()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, session_id: &str, sequence_no: u64, state: &str) -> Result<(), CheckpointError> {
        let slot = self.slot(session_id).await;
        let mut records = slot.lock().await;
        let latest = records.last().map(|r| r.sequence_no).unwrap_or(0);
        if sequence_no <= latest {
            return Err(CheckpointError::Stale {
                session_id: session_id.to_string(),
                sequence_no,
                latest,
            });
        }
        records.push(CheckpointRecord::new(session_id, sequence_no, state));
        Ok(())
    }

    async fn load_latest(&self, session_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let Some(slot) = self.existing_slot(session_id).await else {
            return Ok(None);
        };
        let records = slot.lock().await;
        Ok(records.last().cloned())
    }

    async fn history(&self, session_id: &str) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let Some(slot) = self.existing_slot(session_id).await else {
            return Ok(Vec::new());
        };
        let records = slot.lock().await;
        Ok(records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latest_wins() {
        let store = InMemoryCheckpointStore::new();
        store.save("s1", 1, "A").await.unwrap();
        store.save("s1", 2, "B").await.unwrap();
        let latest = store.load_latest("s1").await.unwrap().unwrap();
        assert_eq!(latest.sequence_no, 2);
        assert_eq!(latest.state_blob, "B");
    }

    #[tokio::test]
    async fn test_stale_write_rejected() {
        let store = InMemoryCheckpointStore::new();
        store.save("s1", 2, "A").await.unwrap();
        let same = store.save("s1", 2, "B").await;
        assert!(matches!(same, Err(CheckpointError::Stale { latest: 2, .. })));
        let lower = store.save("s1", 1, "C").await;
        assert!(matches!(lower, Err(CheckpointError::Stale { .. })));
        assert_eq!(store.load_latest("s1").await.unwrap().unwrap().state_blob, "A");
    }

    #[tokio::test]
    async fn test_sequence_zero_rejected() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.save("s1", 0, "A").await.is_err());
        store.save("s1", 1, "A").await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_session_not_found() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.load_latest("missing").await.unwrap().is_none());
        assert!(store.history("missing").await.unwrap().is_empty());
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_history_keeps_older_records() {
        let store = InMemoryCheckpointStore::new();
        for seq in 1..=3 {
            store.save("s1", seq, &format!("v{seq}")).await.unwrap();
        }
        let history = store.history("s1").await.unwrap();
        let seqs: Vec<u64> = history.iter().map(|r| r.sequence_no).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_do_not_interfere() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let id = format!("s{i}");
                for seq in 1..=20 {
                    store.save(&id, seq, "x").await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        for i in 0..8 {
            let latest = store.load_latest(&format!("s{i}")).await.unwrap().unwrap();
            assert_eq!(latest.sequence_no, 20);
        }
    }

    #[tokio::test]
    async fn test_concurrent_same_seq_only_one_wins() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut handles = Vec::new();
        for i in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.save("shared", 1, &format!("writer{i}")).await.is_ok()
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
