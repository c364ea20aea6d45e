//! 会话监管：同一会话同时只允许一个进行中的轮次
//!
//! 采用“忙即拒绝”：已有轮次在进行时，新的轮次拿不到租约，由调用方返回 SessionBusy。
//! 租约（SessionLease）在 Drop 时释放；不同会话之间互不影响。

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// 进行中会话集合
#[derive(Debug, Clone, Default)]
pub struct SessionGate {
    active: Arc<Mutex<HashSet<String>>>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试占用会话；已被占用时返回 None
    pub fn try_acquire(&self, session_id: &str) -> Option<SessionLease> {
        let mut active = lock(&self.active);
        if !active.insert(session_id.to_string()) {
            return None;
        }
        Some(SessionLease {
            active: Arc::clone(&self.active),
            session_id: session_id.to_string(),
        })
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        lock(&self.active).contains(session_id)
    }

    /// 当前进行中的轮次数（停机时等待其归零）
    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }
}

/// 会话占用租约
#[derive(Debug)]
pub struct SessionLease {
    active: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.session_id);
    }
}

// 临界区内没有会 panic 的操作；中毒时照常使用内部数据
fn lock(m: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
