//! 轮次状态机
//!
//! RECEIVED → GUARDED → THINKING → (TOOL_CALL ⇄ THINKING)* → ANSWERING → DONE，
//! 任一状态均可进入 ERROR；GUARDED 被护栏拦截时直接进入 DONE。

use serde::{Deserialize, Serialize};

/// 轮次阶段（随检查点持久化）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnPhase {
    Received,
    Guarded,
    Thinking,
    ToolCall,
    Answering,
    Done,
    Error,
}

impl TurnPhase {
    /// DONE / ERROR 为终态，会话可直接接收下一条消息
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnPhase::Done | TurnPhase::Error)
    }

    /// 合法迁移表
    pub fn can_transition_to(self, next: TurnPhase) -> bool {
        use TurnPhase::*;
        if next == Error {
            return true;
        }
        matches!(
            (self, next),
            (Done, Received)
                | (Error, Received)
                | (Received, Guarded)
                | (Guarded, Thinking)
                | (Guarded, Done)
                | (Thinking, ToolCall)
                | (Thinking, Answering)
                | (ToolCall, Thinking)
                | (Answering, Done)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TurnPhase::Received => "RECEIVED",
            TurnPhase::Guarded => "GUARDED",
            TurnPhase::Thinking => "THINKING",
            TurnPhase::ToolCall => "TOOL_CALL",
            TurnPhase::Answering => "ANSWERING",
            TurnPhase::Done => "DONE",
            TurnPhase::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
