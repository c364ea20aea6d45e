//! 轮次事件：Orchestrator 按发出顺序推送，由 stream::encoder 编码为线上帧
//!
//! 每个轮次以且仅以一个终止事件（Done / Error）结束。

use serde_json::{Map, Value};

use crate::guardrail::GuardCategory;

/// 单个轮次事件
#[derive(Debug, Clone, PartialEq)]
pub struct TurnEvent {
    pub session_id: String,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// 进入推理阶段（状态文本）
    Thinking { content: String },
    /// 调用工具
    ToolCall { tool: String, args: Map<String, Value> },
    /// 回答增量
    TextDelta { content: String },
    /// 正常结束（含被护栏拦截）
    Done(DoneSummary),
    /// 失败结束；message 为面向用户的简短描述
    Error { message: String },
}

/// 护栏拦截信息
#[derive(Debug, Clone, PartialEq)]
pub struct BlockNotice {
    pub category: GuardCategory,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DoneSummary {
    pub total_tokens: u64,
    /// 因工具轮数上限被迫回答
    pub partial: bool,
    pub block: Option<BlockNotice>,
}

impl TurnEvent {
    pub fn new(session_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            session_id: session_id.into(),
            payload,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.payload, EventPayload::Done(_) | EventPayload::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            EventPayload::Thinking { .. } => "thinking",
            EventPayload::ToolCall { .. } => "tool_call",
            EventPayload::TextDelta { .. } => "text_delta",
            EventPayload::Done(_) => "done",
            EventPayload::Error { .. } => "error",
        }
    }
}
