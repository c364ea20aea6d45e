//! 会话数据模型：Session / ToolCallRecord / Difficulty / ContextRef
//!
//! 一个轮次内 Session 由 Orchestrator 独占；检查点保存的是整个 Session 的序列化快照。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::TurnPhase;
use crate::memory::Message;

/// 会话标题最大字符数
const TITLE_MAX_CHARS: usize = 50;

/// 讲解难度
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    #[default]
    Beginner,
    Elementary,
    Intermediate,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Beginner => "beginner",
            Difficulty::Elementary => "elementary",
            Difficulty::Intermediate => "intermediate",
        }
    }
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beginner" => Ok(Difficulty::Beginner),
            "elementary" => Ok(Difficulty::Elementary),
            "intermediate" => Ok(Difficulty::Intermediate),
            other => Err(format!("unknown difficulty: {other}")),
        }
    }
}

/// 上下文引用类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    Briefing,
    Case,
    Comparison,
    Glossary,
}

impl ContextKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextKind::Briefing => "briefing",
            ContextKind::Case => "case",
            ContextKind::Comparison => "comparison",
            ContextKind::Glossary => "glossary",
        }
    }
}

/// 用户当前所看内容的引用，如 `briefing:42`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRef {
    pub kind: ContextKind,
    pub id: i64,
}

impl FromStr for ContextRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("context reference must be <type>:<id>, got {s}"))?;
        let kind = match kind.trim() {
            "briefing" => ContextKind::Briefing,
            "case" => ContextKind::Case,
            "comparison" => ContextKind::Comparison,
            "glossary" => ContextKind::Glossary,
            other => return Err(format!("unknown context type: {other}")),
        };
        let id = id
            .trim()
            .parse::<i64>()
            .map_err(|e| format!("invalid context id: {e}"))?;
        Ok(ContextRef { kind, id })
    }
}

impl fmt::Display for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// 工具调用状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Succeeded,
    Failed,
}

/// 一次工具调用记录；记录结果或失败后即为终态
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub tool: String,
    pub args: Map<String, Value>,
    /// 发起调用的 assistant 消息在 Session.messages 中的下标
    pub message_index: usize,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 会话状态（检查点的完整快照）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: Option<String>,
    pub messages: Vec<Message>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub phase: TurnPhase,
    pub difficulty: Difficulty,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextRef>,
    pub turn_count: u64,
    /// 最近一次成功写入的检查点序号（0 表示尚未持久化）
    pub last_checkpoint_seq: u64,
    /// 最近一轮的错误描述（用户可见文案）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// 最近一轮是否因轮数上限给出了不完整回答
    #[serde(default)]
    pub partial: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, difficulty: Difficulty, context: Option<ContextRef>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: None,
            messages: Vec::new(),
            tool_calls: Vec::new(),
            phase: TurnPhase::Done,
            difficulty,
            context,
            turn_count: 0,
            last_checkpoint_seq: 0,
            last_error: None,
            partial: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// 状态迁移；非法迁移只记录告警（状态机由 loop_ 驱动，此处不应出现）
    pub fn advance(&mut self, next: TurnPhase) {
        if !self.phase.can_transition_to(next) {
            tracing::warn!(session_id = %self.id, from = %self.phase, to = %next, "unexpected phase transition");
        }
        self.phase = next;
        self.updated_at = Utc::now();
    }

    /// 开始新一轮：追加用户消息并进入 RECEIVED
    pub fn begin_turn(&mut self, message: &str) {
        if self.title.is_none() {
            self.title = Some(message.chars().take(TITLE_MAX_CHARS).collect());
        }
        self.messages.push(Message::user(message));
        self.turn_count += 1;
        self.last_error = None;
        self.partial = false;
        self.advance(TurnPhase::Received);
    }

    /// 从未完成的轮次恢复（崩溃或断开后重新加载）：挂起的工具调用标记失败，阶段归为 ERROR
    pub fn recover_interrupted(&mut self) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.fail_pending_tool_calls("interrupted");
        self.last_error = Some("interrupted".to_string());
        self.advance(TurnPhase::Error);
        true
    }

    /// 将仍挂起的工具调用标记为失败，返回标记的条数
    pub fn fail_pending_tool_calls(&mut self, reason: &str) -> usize {
        let mut failed = 0;
        for call in self
            .tool_calls
            .iter_mut()
            .filter(|c| c.status == ToolCallStatus::Pending)
        {
            call.status = ToolCallStatus::Failed;
            call.error = Some(reason.to_string());
            failed += 1;
        }
        failed
    }

    /// 记录模型发起的工具调用，返回其在 tool_calls 中的下标
    pub fn push_tool_call(&mut self, tool: &str, args: Map<String, Value>) -> usize {
        self.messages.push(Message::assistant(
            serde_json::json!({ "tool": tool, "args": args }).to_string(),
        ));
        self.tool_calls.push(ToolCallRecord {
            id: uuid::Uuid::new_v4().to_string(),
            tool: tool.to_string(),
            args,
            message_index: self.messages.len() - 1,
            status: ToolCallStatus::Pending,
            result: None,
            error: None,
        });
        self.tool_calls.len() - 1
    }

    /// 写入工具结果：成功时追加 Tool 消息作为下一轮推理的观察
    pub fn complete_tool_call(&mut self, index: usize, outcome: Result<Value, String>) {
        let Some(call) = self.tool_calls.get_mut(index) else {
            return;
        };
        match outcome {
            Ok(value) => {
                call.status = ToolCallStatus::Succeeded;
                let observation = value.to_string();
                call.result = Some(value);
                let tool = call.tool.clone();
                self.messages.push(Message::tool(tool, observation));
            }
            Err(reason) => {
                call.status = ToolCallStatus::Failed;
                call.error = Some(reason);
            }
        }
        self.updated_at = Utc::now();
    }

    pub fn push_answer(&mut self, text: String, partial: bool) {
        self.messages.push(Message::assistant(text));
        self.partial = partial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;

    #[test]
    fn test_context_ref_parse_and_display() {
        let r: ContextRef = "briefing:42".parse().unwrap();
        assert_eq!(r.kind, ContextKind::Briefing);
        assert_eq!(r.id, 42);
        assert_eq!(r.to_string(), "briefing:42");
        assert!("weather:1".parse::<ContextRef>().is_err());
        assert!("case".parse::<ContextRef>().is_err());
    }

    #[test]
    fn test_difficulty_parse() {
        assert_eq!("Intermediate".parse::<Difficulty>().unwrap(), Difficulty::Intermediate);
        assert!("expert".parse::<Difficulty>().is_err());
    }

    #[test]
    fn test_begin_turn_sets_title_once() {
        let mut s = Session::new("s1", Difficulty::Beginner, None);
        let long = "가".repeat(80);
        s.begin_turn(&long);
        assert_eq!(s.title.as_ref().unwrap().chars().count(), 50);
        s.advance(TurnPhase::Error);
        s.begin_turn("두 번째 질문");
        assert_eq!(s.title.as_ref().unwrap().chars().count(), 50);
        assert_eq!(s.turn_count, 2);
        assert_eq!(s.phase, TurnPhase::Received);
    }

    #[test]
    fn test_tool_call_lifecycle() {
        let mut s = Session::new("s1", Difficulty::Beginner, None);
        s.begin_turn("PER이 뭐야?");
        let mut args = Map::new();
        args.insert("term".into(), Value::String("PER".into()));
        let idx = s.push_tool_call("lookup_term", args);
        assert_eq!(s.tool_calls[idx].status, ToolCallStatus::Pending);
        assert_eq!(s.messages[s.tool_calls[idx].message_index].role, Role::Assistant);

        s.complete_tool_call(idx, Ok(serde_json::json!({"term": "PER"})));
        assert_eq!(s.tool_calls[idx].status, ToolCallStatus::Succeeded);
        assert_eq!(s.messages.last().unwrap().role, Role::Tool);
    }

    #[test]
    fn test_recover_interrupted_marks_pending_failed() {
        let mut s = Session::new("s1", Difficulty::Beginner, None);
        s.begin_turn("질문");
        s.advance(TurnPhase::Guarded);
        s.advance(TurnPhase::Thinking);
        s.advance(TurnPhase::ToolCall);
        s.push_tool_call("lookup_term", Map::new());
        assert!(s.recover_interrupted());
        assert_eq!(s.phase, TurnPhase::Error);
        assert_eq!(s.tool_calls[0].status, ToolCallStatus::Failed);
        assert!(!s.recover_interrupted());
    }
}
