//! 对话消息与模型上下文窗口
//!
//! Session 中的消息只追加不修改；送入模型时只取最近 N 条（默认 40 条 = 20 轮），
//! 超出部分仍保留在会话与检查点中，仅不再进入提示词。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致，另含 Tool 观察结果）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool 消息对应的工具名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool: None,
        }
    }

    pub fn tool(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool: Some(name.into()),
        }
    }
}

/// 模型上下文窗口：从完整历史中截取最近 max_messages 条
#[derive(Clone, Copy, Debug)]
pub struct HistoryWindow {
    max_messages: usize,
}

impl HistoryWindow {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages: max_messages.max(1),
        }
    }

    /// 返回最近的消息切片；窗口起点若落在 Tool 消息上则向后跳过，避免孤立的观察结果
    pub fn apply<'a>(&self, messages: &'a [Message]) -> &'a [Message] {
        if messages.len() <= self.max_messages {
            return messages;
        }
        let mut start = messages.len() - self.max_messages;
        while start < messages.len() && messages[start].role == Role::Tool {
            start += 1;
        }
        &messages[start..]
    }
}

impl Default for HistoryWindow {
    fn default() -> Self {
        Self::new(40)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_keeps_short_history() {
        let msgs = vec![Message::user("Q1"), Message::assistant("A1")];
        assert_eq!(HistoryWindow::new(40).apply(&msgs).len(), 2);
    }

    #[test]
    fn test_window_trims_oldest() {
        let msgs: Vec<Message> = (0..10).map(|i| Message::user(format!("Q{i}"))).collect();
        let window = HistoryWindow::new(4).apply(&msgs);
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].content, "Q6");
    }

    #[test]
    fn test_window_skips_leading_tool_message() {
        let msgs = vec![
            Message::user("Q1"),
            Message::assistant(r#"{"tool": "lookup_term", "args": {"term": "PER"}}"#),
            Message::tool("lookup_term", "{}"),
            Message::assistant("A1"),
        ];
        let window = HistoryWindow::new(2).apply(&msgs);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content, "A1");
    }

    #[test]
    fn test_message_roundtrip_omits_tool_name() {
        let json = serde_json::to_string(&Message::user("hi")).unwrap();
        assert!(!json.contains("tool"));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Message::user("hi"));
    }
}
