//! 事件编码：TurnEvent → 线上帧（JSON 对象，一帧一个事件）
//!
//! 无状态、对事件全集是全函数。可选字段缺失时直接省略（不输出 null），
//! 客户端可把字段是否存在与 `type` 一起当作类型判别。

use serde::Serialize;
use serde_json::{Map, Value};

use crate::react::{EventPayload, TurnEvent};

/// 一帧
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 护栏拦截类别（仅 done）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardrail: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_message: Option<String>,
    /// 因工具轮数上限给出的回答（仅 done，且仅为 true 时出现）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
}

pub fn encode(event: &TurnEvent) -> WireFrame {
    let mut frame = WireFrame {
        kind: event.kind(),
        session_id: (!event.session_id.is_empty()).then(|| event.session_id.clone()),
        ..WireFrame::default()
    };
    match &event.payload {
        EventPayload::Thinking { content } | EventPayload::TextDelta { content } => {
            frame.content = Some(content.clone());
        }
        EventPayload::ToolCall { tool, args } => {
            frame.tool = Some(tool.clone());
            frame.args = Some(args.clone());
        }
        EventPayload::Done(summary) => {
            frame.total_tokens = Some(summary.total_tokens);
            frame.partial = summary.partial.then_some(true);
            if let Some(block) = &summary.block {
                frame.guardrail = Some(block.category.as_str());
                frame.block_message = Some(block.message.clone());
            }
        }
        EventPayload::Error { message } => {
            frame.error = Some(message.clone());
        }
    }
    frame
}

impl WireFrame {
    pub fn to_json(&self) -> String {
        // 字段均为字符串 / 数字 / JSON 对象，序列化不会失败
        serde_json::to_string(self).unwrap_or_else(|_| format!(r#"{{"type":"{}"}}"#, self.kind))
    }

    /// `event: <type>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.kind, self.to_json())
    }
}
