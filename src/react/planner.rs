//! Planner：推理决策与 Tool Call 解析
//!
//! 推理阶段调用 LLM 得到 JSON Tool Call 或“可以回答”；parse_llm_output 从文本中提取 JSON。
//! 回答阶段用不含工具协议的系统提示词流式生成。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm::{ChunkStream, LlmClient, LlmError};
use crate::memory::Message;

/// LLM 返回的 Tool Call（{"tool": "lookup_term", "args": {"term": "PER"}}）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// Planner 输出
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// 不再需要工具，进入回答阶段（附模型原文，仅用于日志）
    Response(String),
    /// 需要执行工具
    ToolCall(ToolCall),
}

/// 解析 LLM 输出：若含有效 JSON 且 tool 非空则为 ToolCall，否则为 Response
pub fn parse_llm_output(output: &str) -> Result<PlannerOutput, serde_json::Error> {
    let trimmed = output.trim();

    // 尝试提取 JSON 块（```json ... ``` 或纯 JSON）
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let Some(start) = trimmed.find('{') {
        match trimmed.rfind('}') {
            Some(end) if end > start => &trimmed[start..=end],
            _ => trimmed,
        }
    } else {
        return Ok(PlannerOutput::Response(trimmed.to_string()));
    };

    let parsed: ToolCall = serde_json::from_str(json_str)?;

    if parsed.tool.trim().is_empty() {
        Ok(PlannerOutput::Response(trimmed.to_string()))
    } else {
        Ok(PlannerOutput::ToolCall(parsed))
    }
}

/// 一次推理的结果与用量
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub output: PlannerOutput,
    pub total_tokens: u64,
}

/// Planner：持有 LLM，负责 decide（推理）与 answer（流式回答）
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// 推理：system + 历史 → ToolCall 或 Response；无法解析的输出按 Response 处理（回答阶段会重新生成）
    pub async fn decide(&self, system: &str, history: &[Message]) -> Result<PlanStep, LlmError> {
        let mut full_messages = Vec::with_capacity(history.len() + 1);
        full_messages.push(Message::system(system));
        full_messages.extend_from_slice(history);
        let reply = self.llm.complete(&full_messages).await?;
        let output = match parse_llm_output(&reply.content) {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!("planner output is not a valid tool call, answering directly: {}", e);
                PlannerOutput::Response(reply.content.clone())
            }
        };
        Ok(PlanStep {
            output,
            total_tokens: reply.total_tokens,
        })
    }

    /// 回答：流式生成
    pub async fn answer(&self, system: &str, history: &[Message]) -> Result<ChunkStream, LlmError> {
        let mut full_messages = Vec::with_capacity(history.len() + 1);
        full_messages.push(Message::system(system));
        full_messages.extend_from_slice(history);
        self.llm.complete_stream(&full_messages).await
    }
}
