//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete（非流式，用于推理与护栏分类）、
//! complete_stream（流式增量，用于 ANSWERING 阶段）。每次调用各自返回 token 用量，
//! 由调用方按轮次累加，不在客户端内部做跨请求累计。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use thiserror::Error;

use crate::memory::Message;

/// 模型后端错误（原始文本只进日志，不进 error 事件）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM API error: {0}")]
    ApiError(String),

    #[error("LLM request timed out: {0}")]
    Timeout(String),

    #[error("Invalid LLM response: {0}")]
    InvalidResponse(String),

    #[error("LLM stream error: {0}")]
    Stream(String),
}

/// 非流式完成结果
#[derive(Debug, Clone, PartialEq)]
pub struct LlmReply {
    pub content: String,
    /// 本次调用消耗的 token（后端未报告时为 0）
    pub total_tokens: u64,
}

impl LlmReply {
    pub fn new(content: impl Into<String>, total_tokens: u64) -> Self {
        Self {
            content: content.into(),
            total_tokens,
        }
    }
}

/// 流式完成的单个片段
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// 文本增量
    Delta(String),
    /// 本次调用的 token 用量（通常在流末尾出现一次）
    Usage(u64),
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// LLM 客户端 trait：非流式完成与流式完成（返回增量流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<LlmReply, LlmError>;

    /// 流式完成；默认实现把 complete 的结果作为单个增量返回
    async fn complete_stream(&self, messages: &[Message]) -> Result<ChunkStream, LlmError> {
        let reply = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![
            Ok(StreamChunk::Delta(reply.content)),
            Ok(StreamChunk::Usage(reply.total_tokens)),
        ])))
    }

    /// 模型名（日志用）
    fn model_name(&self) -> &str {
        "unknown"
    }
}
