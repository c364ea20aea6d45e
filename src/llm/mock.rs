//! Mock LLM 客户端（用于测试与本地演示，无需 API）
//!
//! 推理调用（complete）按脚本依次返回预设输出，脚本用尽后返回 fallback；
//! 流式回答默认回显最后一条用户消息。可注入延迟与错误以模拟超时、断流。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::llm::{ChunkStream, LlmClient, LlmError, LlmReply, StreamChunk};
use crate::memory::{Message, Role};

pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: String,
    answer: Option<String>,
    answer_error: Option<LlmError>,
    delay: Duration,
    chunk_delay: Duration,
    tokens_per_call: u64,
    complete_calls: AtomicUsize,
    stream_calls: AtomicUsize,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    /// 默认：推理直接给出回答（不调工具），流式回显用户问题
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: r#"{"tool": "", "args": {}}"#.to_string(),
            answer: None,
            answer_error: None,
            delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            tokens_per_call: 10,
            complete_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
        }
    }

    /// 追加一条 complete 输出
    pub fn push_reply(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()))
    }

    /// 追加一次 complete 失败
    pub fn push_error(self, err: LlmError) -> Self {
        self.push(Err(err))
    }

    fn push(self, item: Result<String, LlmError>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(item);
        }
        self
    }

    /// 脚本用尽后的 complete 输出
    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = text.into();
        self
    }

    /// 流式回答文本
    pub fn with_answer(mut self, text: impl Into<String>) -> Self {
        self.answer = Some(text.into());
        self
    }

    /// 流式回答在开始时失败
    pub fn with_answer_error(mut self, err: LlmError) -> Self {
        self.answer_error = Some(err);
        self
    }

    /// 每次调用前的等待
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// 流式回答每个增量之间的等待
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_tokens_per_call(mut self, tokens: u64) -> Self {
        self.tokens_per_call = tokens;
        self
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    fn last_user(messages: &[Message]) -> &str {
        messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)")
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<LlmReply, LlmError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self
            .script
            .lock()
            .map_err(|_| LlmError::ApiError("mock script poisoned".to_string()))?
            .pop_front();
        let content = match next {
            Some(item) => item?,
            None => self.fallback.clone(),
        };
        Ok(LlmReply::new(content, self.tokens_per_call))
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<ChunkStream, LlmError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = &self.answer_error {
            return Err(err.clone());
        }
        let text = self
            .answer
            .clone()
            .unwrap_or_else(|| format!("모의 답변: {}", Self::last_user(messages)));

        // 按空白切分并保留空白，拼接后与原文一致
        let mut pieces: Vec<Result<StreamChunk, LlmError>> = text
            .split_inclusive(' ')
            .map(|p| Ok(StreamChunk::Delta(p.to_string())))
            .collect();
        pieces.push(Ok(StreamChunk::Usage(self.tokens_per_call)));

        let chunk_delay = self.chunk_delay;
        let chunks = stream::iter(pieces).then(move |c| async move {
            if !chunk_delay.is_zero() {
                tokio::time::sleep(chunk_delay).await;
            }
            c
        });
        Ok(Box::pin(chunks))
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_fallback() {
        let llm = MockLlmClient::new()
            .push_reply("first")
            .push_error(LlmError::ApiError("boom".into()))
            .with_fallback("rest");
        let msgs = [Message::user("q")];
        assert_eq!(llm.complete(&msgs).await.unwrap().content, "first");
        assert!(llm.complete(&msgs).await.is_err());
        assert_eq!(llm.complete(&msgs).await.unwrap().content, "rest");
        assert_eq!(llm.complete_calls(), 3);
    }

    #[tokio::test]
    async fn test_stream_reassembles_answer() {
        let llm = MockLlmClient::new().with_answer("금리 인하는 채권 가격을 올립니다.");
        let chunks: Vec<_> = llm
            .complete_stream(&[Message::user("q")])
            .await
            .unwrap()
            .collect()
            .await;
        let text: String = chunks
            .iter()
            .filter_map(|c| match c {
                Ok(StreamChunk::Delta(d)) => Some(d.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "금리 인하는 채권 가격을 올립니다.");
        assert!(matches!(chunks.last(), Some(Ok(StreamChunk::Usage(10)))));
    }

    #[tokio::test]
    async fn test_default_answer_echoes_user() {
        let llm = MockLlmClient::new();
        let chunks: Vec<_> = llm
            .complete_stream(&[Message::user("ETF란?")])
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(&chunks[0], Ok(StreamChunk::Delta(d)) if d.starts_with("모의")));
    }
}
