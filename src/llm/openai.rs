//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。
//! Tool 消息以 "Observation from <tool>: ..." 的 user 消息形式送入模型。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs, ChatCompletionStreamOptions,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::llm::{ChunkStream, LlmClient, LlmError, LlmReply, StreamChunk};
use crate::memory::{Message, Role};

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiClient {
    /// api_key 缺省时读取 OPENAI_API_KEY
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    fn to_openai_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let invalid = |e: async_openai::error::OpenAIError| LlmError::InvalidResponse(e.to_string());
        messages
            .iter()
            .map(|m| {
                Ok(match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::Tool => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(format!(
                                "Observation from {}: {}",
                                m.tool.as_deref().unwrap_or("tool"),
                                m.content
                            ))
                            .build()
                            .map_err(invalid)?,
                    ),
                })
            })
            .collect()
    }

    /// 流式请求：要求末尾附带 usage 块，否则兼容端点不会在流中返回用量
    fn stream_request(&self, messages: &[Message]) -> Result<CreateChatCompletionRequest, LlmError> {
        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::to_openai_messages(messages)?)
            .stream(true)
            .stream_options(ChatCompletionStreamOptions {
                include_usage: Some(true),
                include_obfuscation: None,
            })
            .build()
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<LlmReply, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::to_openai_messages(messages)?)
            .build()
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        let total_tokens = response
            .usage
            .as_ref()
            .map(|u| u.total_tokens as u64)
            .unwrap_or(0);

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(LlmReply::new(content, total_tokens))
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<ChunkStream, LlmError> {
        let request = self.stream_request(messages)?;

        let upstream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        let chunks = upstream.flat_map(|item| {
            let out: Vec<Result<StreamChunk, LlmError>> = match item {
                Ok(resp) => {
                    let mut out = Vec::new();
                    let text: String = resp
                        .choices
                        .iter()
                        .filter_map(|c| c.delta.content.clone())
                        .collect();
                    if !text.is_empty() {
                        out.push(Ok(StreamChunk::Delta(text)));
                    }
                    if let Some(usage) = resp.usage {
                        out.push(Ok(StreamChunk::Usage(usage.total_tokens as u64)));
                    }
                    out
                }
                Err(e) => vec![Err(LlmError::Stream(e.to_string()))],
            };
            futures_util::stream::iter(out)
        });

        Ok(Box::pin(chunks))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_message_becomes_observation() {
        let msgs = OpenAiClient::to_openai_messages(&[
            Message::system("sys"),
            Message::user("PER이 뭐야?"),
            Message::tool("lookup_term", "{\"term\":\"PER\"}"),
        ])
        .unwrap();
        assert_eq!(msgs.len(), 3);
        assert!(matches!(msgs[2], ChatCompletionRequestMessage::User(_)));
    }

    #[test]
    fn test_stream_request_asks_for_usage() {
        let client = OpenAiClient::new(Some("http://localhost:1"), "test-model", Some("key"));
        let request = client.stream_request(&[Message::user("ETF가 뭐야?")]).unwrap();
        assert_eq!(request.stream, Some(true));
        assert_eq!(request.stream_options.and_then(|o| o.include_usage), Some(true));
        assert_eq!(request.model, "test-model");
    }
}
