//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{ChunkStream, LlmClient, LlmError, LlmReply, StreamChunk};

use crate::config::LlmSection;

/// 按配置创建推理 / 生成用客户端
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    build(cfg, &cfg.model)
}

/// 护栏分类用客户端（guardrail_model 未设置时与主模型相同）
pub fn create_guardrail_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let model = cfg.guardrail_model.as_deref().unwrap_or(&cfg.model);
    build(cfg, model)
}

fn build(cfg: &LlmSection, model: &str) -> Arc<dyn LlmClient> {
    match cfg.provider.as_str() {
        "mock" => {
            tracing::info!("Using mock LLM client");
            Arc::new(MockLlmClient::new())
        }
        _ => {
            tracing::info!(model, base_url = ?cfg.base_url, "Using OpenAI-compatible LLM client");
            Arc::new(OpenAiClient::new(
                cfg.base_url.as_deref(),
                model,
                cfg.api_key.as_deref(),
            ))
        }
    }
}
