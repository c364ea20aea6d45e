//! 护栏：每轮对话前判定用户消息是否在服务范围内
//!
//! 判定结果只有两种：`Allow` 与 `Block`。`GuardrailDecision` 不实现 Default，
//! 字段私有，唯一能产生 Allow 的构造器是 [`GuardrailDecision::allow`]；
//! 分类器出错、超时、输出无法解析时一律构造 Block(Unavailable)。
//!
//! - [`RuleGuardrail`]: 正则 / 关键词规则，纯函数，无外部依赖
//! - [`LlmGuardrail`]: 模型分类（JSON 协议，解析失败重试）
//! - [`LayeredGuardrail`]: 先规则、后模型；规则 Block 即最终结果

pub mod llm;
pub mod rules;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use llm::LlmGuardrail;
pub use rules::RuleGuardrail;

use crate::config::GuardrailSection;
use crate::llm::LlmClient;

pub const ADVICE_BLOCK_MESSAGE: &str = "죄송합니다만, 특정 종목에 대한 투자 자문(매수/매도 추천 등)은 자본시장법상 제공해 드릴 수 없습니다. 기업의 객관적인 재무 지표나 시장 동향에 대해서라면 답변해 드릴 수 있어요!";
pub const OFF_TOPIC_BLOCK_MESSAGE: &str = "저는 주식 및 금융/투자 학습을 돕기 위해 만들어진 튜터입니다. 관련이 없는 일상 대화나 다른 주제에 대해서는 도움을 드리기 어려워요.";
pub const INJECTION_BLOCK_MESSAGE: &str = "부적절하거나 안전하지 않은 요청이 감지되었습니다. 건전한 투자 학습을 위한 질문을 부탁드립니다.";
pub const UNAVAILABLE_BLOCK_MESSAGE: &str = "일시적인 오류가 발생했어요. 잠시 후 다시 시도해 주세요 🙏";

/// 判定
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Allow,
    Block,
}

/// 命中的类别（Allow 时为 None）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardCategory {
    None,
    PromptInjection,
    SensitiveAdvice,
    OffTopic,
    /// 分类后端不可用（超时 / 传输失败 / 输出无法解析）
    Unavailable,
}

impl GuardCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardCategory::None => "none",
            GuardCategory::PromptInjection => "prompt_injection",
            GuardCategory::SensitiveAdvice => "sensitive_advice",
            GuardCategory::OffTopic => "off_topic",
            GuardCategory::Unavailable => "unavailable",
        }
    }

    /// 面向用户的拦截文案
    pub fn block_message(self) -> &'static str {
        match self {
            GuardCategory::SensitiveAdvice => ADVICE_BLOCK_MESSAGE,
            GuardCategory::OffTopic => OFF_TOPIC_BLOCK_MESSAGE,
            GuardCategory::PromptInjection => INJECTION_BLOCK_MESSAGE,
            GuardCategory::Unavailable | GuardCategory::None => UNAVAILABLE_BLOCK_MESSAGE,
        }
    }
}

impl fmt::Display for GuardCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 护栏判定结果
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GuardrailDecision {
    verdict: Verdict,
    category: GuardCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    block_message: Option<String>,
    reasoning: String,
}

impl GuardrailDecision {
    /// 放行
    pub fn allow(reasoning: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Allow,
            category: GuardCategory::None,
            block_message: None,
            reasoning: reasoning.into(),
        }
    }

    /// 拦截；category 为 None 时视为无法归类，按 Unavailable 处理
    pub fn block(category: GuardCategory, reasoning: impl Into<String>) -> Self {
        let category = match category {
            GuardCategory::None => GuardCategory::Unavailable,
            other => other,
        };
        Self {
            verdict: Verdict::Block,
            category,
            block_message: Some(category.block_message().to_string()),
            reasoning: reasoning.into(),
        }
    }

    pub fn unavailable(reasoning: impl Into<String>) -> Self {
        Self::block(GuardCategory::Unavailable, reasoning)
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    pub fn category(&self) -> GuardCategory {
        self.category
    }

    pub fn block_message(&self) -> Option<&str> {
        self.block_message.as_deref()
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }
}

/// 护栏分类器；签名上不可失败，内部错误必须折叠为 Block
#[async_trait]
pub trait Guardrail: Send + Sync {
    async fn classify(&self, message: &str) -> GuardrailDecision;

    fn name(&self) -> &str;
}

/// 带超时的分类：超时按 Block(Unavailable) 处理
pub async fn classify_with_timeout(
    guardrail: &dyn Guardrail,
    message: &str,
    timeout: Duration,
) -> GuardrailDecision {
    match tokio::time::timeout(timeout, guardrail.classify(message)).await {
        Ok(decision) => decision,
        Err(_) => {
            tracing::warn!(guardrail = guardrail.name(), timeout_ms = timeout.as_millis() as u64, "guardrail timed out, failing closed");
            GuardrailDecision::unavailable("classification timed out")
        }
    }
}

/// 先规则后模型
pub struct LayeredGuardrail {
    rules: RuleGuardrail,
    model: Arc<dyn Guardrail>,
}

impl LayeredGuardrail {
    pub fn new(rules: RuleGuardrail, model: Arc<dyn Guardrail>) -> Self {
        Self { rules, model }
    }
}

#[async_trait]
impl Guardrail for LayeredGuardrail {
    async fn classify(&self, message: &str) -> GuardrailDecision {
        let decision = self.rules.evaluate(message);
        if !decision.is_allowed() {
            return decision;
        }
        self.model.classify(message).await
    }

    fn name(&self) -> &str {
        "layered"
    }
}

/// 按配置创建护栏：`rules` 仅规则；`layered` 规则 + 模型
pub fn create_guardrail_from_config(cfg: &GuardrailSection, llm: Arc<dyn LlmClient>) -> Arc<dyn Guardrail> {
    match cfg.mode.as_str() {
        "layered" => Arc::new(LayeredGuardrail::new(
            RuleGuardrail::new(),
            Arc::new(LlmGuardrail::new(llm, cfg.max_parse_retries)),
        )),
        _ => Arc::new(RuleGuardrail::new()),
    }
}

/// 日志用的消息预览
pub(crate) fn preview(message: &str) -> String {
    const PREVIEW_CHARS: usize = 40;
    let mut s: String = message.chars().take(PREVIEW_CHARS).collect();
    if message.chars().count() > PREVIEW_CHARS {
        s.push_str("...");
    }
    s
}
