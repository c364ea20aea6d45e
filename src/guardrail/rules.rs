//! 规则护栏：正则 + 关键词，纯函数
//!
//! 优先级（先命中者为准）：提示词注入 → 个股投资建议 → 与金融无关。
//! 无关话题只在出现无关标记且不含任何金融词汇时判定，避免误伤“날씨 관련주”这类问题。

use async_trait::async_trait;
use regex::RegexSet;

use super::{preview, GuardCategory, Guardrail, GuardrailDecision};

const INJECTION_PATTERNS: &[&str] = &[
    r"(지침|지시|명령|규칙|프롬프트|설정|역할).{0,12}(무시|잊어|잊고|버려|어겨|해제)",
    r"(?i)ignore\s+(all\s+|any\s+|the\s+)?(previous|prior|above|earlier|your)\s+(instructions?|rules|prompts?|directions)",
    r"(?i)disregard\s+(all\s+|the\s+)?(previous|prior|above|your)",
    r"(?i)(reveal|show|print|repeat)\s+(me\s+)?(your|the)\s+(system\s+)?prompt",
    r"시스템\s*프롬프트",
    r"(?i)\b(jailbreak|developer\s+mode|DAN\s+mode)\b",
    r"(?i)you\s+are\s+now\s+",
    r"탈옥",
    r"(지금부터|이제부터)\s*(너는|넌|당신은)",
];

const ADVICE_PATTERNS: &[&str] = &[
    r"(사도|팔아도|매수해도|매도해도|들어가도|물타도|물타기\s*해도|존버해도|손절해도)\s*(될까|되나|돼|되요|돼요|될지|괜찮)",
    r"(사야|팔아야|매수해야|매도해야|손절해야|익절해야|존버해야)\s*(할까|하나|해|돼|될까|하나요|할지)",
    r"(살까|팔까|매수할까|매도할까|손절할까|익절할까)(요)?\s*(\?|말까|$)",
    r"(추천|찍어).{0,6}(종목|주식|코인)",
    r"(종목|주식|코인).{0,6}(추천해|찍어)",
    r"(?i)should\s+i\s+(buy|sell|hold|short)",
    r"(?i)(which|what)\s+(stock|stocks|shares)\s+(should|to)\s+(i\s+)?buy",
    r"(오를|떨어질)\s*(종목|주식)",
];

const OFF_TOPIC_MARKERS: &[&str] = &[
    "날씨", "기온", "맛집", "레시피", "요리", "영화", "드라마", "게임", "연애", "노래",
    "축구", "야구", "여행", "숙제", "운세", "다이어트", "운동법", "애니", "연예인",
    "weather", "recipe", "movie", "song", "football", "homework", "horoscope",
];

const FINANCE_VOCABULARY: &[&str] = &[
    "주식", "주가", "종목", "금리", "시장", "투자", "채권", "환율", "경제", "기업", "실적",
    "배당", "펀드", "증시", "코스피", "코스닥", "인플레이션", "물가", "재무", "매출", "금융",
    "은행", "증권", "상장", "달러", "원화", "유가", "경기", "관련주", "테마주", "섹터", "수익률",
    "etf", "per", "pbr", "roe", "gdp", "stock", "market", "bond", "interest rate", "inflation",
];

/// 规则护栏；模式编译失败时 patterns 为 None，所有消息按 Unavailable 拦截
pub struct RuleGuardrail {
    patterns: Option<Patterns>,
}

struct Patterns {
    injection: RegexSet,
    advice: RegexSet,
}

impl Default for RuleGuardrail {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleGuardrail {
    pub fn new() -> Self {
        Self::with_patterns(INJECTION_PATTERNS, ADVICE_PATTERNS)
    }

    fn with_patterns(injection: &[&str], advice: &[&str]) -> Self {
        let patterns = match (RegexSet::new(injection), RegexSet::new(advice)) {
            (Ok(injection), Ok(advice)) => Some(Patterns { injection, advice }),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("invalid guardrail pattern, rule classifier will block everything: {}", e);
                None
            }
        };
        Self { patterns }
    }

    /// 同步判定（LayeredGuardrail 与测试直接调用）
    pub fn evaluate(&self, message: &str) -> GuardrailDecision {
        let Some(patterns) = &self.patterns else {
            return GuardrailDecision::block(GuardCategory::Unavailable, "rule patterns failed to compile");
        };
        let text = message.trim();
        if patterns.injection.is_match(text) {
            return GuardrailDecision::block(GuardCategory::PromptInjection, "instruction-override phrasing");
        }
        if patterns.advice.is_match(text) {
            return GuardrailDecision::block(
                GuardCategory::SensitiveAdvice,
                "individualized trading directive requested",
            );
        }
        let lower = text.to_lowercase();
        let off_topic = OFF_TOPIC_MARKERS.iter().any(|m| lower.contains(m));
        if off_topic && !mentions_finance(&lower) {
            return GuardrailDecision::block(GuardCategory::OffTopic, "no finance-domain subject");
        }
        GuardrailDecision::allow("no rule matched")
    }
}

/// 拉丁字母词汇按整词匹配（"per" 不应命中 "super"），韩文词汇按子串匹配
fn mentions_finance(lower: &str) -> bool {
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|w| !w.is_empty())
        .collect();
    FINANCE_VOCABULARY.iter().any(|v| {
        if v.is_ascii() && !v.contains(' ') {
            words.contains(v)
        } else {
            lower.contains(v)
        }
    })
}

#[async_trait]
impl Guardrail for RuleGuardrail {
    async fn classify(&self, message: &str) -> GuardrailDecision {
        let decision = self.evaluate(message);
        if decision.is_allowed() {
            tracing::debug!(guardrail = "rules", message = %preview(message), "allowed");
        } else {
            tracing::info!(guardrail = "rules", category = %decision.category(), message = %preview(message), "blocked");
        }
        decision
    }

    fn name(&self) -> &str {
        "rules"
    }
}
