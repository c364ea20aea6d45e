//! 金融用语工具：lookup_term / get_glossary
//!
//! 数据来自 GlossarySource；关系库由外部服务维护，这里只依赖查询接口。
//! InMemoryGlossary 用于测试与演示。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::Difficulty;
use crate::tools::schema::args_schema;
use crate::tools::{Tool, ToolError};

/// get_glossary 默认条数
const DEFAULT_LIMIT: u32 = 10;
const MAX_LIMIT: u32 = 50;

/// 用语条目
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlossaryTerm {
    pub term: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term_en: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abbreviation: Option<String>,
    pub difficulty: Difficulty,
    /// basic / market / indicator / technical / product / strategy
    pub category: String,
    pub definition_short: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

impl GlossaryTerm {
    fn matches(&self, query: &str) -> bool {
        let q = query.trim().to_lowercase();
        self.term.to_lowercase() == q
            || self.term_en.as_deref().is_some_and(|t| t.to_lowercase() == q)
            || self.abbreviation.as_deref().is_some_and(|a| a.to_lowercase() == q)
    }
}

/// 用语数据源
#[async_trait]
pub trait GlossarySource: Send + Sync {
    async fn lookup(&self, term: &str) -> Result<Option<GlossaryTerm>, String>;

    async fn list(
        &self,
        difficulty: Option<Difficulty>,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<GlossaryTerm>, String>;
}

/// 内存用语表
#[derive(Default)]
pub struct InMemoryGlossary {
    terms: Vec<GlossaryTerm>,
}

impl InMemoryGlossary {
    pub fn new(mut terms: Vec<GlossaryTerm>) -> Self {
        terms.sort_by(|a, b| a.term.cmp(&b.term));
        Self { terms }
    }

    /// 内置的少量基础用语
    pub fn with_defaults() -> Self {
        let t = |term: &str, en: &str, abbr: Option<&str>, difficulty: Difficulty, category: &str, def: &str| GlossaryTerm {
            term: term.to_string(),
            term_en: Some(en.to_string()),
            abbreviation: abbr.map(String::from),
            difficulty,
            category: category.to_string(),
            definition_short: def.to_string(),
            example: None,
            formula: None,
        };
        let mut per = t(
            "주가수익비율",
            "Price Earnings Ratio",
            Some("PER"),
            Difficulty::Elementary,
            "indicator",
            "주가를 주당순이익으로 나눈 값으로, 이익 대비 주가 수준을 보여줍니다.",
        );
        per.formula = Some("PER = 주가 / EPS".to_string());
        Self::new(vec![
            per,
            t(
                "주가순자산비율",
                "Price Book-value Ratio",
                Some("PBR"),
                Difficulty::Elementary,
                "indicator",
                "주가를 주당순자산으로 나눈 값으로, 자산 가치 대비 주가 수준을 보여줍니다.",
            ),
            t(
                "상장지수펀드",
                "Exchange Traded Fund",
                Some("ETF"),
                Difficulty::Beginner,
                "product",
                "지수를 따라가도록 설계되어 주식처럼 거래소에서 사고팔 수 있는 펀드입니다.",
            ),
            t(
                "기준금리",
                "Base Rate",
                None,
                Difficulty::Beginner,
                "market",
                "중앙은행이 정하는 정책 금리로, 시중 금리의 기준이 됩니다.",
            ),
            t(
                "배당",
                "Dividend",
                None,
                Difficulty::Beginner,
                "basic",
                "기업이 이익의 일부를 주주에게 나눠주는 것입니다.",
            ),
            t(
                "자기자본이익률",
                "Return on Equity",
                Some("ROE"),
                Difficulty::Intermediate,
                "indicator",
                "자기자본 대비 순이익의 비율로, 주주 돈을 얼마나 효율적으로 썼는지 보여줍니다.",
            ),
        ])
    }
}

#[async_trait]
impl GlossarySource for InMemoryGlossary {
    async fn lookup(&self, term: &str) -> Result<Option<GlossaryTerm>, String> {
        Ok(self.terms.iter().find(|t| t.matches(term)).cloned())
    }

    async fn list(
        &self,
        difficulty: Option<Difficulty>,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<GlossaryTerm>, String> {
        Ok(self
            .terms
            .iter()
            .filter(|t| difficulty.map_or(true, |d| t.difficulty == d))
            .filter(|t| category.map_or(true, |c| t.category == c))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct LookupTermArgs {
    /// 조회할 용어 (한글명, 영문명 또는 약어)
    term: String,
}

/// 단일 용어 조회
pub struct LookupTermTool {
    source: Arc<dyn GlossarySource>,
}

impl LookupTermTool {
    pub fn new(source: Arc<dyn GlossarySource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Tool for LookupTermTool {
    fn name(&self) -> &str {
        "lookup_term"
    }

    fn description(&self) -> &str {
        "Look up a single financial term (Korean name, English name or abbreviation) and return its definition."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<LookupTermArgs>()
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<Value, ToolError> {
        let args: LookupTermArgs = decode_args(self.name(), args)?;
        let found = self.source.lookup(&args.term).await.map_err(ToolError::Execution)?;
        Ok(match found {
            Some(term) => serde_json::to_value(term).map_err(|e| ToolError::Execution(e.to_string()))?,
            None => serde_json::json!({ "found": false, "term": args.term }),
        })
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetGlossaryArgs {
    /// beginner / elementary / intermediate
    difficulty: Option<String>,
    /// basic / market / indicator / technical / product / strategy
    category: Option<String>,
    /// 최대 개수 (기본 10)
    limit: Option<u32>,
}

/// 난이도 / 분류별 용어 목록
pub struct GetGlossaryTool {
    source: Arc<dyn GlossarySource>,
}

impl GetGlossaryTool {
    pub fn new(source: Arc<dyn GlossarySource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Tool for GetGlossaryTool {
    fn name(&self) -> &str {
        "get_glossary"
    }

    fn description(&self) -> &str {
        "List financial terms, optionally filtered by difficulty and category."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<GetGlossaryArgs>()
    }

    async fn execute(&self, args: Map<String, Value>) -> Result<Value, ToolError> {
        let args: GetGlossaryArgs = decode_args(self.name(), args)?;
        let difficulty = args
            .difficulty
            .as_deref()
            .map(str::parse::<Difficulty>)
            .transpose()
            .map_err(|reason| ToolError::InvalidArgs {
                tool: self.name().to_string(),
                reason,
            })?;
        let limit = args.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT) as usize;
        let terms = self
            .source
            .list(difficulty, args.category.as_deref(), limit)
            .await
            .map_err(ToolError::Execution)?;
        Ok(serde_json::json!({ "count": terms.len(), "items": terms }))
    }
}

fn decode_args<T: serde::de::DeserializeOwned>(tool: &str, args: Map<String, Value>) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(args)).map_err(|e| ToolError::InvalidArgs {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolRegistry;
    use serde_json::json;

    fn registry() -> ToolRegistry {
        let source: Arc<dyn GlossarySource> = Arc::new(InMemoryGlossary::with_defaults());
        let mut reg = ToolRegistry::new();
        reg.register(LookupTermTool::new(source.clone()));
        reg.register(GetGlossaryTool::new(source));
        reg
    }

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_lookup_by_abbreviation() {
        let out = registry()
            .invoke("lookup_term", map(json!({"term": "per"})))
            .await
            .unwrap();
        assert_eq!(out["term"], "주가수익비율");
        assert_eq!(out["formula"], "PER = 주가 / EPS");
    }

    #[tokio::test]
    async fn test_lookup_missing_term() {
        let out = registry()
            .invoke("lookup_term", map(json!({"term": "없는용어"})))
            .await
            .unwrap();
        assert_eq!(out["found"], false);
    }

    #[tokio::test]
    async fn test_glossary_filters() {
        let reg = registry();
        let out = reg
            .invoke("get_glossary", map(json!({"category": "indicator", "limit": 2})))
            .await
            .unwrap();
        assert_eq!(out["count"], 2);

        let out = reg
            .invoke("get_glossary", map(json!({"difficulty": "beginner"})))
            .await
            .unwrap();
        assert_eq!(out["count"], 3);
    }

    #[tokio::test]
    async fn test_bad_difficulty_rejected() {
        let err = registry()
            .invoke("get_glossary", map(json!({"difficulty": "expert"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs { .. }));
    }
}
