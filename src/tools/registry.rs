//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! invoke 先按声明的参数 schema 校验参数，校验通过才调用工具；ToolExecutor 在此之上加超时与审计日志。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::tools::schema::validate_args;

/// 工具边界错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArgs { tool: String, reason: String },

    #[error("Tool failed: {0}")]
    Execution(String),
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；args 已通过 schema 校验
    async fn execute(&self, args: Map<String, Value>) -> Result<Value, ToolError>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>（有序，保证提示词中工具顺序稳定）
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 校验参数后调用
    pub async fn invoke(&self, name: &str, args: Map<String, Value>) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        validate_args(&tool.parameters_schema(), &args).map_err(|reason| ToolError::InvalidArgs {
            tool: name.to_string(),
            reason,
        })?;
        tool.execute(args).await
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 返回 (name, description) 列表
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect()
    }

    /// 工具清单 JSON（名称、描述、参数 schema），拼入推理提示词
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(|(name, tool)| {
                serde_json::json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "Uppercase text"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }

        async fn execute(&self, args: Map<String, Value>) -> Result<Value, ToolError> {
            let text = args.get("text").and_then(|v| v.as_str()).unwrap_or_default();
            Ok(Value::String(text.to_uppercase()))
        }
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_invoke_validates_before_execute() {
        let mut reg = ToolRegistry::new();
        reg.register(Upper);

        let ok = reg.invoke("upper", args(serde_json::json!({"text": "etf"}))).await;
        assert_eq!(ok.unwrap(), Value::String("ETF".into()));

        let missing = reg.invoke("upper", Map::new()).await;
        assert!(matches!(missing, Err(ToolError::InvalidArgs { .. })));

        let wrong_type = reg.invoke("upper", args(serde_json::json!({"text": 3}))).await;
        assert!(matches!(wrong_type, Err(ToolError::InvalidArgs { .. })));

        let unknown_key = reg
            .invoke("upper", args(serde_json::json!({"text": "a", "rm": "-rf"})))
            .await;
        assert!(matches!(unknown_key, Err(ToolError::InvalidArgs { .. })));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let reg = ToolRegistry::new();
        assert_eq!(
            reg.invoke("buy_stock", Map::new()).await,
            Err(ToolError::NotFound("buy_stock".into()))
        );
    }

    #[test]
    fn test_schema_json_lists_tools() {
        let mut reg = ToolRegistry::new();
        reg.register(Upper);
        let json: Value = serde_json::from_str(&reg.to_schema_json()).unwrap();
        assert_eq!(json[0]["name"], "upper");
        assert_eq!(json[0]["parameters"]["required"][0], "text");
        assert_eq!(reg.tool_names(), vec!["upper".to_string()]);
    }
}
