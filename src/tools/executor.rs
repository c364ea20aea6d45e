//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(tool_name, args) 在超时内调用 registry.invoke，
//! 超时或失败时转为 TutorError（ToolTimeout / ToolExecution / HallucinatedTool）；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::time::timeout;

use crate::core::TutorError;
use crate::tools::{Tool, ToolError, ToolRegistry};

/// 工具执行器：对每次调用施加超时，并将结果映射为 TutorError
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn from_secs(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self::new(registry, Duration::from_secs(timeout_secs))
    }

    /// 执行指定工具；输出 JSON 审计日志
    pub async fn execute(&self, tool_name: &str, args: Map<String, Value>) -> Result<Value, TutorError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, self.registry.invoke(tool_name, args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(ToolError::NotFound(_))) => (false, "unknown_tool"),
            Ok(Err(ToolError::InvalidArgs { .. })) => (false, "invalid_args"),
            Ok(Err(ToolError::Execution(_))) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ToolError::NotFound(name))) => Err(TutorError::HallucinatedTool(name)),
            Ok(Err(e)) => Err(TutorError::ToolExecution {
                tool: tool_name.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(TutorError::ToolTimeout(tool_name.to_string())),
        }
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

fn args_preview(args: &Map<String, Value>) -> String {
    let s = Value::Object(args.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Slow;

    #[async_trait]
    impl Tool for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "never finishes in time"
        }

        async fn execute(&self, _args: Map<String, Value>) -> Result<Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn execute(&self, _args: Map<String, Value>) -> Result<Value, ToolError> {
            Err(ToolError::Execution("db connection refused".into()))
        }
    }

    fn executor() -> ToolExecutor {
        let mut reg = ToolRegistry::new();
        reg.register(Slow);
        reg.register(Broken);
        ToolExecutor::new(reg, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_timeout_maps_to_tool_timeout() {
        let err = executor().execute("slow", Map::new()).await.unwrap_err();
        assert!(matches!(err, TutorError::ToolTimeout(ref t) if t == "slow"));
    }

    #[tokio::test]
    async fn test_failure_names_tool() {
        let err = executor().execute("broken", Map::new()).await.unwrap_err();
        assert_eq!(err.tool_name(), Some("broken"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_hallucination() {
        let err = executor().execute("buy_stock", Map::new()).await.unwrap_err();
        assert!(matches!(err, TutorError::HallucinatedTool(_)));
    }

    #[test]
    fn test_args_preview_truncates() {
        let mut args = Map::new();
        args.insert("term".into(), Value::String("가".repeat(500)));
        assert!(args_preview(&args).ends_with("..."));
    }
}
