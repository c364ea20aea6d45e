//! 导师核心错误类型
//!
//! 所有组件错误在 Orchestrator 边界统一转换为 `error` 事件；
//! 对外只暴露 `user_message()` 给出的简短文案，不泄露后端原始错误。

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::llm::LlmError;

/// 一次对话轮次中可能出现的错误
#[derive(Error, Debug)]
pub enum TutorError {
    /// 请求不合法（如空消息），在进入状态机之前拒绝
    #[error("Validation error: {0}")]
    Validation(String),

    /// 同一会话已有进行中的轮次
    #[error("Session busy: {0}")]
    SessionBusy(String),

    #[error("Tool execution failed: {tool}: {reason}")]
    ToolExecution { tool: String, reason: String },

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 模型请求了未注册的工具
    #[error("Hallucinated tool: {0}")]
    HallucinatedTool(String),

    /// 上游（生成）调用超时
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// 检查点写入在重试预算耗尽后仍失败
    #[error("Persistence failure: {0}")]
    Persistence(#[from] CheckpointError),

    /// 传输层断开，轮次被取消
    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

impl TutorError {
    /// 面向用户的简短描述（进入 `error` 事件的唯一文本）
    pub fn user_message(&self) -> String {
        match self {
            TutorError::Validation(_) => "메시지를 입력해 주세요.".to_string(),
            TutorError::SessionBusy(_) => {
                "이전 질문에 답변하는 중이에요. 답변이 끝난 뒤 다시 질문해 주세요.".to_string()
            }
            TutorError::ToolExecution { tool, .. } | TutorError::ToolTimeout(tool) => {
                format!("도구 실행에 실패했습니다: {tool}")
            }
            // 名称来自模型输出，不回显
            TutorError::HallucinatedTool(_) => "지원하지 않는 도구를 요청했습니다.".to_string(),
            TutorError::UpstreamTimeout(_) => {
                "응답 시간이 초과되었습니다. 잠시 후 다시 시도해 주세요.".to_string()
            }
            TutorError::Llm(_) => "일시적인 오류가 발생했어요. 잠시 후 다시 시도해 주세요 🙏".to_string(),
            TutorError::Persistence(_) => {
                "대화 상태를 저장하지 못했습니다. 잠시 후 다시 시도해 주세요.".to_string()
            }
            TutorError::Cancelled => "요청이 취소되었습니다.".to_string(),
            TutorError::Config(_) => "서비스 설정 오류가 발생했습니다.".to_string(),
        }
    }

    /// 出错的工具名（工具类错误才有）
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            TutorError::ToolExecution { tool, .. }
            | TutorError::ToolTimeout(tool)
            | TutorError::HallucinatedTool(tool) => Some(tool),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_names_tool() {
        let err = TutorError::ToolExecution {
            tool: "lookup_term".to_string(),
            reason: "connection refused at 10.0.0.3:5432".to_string(),
        };
        let msg = err.user_message();
        assert!(msg.contains("lookup_term"));
        assert!(!msg.contains("10.0.0.3"));
        assert_eq!(err.tool_name(), Some("lookup_term"));
    }

    #[test]
    fn test_llm_error_does_not_leak_backend_text() {
        let err = TutorError::Llm(LlmError::ApiError("invalid api key sk-123".to_string()));
        assert!(!err.user_message().contains("sk-123"));
        assert_eq!(err.tool_name(), None);
    }

    #[test]
    fn test_persistence_error_from_checkpoint_error() {
        let err: TutorError = CheckpointError::Backend("disk full".to_string()).into();
        assert!(matches!(err, TutorError::Persistence(_)));
        assert!(!err.user_message().contains("disk"));
    }

    #[test]
    fn test_unknown_tool_name_not_echoed() {
        let name = "x".repeat(10_000);
        let err = TutorError::HallucinatedTool(name.clone());
        let msg = err.user_message();
        assert!(!msg.contains(&name[..16]));
        assert!(msg.chars().count() < 64);
        assert_eq!(err.tool_name(), Some(name.as_str()));
    }
}
