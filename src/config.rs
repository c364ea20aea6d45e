//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TUTOR__*` 覆盖（双下划线表示嵌套，如 `TUTOR__AGENT__MAX_ROUNDS=3`）。

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{Difficulty, TutorError};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub guardrail: GuardrailSection,
    pub checkpoint: CheckpointSection,
    pub tools: ToolsSection,
    pub web: WebSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 送入模型的最近消息条数（40 条 = 20 轮）
    pub max_history_messages: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_history_messages: 40,
        }
    }
}

/// [llm] 段：后端选择、凭据与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    /// 护栏分类用模型，未设置时与 model 相同
    pub guardrail_model: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            guardrail_model: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

/// [llm.timeouts] 段（秒，可为小数）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub guardrail_secs: f64,
    pub generation_secs: f64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            guardrail_secs: 10.0,
            generation_secs: 120.0,
        }
    }
}

impl LlmTimeoutsSection {
    pub fn guardrail(&self) -> Duration {
        Duration::from_secs_f64(self.guardrail_secs.max(0.0))
    }

    pub fn generation(&self) -> Duration {
        Duration::from_secs_f64(self.generation_secs.max(0.0))
    }
}

/// [agent] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 单轮内最多工具调用次数，超过后强制进入回答阶段
    pub max_rounds: usize,
    pub default_difficulty: Difficulty,
    /// 事件通道容量
    pub event_buffer: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            default_difficulty: Difficulty::Beginner,
            event_buffer: 32,
        }
    }
}

/// [guardrail] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardrailSection {
    /// rules / layered
    pub mode: String,
    pub max_parse_retries: u32,
}

impl Default for GuardrailSection {
    fn default() -> Self {
        Self {
            mode: "rules".to_string(),
            max_parse_retries: 2,
        }
    }
}

/// [checkpoint] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    /// memory / file:<dir> / sqlite:<path>
    pub backend: String,
    pub save_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            save_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self { tool_timeout_secs: 30 }
    }
}

/// [web] 段（tutor-web 使用）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub bind: String,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl WebSection {
    pub fn socket_addr(&self) -> Result<SocketAddr, TutorError> {
        self.bind
            .trim()
            .parse()
            .map_err(|_| TutorError::Config(format!("invalid web.bind: {}", self.bind)))
    }
}

impl AppConfig {
    /// 校验取值范围；非法配置在启动时拒绝
    pub fn validate(&self) -> Result<(), TutorError> {
        if self.agent.max_rounds == 0 {
            return Err(TutorError::Config("agent.max_rounds must be >= 1".into()));
        }
        if self.agent.event_buffer == 0 {
            return Err(TutorError::Config("agent.event_buffer must be >= 1".into()));
        }
        let t = &self.llm.timeouts;
        if !(t.guardrail_secs.is_finite() && t.guardrail_secs > 0.0) {
            return Err(TutorError::Config("llm.timeouts.guardrail_secs must be > 0".into()));
        }
        if !(t.generation_secs.is_finite() && t.generation_secs > 0.0) {
            return Err(TutorError::Config("llm.timeouts.generation_secs must be > 0".into()));
        }
        if self.tools.tool_timeout_secs == 0 {
            return Err(TutorError::Config("tools.tool_timeout_secs must be > 0".into()));
        }
        if !matches!(self.llm.provider.as_str(), "openai" | "mock") {
            return Err(TutorError::Config(format!("unknown llm.provider: {}", self.llm.provider)));
        }
        if !matches!(self.guardrail.mode.as_str(), "rules" | "layered") {
            return Err(TutorError::Config(format!("unknown guardrail.mode: {}", self.guardrail.mode)));
        }
        let backend = self.checkpoint.backend.trim();
        let known = backend == "memory"
            || backend.strip_prefix("file:").is_some_and(|d| !d.is_empty())
            || backend.strip_prefix("sqlite:").is_some_and(|p| !p.is_empty());
        if !known {
            return Err(TutorError::Config(format!("unknown checkpoint.backend: {backend}")));
        }
        self.web.socket_addr()?;
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 TUTOR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TUTOR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TUTOR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
