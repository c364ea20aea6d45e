//! Tutor - 金融学习导师对话核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、轮次状态机、会话模型、单会话互斥、停机、编排器
//! - **guardrail**: 护栏分类（规则 / 模型 / 分层），失败即拦截
//! - **checkpoint**: 检查点存储（内存 / 文件 / SQLite）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 会话消息与历史窗口
//! - **react**: Planner、轮次驱动、事件
//! - **stream**: 事件编码（SSE / JSON）
//! - **tools**: 工具注册表、参数校验、执行器与金融用语工具

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod guardrail;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod stream;
pub mod tools;

pub use crate::core::{TurnRequest, TurnStream, TutorError, TutorOrchestrator};
pub use crate::react::{EventPayload, TurnEvent};
pub use crate::stream::{encode, WireFrame};
