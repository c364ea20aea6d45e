//! 推理层：Planner、轮次驱动、事件与提示词

pub mod events;
pub mod loop_;
pub mod planner;
pub mod prompts;

pub use events::{BlockNotice, DoneSummary, EventPayload, TurnEvent};
pub use loop_::{Checkpointer, TurnDriver, TurnEmitter, TurnSettings};
pub use planner::{parse_llm_output, PlanStep, Planner, PlannerOutput, ToolCall};
