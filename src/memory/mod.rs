//! 记忆层：会话消息与送入模型的历史窗口

pub mod conversation;

pub use conversation::{HistoryWindow, Message, Role};
