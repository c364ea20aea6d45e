//! 事件流编码（SSE / JSON Lines 共用同一帧结构）

pub mod encoder;

pub use encoder::{encode, WireFrame};
