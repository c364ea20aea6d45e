//! 核心层：错误、轮次状态机、会话模型、单会话互斥、停机与编排器

pub mod error;
pub mod orchestrator;
pub mod session;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;

pub use error::TutorError;
pub use orchestrator::{OrchestratorSettings, TurnRequest, TurnStream, TutorOrchestrator};
pub use session::{ContextKind, ContextRef, Difficulty, Session, ToolCallRecord, ToolCallStatus};
pub use session_supervisor::{SessionGate, SessionLease};
pub use shutdown::{
    run_with_graceful_shutdown, CheckpointStoreCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason, TurnDrainCleanup,
};
pub use state::TurnPhase;
