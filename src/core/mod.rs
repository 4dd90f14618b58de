//! 核心编排层：错误与恢复、会话存储、回合编排与构建

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session;

pub use builder::{create_llm_from_config, create_orchestrator, OrchestratorBuilder};
pub use error::AgentError;
pub use orchestrator::{LoopLimits, Orchestrator, TurnOutcome, TurnReply};
pub use recovery::{RecoveryAction, RecoveryEngine};
pub use session::{SessionStore, Thread, ThreadId, ThreadStatus, TurnGuard};
