//! 引擎错误类型
//!
//! 分两类：基础设施错误（InvalidTarget / UnknownThread / ProviderUnavailable / ToolNameConflict）
//! 直接中止本轮并原样返回调用方；工具类错误（ToolInvocation / ToolTimeout / UnknownTool）
//! 在研究循环中被吸收为 Tool 消息，不会中止本轮。

use std::path::PathBuf;

use thiserror::Error;

/// 引擎运行过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Invalid target directory: {path} ({reason})")]
    InvalidTarget { path: PathBuf, reason: String },

    #[error("Unknown thread: {0}")]
    UnknownThread(String),

    #[error("Tool name conflict: '{name}' offered by both '{first}' and '{second}'")]
    ToolNameConflict {
        name: String,
        first: String,
        second: String,
    },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool '{tool}' failed: {cause}")]
    ToolInvocation { tool: String, cause: String },

    #[error("Tool timeout: {tool} after {secs}s")]
    ToolTimeout { tool: String, secs: u64 },

    /// 澄清决策失败（模型不可用、输出无法解析、超时）；线程保持 BRIEF_PENDING，下轮可重试
    #[error("Clarification failed: {0}")]
    ClarificationFailed(String),

    /// 发现阶段工具提供方无法启动或无响应
    #[error("Tool provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("Research brief already set for thread {0}")]
    BriefAlreadySet(String),

    #[error("Decision timeout after {0}s")]
    DecisionTimeout(u64),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 可恢复错误：作为数据写入 Transcript，由决策过程自行调整
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AgentError::ToolInvocation { .. }
                | AgentError::ToolTimeout { .. }
                | AgentError::UnknownTool(_)
                | AgentError::DecisionTimeout(_)
                | AgentError::JsonParseError(_)
        )
    }
}
