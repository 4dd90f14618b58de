//! 错误恢复引擎
//!
//! 研究循环中决策过程失败时，根据 AgentError 类型返回 RecoveryAction：
//! 可恢复的决策错误转为一条重试提示（作为 user 消息写入 Transcript），其余错误中止本轮。

use crate::core::AgentError;

/// 恢复动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 追加提示后进入下一轮决策（仍计入深度上限）
    RetryWithPrompt(String),
    /// 中止本轮，错误原样返回调用方
    Abort,
}

/// 语义化错误恢复：将决策错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::JsonParseError(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous reply could not be parsed as a tool call: {raw}. \
                 To call a tool, reply with exactly one JSON object and nothing else, \
                 in the form {{\"tool\": \"<tool name>\", \"args\": {{...}}}}. \
                 To finish, reply with your final answer in plain text without any JSON."
            )),
            AgentError::DecisionTimeout(secs) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous decision took longer than {secs}s and was discarded. \
                 Decide on the next step again, keeping the reply short."
            )),
            AgentError::LlmError(msg) => RecoveryAction::RetryWithPrompt(format!(
                "The previous decision attempt failed ({msg}). Decide on the next step again."
            )),
            _ => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_json_parse_error() {
        let engine = RecoveryEngine::new();
        let err = AgentError::JsonParseError("invalid json".to_string());
        match engine.handle(&err) {
            RecoveryAction::RetryWithPrompt(msg) => {
                assert!(msg.contains("JSON"));
                assert!(msg.contains("invalid json"));
            }
            other => panic!("Expected RetryWithPrompt, got {:?}", other),
        }
    }

    #[test]
    fn test_recovery_timeout_and_llm_error_retry() {
        let engine = RecoveryEngine::new();
        assert!(matches!(
            engine.handle(&AgentError::DecisionTimeout(5)),
            RecoveryAction::RetryWithPrompt(ref m) if m.contains("5s")
        ));
        assert!(matches!(
            engine.handle(&AgentError::LlmError("503".into())),
            RecoveryAction::RetryWithPrompt(_)
        ));
    }

    #[test]
    fn test_recovery_infrastructure_aborts() {
        let engine = RecoveryEngine::new();
        assert_eq!(engine.handle(&AgentError::Cancelled), RecoveryAction::Abort);
        assert_eq!(
            engine.handle(&AgentError::UnknownThread("t".into())),
            RecoveryAction::Abort
        );
    }
}
