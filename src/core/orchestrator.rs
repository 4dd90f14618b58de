//! 编排器：一个用户回合的完整流程
//!
//! 校验目标目录 -> 取得线程回合锁 -> 追加用户消息 -> 澄清路由；
//! 简报就绪后发现工具目录 -> 有界研究循环 -> 压缩 -> 产物写回线程并返回。
//! 所有协作者在构造时注入（见 OrchestratorBuilder），无进程级单例。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::session::{SessionStore, ThreadId};
use crate::core::{AgentError, RecoveryEngine};
use crate::memory::Message;
use crate::research::{
    research_loop, ClarificationRouter, Compressor, ResearchDecider, ResearchSession,
    RouterOutcome, Termination,
};
use crate::tools::{ToolExecutor, ToolRegistry};

/// 回合结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// 澄清问题
    Clarification(String),
    /// 压缩后的研究产物
    Artifact(String),
}

/// start_turn 的返回值
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub thread_id: ThreadId,
    pub outcome: TurnOutcome,
    /// 仅在执行了研究循环时存在
    pub termination: Option<Termination>,
}

impl TurnReply {
    pub fn text(&self) -> &str {
        match &self.outcome {
            TurnOutcome::Clarification(t) | TurnOutcome::Artifact(t) => t,
        }
    }
}

/// 循环相关参数
#[derive(Debug, Clone, Copy)]
pub struct LoopLimits {
    pub max_depth: usize,
    pub tool_timeout: Duration,
    pub decision_timeout: Duration,
}

/// 组合根：Session Store -> Router -> (Registry + Loop) -> Compression
pub struct Orchestrator {
    store: Arc<SessionStore>,
    registry: Arc<ToolRegistry>,
    router: ClarificationRouter,
    decider: Arc<dyn ResearchDecider>,
    compressor: Arc<dyn Compressor>,
    recovery: RecoveryEngine,
    limits: LoopLimits,
}

impl Orchestrator {
    pub fn new(
        store: Arc<SessionStore>,
        registry: Arc<ToolRegistry>,
        router: ClarificationRouter,
        decider: Arc<dyn ResearchDecider>,
        compressor: Arc<dyn Compressor>,
        limits: LoopLimits,
    ) -> Self {
        Self {
            store,
            registry,
            router,
            decider,
            compressor,
            recovery: RecoveryEngine::new(),
            limits,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// 处理一个用户回合；thread_id 为 None 时创建新线程
    pub async fn start_turn(
        &self,
        thread_id: Option<ThreadId>,
        user_text: &str,
        target: &Path,
    ) -> Result<TurnReply, AgentError> {
        self.start_turn_with_cancel(thread_id, user_text, target, CancellationToken::new())
            .await
    }

    /// 同 start_turn，可在两轮研究之间取消
    pub async fn start_turn_with_cancel(
        &self,
        thread_id: Option<ThreadId>,
        user_text: &str,
        target: &Path,
        cancel_token: CancellationToken,
    ) -> Result<TurnReply, AgentError> {
        // 目标目录无效时不产生任何状态变化
        let target = ToolRegistry::validate_target(target).await?;

        let id = match thread_id {
            Some(id) if self.store.contains(&id).await => id,
            Some(id) => return Err(AgentError::UnknownThread(id.to_string())),
            None => self.store.create_thread(ThreadId::generate()).await,
        };

        let _turn = self.store.begin_turn(&id).await?;
        self.store.append(&id, Message::user(user_text)).await?;
        tracing::info!(thread = %id, target = %target.display(), "turn started");

        let research_input = match self.router.evaluate(&self.store, &id).await? {
            RouterOutcome::Clarification(question) => {
                return Ok(TurnReply {
                    thread_id: id,
                    outcome: TurnOutcome::Clarification(question),
                    termination: None,
                });
            }
            RouterOutcome::Brief { brief, fresh: true } => brief,
            RouterOutcome::Brief { brief, fresh: false } => {
                format!("{}\n\nFollow-up question: {}", brief, user_text.trim())
            }
        };

        let catalog = self.registry.discover(&target).await?;
        let executor = ToolExecutor::with_timeout(catalog, self.limits.tool_timeout);
        let session = ResearchSession::new(
            self.decider.as_ref(),
            &executor,
            &self.recovery,
            cancel_token,
        )
        .with_max_depth(self.limits.max_depth)
        .with_decision_timeout(self.limits.decision_timeout);

        let report = research_loop(&session, &research_input).await?;
        let artifact = self
            .compressor
            .compress(&report.transcript, report.termination)
            .await;
        tracing::info!(
            thread = %id,
            iterations = report.iterations,
            termination = ?report.termination,
            truncated = artifact.truncated,
            "research finished"
        );

        self.store
            .append(&id, Message::assistant(artifact.text.clone()))
            .await?;

        Ok(TurnReply {
            thread_id: id,
            outcome: TurnOutcome::Artifact(artifact.text),
            termination: Some(report.termination),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;

    use super::*;
    use crate::core::session::ThreadStatus;
    use crate::research::{ExtractiveCompressor, ResearchStep, ScopeDecider, ScopeDecision, ToolCall};
    use crate::tools::registry::tests::CountingLauncher;
    use crate::tools::ToolCatalog;

    /// 含 "vague" 的首条消息需要澄清，其余直接形成简报
    struct KeywordScope;

    #[async_trait]
    impl ScopeDecider for KeywordScope {
        async fn decide(&self, history: &[Message]) -> Result<ScopeDecision, AgentError> {
            let last = history.last().map(|m| m.content.clone()).unwrap_or_default();
            if history.len() == 1 && last.contains("vague") {
                Ok(ScopeDecision::Clarify("Which part of the code?".into()))
            } else {
                Ok(ScopeDecision::Brief(format!("I want to understand: {}", last)))
            }
        }
    }

    /// 调用一次 alpha 后给出答案
    struct OneCall;

    #[async_trait]
    impl ResearchDecider for OneCall {
        async fn next_step(&self, t: &[Message], _c: &ToolCatalog) -> Result<ResearchStep, AgentError> {
            if t.iter().any(|m| m.is_tool_request()) {
                Ok(ResearchStep::FinalAnswer(format!("answer to: {}", t[0].content)))
            } else {
                Ok(ResearchStep::ToolCall(ToolCall {
                    tool: "alpha".into(),
                    args: serde_json::json!({}),
                }))
            }
        }
    }

    fn orchestrator(launcher: Arc<CountingLauncher>) -> Orchestrator {
        Orchestrator::new(
            Arc::new(SessionStore::new()),
            Arc::new(ToolRegistry::new(launcher, Duration::from_secs(1))),
            ClarificationRouter::new(Arc::new(KeywordScope), Duration::from_secs(1)),
            Arc::new(OneCall),
            Arc::new(ExtractiveCompressor::new()),
            LoopLimits {
                max_depth: 5,
                tool_timeout: Duration::from_secs(1),
                decision_timeout: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn test_clarify_then_research() {
        let launcher = Arc::new(CountingLauncher::new(vec![vec!["alpha"]]));
        let orch = orchestrator(launcher.clone());
        let dir = tempfile::tempdir().unwrap();

        let first = orch.start_turn(None, "something vague", dir.path()).await.unwrap();
        assert_eq!(first.outcome, TurnOutcome::Clarification("Which part of the code?".into()));
        assert!(first.termination.is_none());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);

        let second = orch
            .start_turn(Some(first.thread_id.clone()), "the parser", dir.path())
            .await
            .unwrap();
        assert_eq!(second.thread_id, first.thread_id);
        assert_eq!(second.termination, Some(Termination::Completed));
        assert!(second.text().starts_with("answer to: I want to understand: the parser"));

        let thread = orch.store().get(&first.thread_id).await.unwrap();
        assert_eq!(thread.status, ThreadStatus::BriefReady);
        assert_eq!(thread.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_follow_up_reuses_brief() {
        let launcher = Arc::new(CountingLauncher::new(vec![vec!["alpha"]]));
        let orch = orchestrator(launcher.clone());
        let dir = tempfile::tempdir().unwrap();

        let first = orch.start_turn(None, "the cache", dir.path()).await.unwrap();
        let brief = orch.store().get(&first.thread_id).await.unwrap().brief;
        let second = orch
            .start_turn(Some(first.thread_id.clone()), "and eviction?", dir.path())
            .await
            .unwrap();
        assert!(second.text().contains("Follow-up question: and eviction?"));
        assert_eq!(orch.store().get(&first.thread_id).await.unwrap().brief, brief);
        // 同一目标目录只发现一次
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_target_changes_nothing() {
        let launcher = Arc::new(CountingLauncher::new(vec![vec!["alpha"]]));
        let orch = orchestrator(launcher.clone());
        let err = orch
            .start_turn(None, "q", Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidTarget { .. }));
        assert!(orch.store().is_empty().await);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_thread() {
        let orch = orchestrator(Arc::new(CountingLauncher::new(vec![vec!["alpha"]])));
        let dir = tempfile::tempdir().unwrap();
        let err = orch
            .start_turn(Some(ThreadId::from("thread_missing")), "q", dir.path())
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::UnknownThread("thread_missing".into()));
    }

    #[tokio::test]
    async fn test_name_conflict_aborts_turn() {
        let launcher = Arc::new(CountingLauncher::new(vec![vec!["alpha"], vec!["alpha"]]));
        let orch = orchestrator(launcher);
        let dir = tempfile::tempdir().unwrap();
        let err = orch.start_turn(None, "q", dir.path()).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolNameConflict { ref name, .. } if name == "alpha"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let orch = orchestrator(Arc::new(CountingLauncher::new(vec![vec!["alpha"]])));
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = orch
            .start_turn_with_cancel(None, "q", dir.path(), token)
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Cancelled);
    }
}
