//! 有界研究循环
//!
//! Decide -> Act (Tool) -> Observe -> 下一轮 Decide；最多 max_depth 轮。
//! 工具错误（UnknownTool / ToolInvocation / ToolTimeout）写回为 Tool 消息，不终止循环；
//! 决策失败经 RecoveryEngine 转为重试提示，同样计入轮数，因此循环总会终止。
//! 取消只在两轮之间检查：进行中的工具调用会完成并写回结果。

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_MAX_DEPTH;
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::memory::{Message, Role};
use crate::research::planner::{ResearchDecider, ResearchStep};
use crate::tools::ToolExecutor;

/// 决策默认超时（秒）
const DEFAULT_DECISION_TIMEOUT_SECS: u64 = 60;

/// 循环结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// 得到最终答案
    Completed,
    /// 达到 max_depth 仍无最终答案
    DepthExceeded,
    /// 两轮之间收到取消
    Cancelled,
}

impl Termination {
    pub fn is_truncated(&self) -> bool {
        !matches!(self, Termination::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    Success(String),
    Failed(String),
}

/// 单次工具调用记录
#[derive(Debug, Clone)]
pub struct InvocationRecord {
    pub call_id: String,
    pub tool: String,
    pub args: serde_json::Value,
    pub outcome: InvocationOutcome,
}

impl InvocationRecord {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, InvocationOutcome::Success(_))
    }
}

/// 一次循环执行的完整记录；只属于这一次执行
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    invocations: Vec<InvocationRecord>,
}

impl Transcript {
    pub fn new(brief: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(brief)],
            invocations: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn invocations(&self) -> &[InvocationRecord] {
        &self.invocations
    }

    /// 循环输入（第一条 user 消息）
    pub fn brief(&self) -> &str {
        self.messages.first().map(|m| m.content.as_str()).unwrap_or("")
    }

    /// 最后一条消息若为非工具请求的 assistant 消息，即为最终答案
    pub fn final_answer(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.role == Role::Assistant && !m.is_tool_request())
            .map(|m| m.content.as_str())
    }

    /// 成功的工具调用及其输出
    pub fn observations(&self) -> impl Iterator<Item = (&InvocationRecord, &str)> {
        self.invocations.iter().filter_map(|r| match &r.outcome {
            InvocationOutcome::Success(out) => Some((r, out.as_str())),
            InvocationOutcome::Failed(_) => None,
        })
    }

    fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}

/// 循环执行结果
#[derive(Debug, Clone)]
pub struct LoopReport {
    pub transcript: Transcript,
    pub termination: Termination,
    /// 实际执行的轮数（含决策失败的轮次）
    pub iterations: usize,
}

/// 研究循环配置
pub struct ResearchSession<'a> {
    /// 决策策略（必需）
    pub decider: &'a dyn ResearchDecider,
    /// 工具执行器（必需）
    pub executor: &'a ToolExecutor,
    /// 恢复引擎（必需）
    pub recovery: &'a RecoveryEngine,
    /// 取消令牌（必需）
    pub cancel_token: CancellationToken,
    pub max_depth: usize,
    pub decision_timeout: Duration,
}

impl<'a> ResearchSession<'a> {
    /// 创建默认配置的 ResearchSession（max_depth = 50）
    pub fn new(
        decider: &'a dyn ResearchDecider,
        executor: &'a ToolExecutor,
        recovery: &'a RecoveryEngine,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            decider,
            executor,
            recovery,
            cancel_token,
            max_depth: DEFAULT_MAX_DEPTH,
            decision_timeout: Duration::from_secs(DEFAULT_DECISION_TIMEOUT_SECS),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = timeout;
        self
    }
}

/// 执行研究循环
///
/// 进入前已取消返回 Err(Cancelled)；进入后的取消以 Termination::Cancelled 结束并返回已有记录。
/// 只有决策过程的不可恢复错误会以 Err 中止本轮。
pub async fn research_loop(
    session: &ResearchSession<'_>,
    brief: &str,
) -> Result<LoopReport, AgentError> {
    if session.cancel_token.is_cancelled() {
        return Err(AgentError::Cancelled);
    }

    let catalog = session.executor.catalog();
    let mut transcript = Transcript::new(brief);
    let mut iterations = 0usize;

    let termination = loop {
        if session.cancel_token.is_cancelled() {
            tracing::info!(iterations, "research cancelled");
            break Termination::Cancelled;
        }
        if iterations >= session.max_depth {
            tracing::warn!(max_depth = session.max_depth, "research depth exceeded");
            break Termination::DepthExceeded;
        }
        iterations += 1;

        let step = match tokio::time::timeout(
            session.decision_timeout,
            session.decider.next_step(transcript.messages(), catalog),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(AgentError::DecisionTimeout(session.decision_timeout.as_secs())),
        };

        let call = match step {
            Ok(ResearchStep::FinalAnswer(answer)) => {
                tracing::debug!(iteration = iterations, "final answer produced");
                transcript.push(Message::assistant(answer));
                break Termination::Completed;
            }
            Ok(ResearchStep::ToolCall(call)) => call,
            Err(e) => match session.recovery.handle(&e) {
                RecoveryAction::RetryWithPrompt(prompt) => {
                    tracing::warn!(iteration = iterations, error = %e, "decision failed, retrying");
                    transcript.push(Message::user(prompt));
                    continue;
                }
                RecoveryAction::Abort => return Err(e),
            },
        };

        if session.cancel_token.is_cancelled() {
            tracing::info!(iterations, "research cancelled before tool invocation");
            break Termination::Cancelled;
        }

        let call_id = format!("call_{}", iterations);
        let request = serde_json::to_string(&call).unwrap_or_else(|_| call.tool.clone());
        transcript.push(Message::tool_request(&call_id, request));
        tracing::debug!(iteration = iterations, tool = %call.tool, "invoking tool");

        let outcome = match session.executor.execute(&call.tool, call.args.clone()).await {
            Ok(output) => {
                transcript.push(Message::tool_result(&call_id, output.clone()));
                InvocationOutcome::Success(output)
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(iteration = iterations, tool = %call.tool, error = %e, "tool call failed");
                transcript.push(Message::tool_result(&call_id, format!("Error: {}", e)));
                InvocationOutcome::Failed(e.to_string())
            }
            Err(e) => return Err(e),
        };
        transcript.invocations.push(InvocationRecord {
            call_id,
            tool: call.tool,
            args: call.args,
            outcome,
        });
    };

    Ok(LoopReport {
        transcript,
        termination,
        iterations,
    })
}
