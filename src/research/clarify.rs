//! 澄清路由：AWAITING_INPUT -> BRIEF_PENDING -> BRIEF_READY
//!
//! 每个入站消息后，用可替换的 ScopeDecider 评估完整历史：
//! Clarify(question) 写回一条 assistant 消息并停留在 BRIEF_PENDING；
//! Brief(brief) 写入简报并进入 BRIEF_READY（终态，之后不再评估）。
//! 决策失败（模型错误、输出无法解析、超时）返回 ClarificationFailed，线程保持 BRIEF_PENDING，下一轮可重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::session::{SessionStore, ThreadId, ThreadStatus};
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::{render_history, Message};
use crate::research::extract_json;

/// 决策结果：继续追问，或已形成研究简报
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeDecision {
    Clarify(String),
    Brief(String),
}

/// 充分性判定策略
#[async_trait]
pub trait ScopeDecider: Send + Sync {
    async fn decide(&self, history: &[Message]) -> Result<ScopeDecision, AgentError>;
}

const CLARIFY_PROMPT: &str = r#"These are the messages exchanged so far with the user asking for a research investigation of a codebase:
<Messages>
{messages}
</Messages>

Today's date is {date}.

Decide whether you need to ask the user a clarifying question, or whether the request is clear enough to start researching.
Only ask if something essential is missing: the scope is ambiguous, an acronym or component name is unknown, or the user's goal cannot be inferred.
If you already asked a clarifying question in the messages above, do not ask another one unless it is absolutely necessary.

Reply with exactly one JSON object and nothing else:
{"need_clarification": true|false, "question": "<question to ask the user, empty if none>", "research_brief": "<brief, empty if clarifying>"}

When no clarification is needed, write research_brief from the full conversation: a detailed first-person statement of what I (the user) want investigated,
including every requirement and preference I stated, and leaving open any dimension I did not specify."#;

#[derive(Debug, Deserialize)]
struct ScopeOutput {
    need_clarification: bool,
    #[serde(default)]
    question: String,
    #[serde(default)]
    research_brief: String,
}

/// 解析模型输出的澄清 JSON；问题或简报为空时视为格式错误
pub fn parse_scope_output(output: &str) -> Result<ScopeDecision, AgentError> {
    let json_str = extract_json(output)
        .ok_or_else(|| AgentError::JsonParseError(format!("no JSON object in: {}", output.trim())))?;
    let parsed: ScopeOutput = serde_json::from_str(json_str)
        .map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, json_str)))?;

    let question = parsed.question.trim();
    let brief = parsed.research_brief.trim();
    if parsed.need_clarification {
        if question.is_empty() {
            return Err(AgentError::JsonParseError(
                "need_clarification is true but question is empty".into(),
            ));
        }
        Ok(ScopeDecision::Clarify(question.to_string()))
    } else {
        if brief.is_empty() {
            return Err(AgentError::JsonParseError(
                "need_clarification is false but research_brief is empty".into(),
            ));
        }
        Ok(ScopeDecision::Brief(brief.to_string()))
    }
}

/// 由 LLM 判定是否需要澄清，并在充分时写出第一人称研究简报
pub struct LlmScopeDecider {
    llm: Arc<dyn LlmClient>,
}

impl LlmScopeDecider {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn build_prompt(history: &[Message]) -> String {
        let date = chrono::Local::now().format("%a %b %-d, %Y").to_string();
        CLARIFY_PROMPT
            .replace("{messages}", &render_history(history))
            .replace("{date}", &date)
    }
}

#[async_trait]
impl ScopeDecider for LlmScopeDecider {
    async fn decide(&self, history: &[Message]) -> Result<ScopeDecision, AgentError> {
        let prompt = Self::build_prompt(history);
        let raw = self
            .llm
            .complete(&[Message::user(prompt)])
            .await
            .map_err(AgentError::LlmError)?;
        parse_scope_output(&raw)
    }
}

/// 路由结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterOutcome {
    /// 需要向用户追问
    Clarification(String),
    /// 简报就绪；fresh 为 true 表示本轮刚刚写入
    Brief { brief: String, fresh: bool },
}

/// 澄清路由：持有决策策略与单次决策超时
pub struct ClarificationRouter {
    decider: Arc<dyn ScopeDecider>,
    timeout: Duration,
}

impl ClarificationRouter {
    pub fn new(decider: Arc<dyn ScopeDecider>, timeout: Duration) -> Self {
        Self { decider, timeout }
    }

    /// 评估线程当前历史；调用方需已持有该线程的回合锁并追加了本轮用户消息
    pub async fn evaluate(
        &self,
        store: &SessionStore,
        id: &ThreadId,
    ) -> Result<RouterOutcome, AgentError> {
        let thread = store.get(id).await?;
        if thread.status == ThreadStatus::BriefReady {
            if let Some(brief) = thread.brief {
                tracing::debug!(thread = %id, "brief already ready, skipping evaluation");
                return Ok(RouterOutcome::Brief { brief, fresh: false });
            }
        }

        store.mark_pending(id).await?;

        let decision = match tokio::time::timeout(self.timeout, self.decider.decide(&thread.messages)).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                tracing::warn!(thread = %id, error = %e, "scope decision failed");
                return Err(AgentError::ClarificationFailed(e.to_string()));
            }
            Err(_) => {
                tracing::warn!(thread = %id, "scope decision timed out");
                return Err(AgentError::ClarificationFailed(format!(
                    "decision timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        match decision {
            ScopeDecision::Clarify(question) => {
                store.append(id, Message::assistant(question.clone())).await?;
                tracing::info!(thread = %id, "clarifying question asked");
                Ok(RouterOutcome::Clarification(question))
            }
            ScopeDecision::Brief(brief) => {
                store.finalize_brief(id, brief.clone()).await?;
                tracing::info!(thread = %id, "research brief finalized");
                Ok(RouterOutcome::Brief { brief, fresh: true })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::llm::ScriptedLlmClient;

    /// 按脚本依次返回决策
    struct ScriptedDecider {
        decisions: Mutex<VecDeque<Result<ScopeDecision, AgentError>>>,
    }

    impl ScriptedDecider {
        fn new(decisions: Vec<Result<ScopeDecision, AgentError>>) -> Arc<Self> {
            Arc::new(Self {
                decisions: Mutex::new(decisions.into()),
            })
        }
    }

    #[async_trait]
    impl ScopeDecider for ScriptedDecider {
        async fn decide(&self, _history: &[Message]) -> Result<ScopeDecision, AgentError> {
            self.decisions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AgentError::LlmError("script exhausted".into())))
        }
    }

    struct SlowDecider;

    #[async_trait]
    impl ScopeDecider for SlowDecider {
        async fn decide(&self, _history: &[Message]) -> Result<ScopeDecision, AgentError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ScopeDecision::Brief("late".into()))
        }
    }

    async fn thread_with(store: &SessionStore, text: &str) -> ThreadId {
        let id = store.create_thread(ThreadId::from("t1")).await;
        store.append(&id, Message::user(text)).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_sufficient_first_message_goes_straight_to_brief() {
        let store = SessionStore::new();
        let id = thread_with(&store, "How does auth work in src/?").await;
        let router = ClarificationRouter::new(
            ScriptedDecider::new(vec![Ok(ScopeDecision::Brief("Explain auth".into()))]),
            Duration::from_secs(1),
        );
        let outcome = router.evaluate(&store, &id).await.unwrap();
        assert_eq!(
            outcome,
            RouterOutcome::Brief { brief: "Explain auth".into(), fresh: true }
        );
        let thread = store.get(&id).await.unwrap();
        assert_eq!(thread.status, ThreadStatus::BriefReady);
        assert_eq!(thread.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_clarify_then_brief() {
        let store = SessionStore::new();
        let id = thread_with(&store, "Look into the thing").await;
        let router = ClarificationRouter::new(
            ScriptedDecider::new(vec![
                Ok(ScopeDecision::Clarify("Which module?".into())),
                Ok(ScopeDecision::Brief("Investigate the parser module".into())),
            ]),
            Duration::from_secs(1),
        );

        let first = router.evaluate(&store, &id).await.unwrap();
        assert_eq!(first, RouterOutcome::Clarification("Which module?".into()));
        let thread = store.get(&id).await.unwrap();
        assert_eq!(thread.status, ThreadStatus::BriefPending);
        assert_eq!(thread.messages.last().unwrap().content, "Which module?");

        store.append(&id, Message::user("The parser")).await.unwrap();
        let second = router.evaluate(&store, &id).await.unwrap();
        assert!(matches!(second, RouterOutcome::Brief { fresh: true, .. }));
        assert_eq!(store.get(&id).await.unwrap().messages.len(), 3);
    }

    #[tokio::test]
    async fn test_ready_thread_is_not_reevaluated() {
        let store = SessionStore::new();
        let id = thread_with(&store, "q").await;
        let decider = ScriptedDecider::new(vec![Ok(ScopeDecision::Brief("first".into()))]);
        let router = ClarificationRouter::new(decider.clone(), Duration::from_secs(1));
        router.evaluate(&store, &id).await.unwrap();

        store.append(&id, Message::user("follow-up")).await.unwrap();
        let again = router.evaluate(&store, &id).await.unwrap();
        assert_eq!(again, RouterOutcome::Brief { brief: "first".into(), fresh: false });
        assert!(decider.decisions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_keeps_thread_pending_and_is_retryable() {
        let store = SessionStore::new();
        let id = thread_with(&store, "q").await;
        let router = ClarificationRouter::new(
            ScriptedDecider::new(vec![
                Err(AgentError::LlmError("503".into())),
                Ok(ScopeDecision::Brief("brief".into())),
            ]),
            Duration::from_secs(1),
        );
        let err = router.evaluate(&store, &id).await.unwrap_err();
        assert!(matches!(err, AgentError::ClarificationFailed(_)));
        assert_eq!(store.get(&id).await.unwrap().status, ThreadStatus::BriefPending);

        assert!(matches!(
            router.evaluate(&store, &id).await.unwrap(),
            RouterOutcome::Brief { .. }
        ));
    }

    #[tokio::test]
    async fn test_decision_timeout() {
        let store = SessionStore::new();
        let id = thread_with(&store, "q").await;
        let router = ClarificationRouter::new(Arc::new(SlowDecider), Duration::from_millis(20));
        let err = router.evaluate(&store, &id).await.unwrap_err();
        assert!(matches!(err, AgentError::ClarificationFailed(ref m) if m.contains("timed out")));
        assert_eq!(store.get(&id).await.unwrap().status, ThreadStatus::BriefPending);
    }

    #[test]
    fn test_parse_scope_output() {
        let clarify = r#"{"need_clarification": true, "question": "Which repo?", "research_brief": ""}"#;
        assert_eq!(
            parse_scope_output(clarify).unwrap(),
            ScopeDecision::Clarify("Which repo?".into())
        );
        let brief = "```json\n{\"need_clarification\": false, \"question\": \"\", \"research_brief\": \"I want X\"}\n```";
        assert_eq!(parse_scope_output(brief).unwrap(), ScopeDecision::Brief("I want X".into()));
        assert!(parse_scope_output("sure, let me think").is_err());
        assert!(parse_scope_output(r#"{"need_clarification": true}"#).is_err());
    }

    #[tokio::test]
    async fn test_llm_decider_prompt_contains_history_and_date() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"need_clarification": false, "question": "", "research_brief": "I want to know how caching works"}"#,
        ]));
        let decider = LlmScopeDecider::new(llm.clone());
        let decision = decider
            .decide(&[Message::user("explain caching")])
            .await
            .unwrap();
        assert_eq!(decision, ScopeDecision::Brief("I want to know how caching works".into()));
        let sent = llm.call(0).unwrap();
        assert!(sent[0].content.contains("user: explain caching"));
        assert!(sent[0].content.contains("Today's date is"));
    }
}
