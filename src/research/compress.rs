//! 压缩阶段：把一次循环的 Transcript 归约为一个面向用户的产物
//!
//! 产物保留最终答案的内容，只引用成功的工具调用；DepthExceeded / Cancelled 附带截断说明。
//! 压缩从不修改 Transcript。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::Message;
use crate::research::loop_::{Termination, Transcript};

/// 单条观察写入产物的最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 600;

/// 压缩产物
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedArtifact {
    pub text: String,
    pub truncated: bool,
}

#[async_trait]
pub trait Compressor: Send + Sync {
    async fn compress(&self, transcript: &Transcript, termination: Termination) -> CompressedArtifact;
}

fn truncation_notice(termination: Termination, transcript: &Transcript) -> Option<String> {
    match termination {
        Termination::Completed => None,
        Termination::DepthExceeded => Some(format!(
            "[Truncated: research stopped at the iteration limit after {} tool calls without a final answer.]",
            transcript.invocations().len()
        )),
        Termination::Cancelled => {
            Some("[Truncated: research was cancelled before a final answer was reached.]".to_string())
        }
    }
}

fn preview(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!(
            "{}...",
            text.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>()
        )
    } else {
        text.to_string()
    }
}

/// 成功调用的来源列表（去重，保持确定顺序）
fn sources(transcript: &Transcript) -> Vec<String> {
    transcript
        .observations()
        .map(|(record, _)| format!("{} {}", record.tool, record.args))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// 成功观察的摘录
fn findings(transcript: &Transcript) -> String {
    let lines: Vec<String> = transcript
        .observations()
        .map(|(record, output)| format!("- {} {}:\n{}", record.tool, record.args, preview(output)))
        .collect();
    if lines.is_empty() {
        "No tool call produced results.".to_string()
    } else {
        lines.join("\n")
    }
}

fn assemble(body: String, transcript: &Transcript, notice: Option<String>) -> String {
    let mut parts = Vec::new();
    if let Some(n) = &notice {
        parts.push(n.clone());
    }
    parts.push(body);
    let srcs = sources(transcript);
    if !srcs.is_empty() {
        let list: Vec<String> = srcs.iter().map(|s| format!("- {}", s)).collect();
        parts.push(format!("Sources:\n{}", list.join("\n")));
    }
    parts.join("\n\n")
}

/// 确定性的抽取式压缩：最终答案原样保留，否则拼接成功观察的摘录
#[derive(Debug, Default, Clone)]
pub struct ExtractiveCompressor;

impl ExtractiveCompressor {
    pub fn new() -> Self {
        Self
    }

    pub fn compress_sync(&self, transcript: &Transcript, termination: Termination) -> CompressedArtifact {
        let notice = truncation_notice(termination, transcript);
        let body = match transcript.final_answer() {
            Some(answer) if termination == Termination::Completed => answer.trim().to_string(),
            _ => format!(
                "Findings gathered for: {}\n\n{}",
                transcript.brief().trim(),
                findings(transcript)
            ),
        };
        CompressedArtifact {
            truncated: notice.is_some(),
            text: assemble(body, transcript, notice),
        }
    }
}

#[async_trait]
impl Compressor for ExtractiveCompressor {
    async fn compress(&self, transcript: &Transcript, termination: Termination) -> CompressedArtifact {
        self.compress_sync(transcript, termination)
    }
}

const COMPRESS_PROMPT: &str = "You are condensing the results of a codebase investigation that ended before a final answer was written. \
Using only the findings below, write the best answer you can to the research brief. \
Preserve file paths, identifiers and quoted code exactly. Do not mention tools or tool calls. \
State clearly what remains unknown.";

/// LLM 辅助压缩：仅在没有最终答案时请求模型整理成功观察；失败时回退到抽取式
pub struct LlmCompressor {
    llm: Arc<dyn LlmClient>,
    fallback: ExtractiveCompressor,
}

impl LlmCompressor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            fallback: ExtractiveCompressor::new(),
        }
    }
}

#[async_trait]
impl Compressor for LlmCompressor {
    async fn compress(&self, transcript: &Transcript, termination: Termination) -> CompressedArtifact {
        let has_answer = termination == Termination::Completed && transcript.final_answer().is_some();
        if has_answer || transcript.observations().next().is_none() {
            return self.fallback.compress_sync(transcript, termination);
        }

        let messages = vec![
            Message::system(COMPRESS_PROMPT),
            Message::user(format!(
                "Research brief:\n{}\n\nFindings:\n{}",
                transcript.brief().trim(),
                findings(transcript)
            )),
        ];
        match self.llm.complete(&messages).await {
            Ok(text) if !text.trim().is_empty() => {
                let notice = truncation_notice(termination, transcript);
                CompressedArtifact {
                    truncated: notice.is_some(),
                    text: assemble(text.trim().to_string(), transcript, notice),
                }
            }
            Ok(_) => self.fallback.compress_sync(transcript, termination),
            Err(e) => {
                tracing::warn!(error = %e, "LLM compression failed, using extractive fallback");
                self.fallback.compress_sync(transcript, termination)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::core::{AgentError, RecoveryEngine};
    use crate::llm::ScriptedLlmClient;
    use crate::research::loop_::{research_loop, ResearchSession};
    use crate::research::planner::{ResearchDecider, ResearchStep, ToolCall};
    use crate::tools::provider::{ToolInfo, ToolProvider};
    use crate::tools::{ToolCatalog, ToolExecutor};

    struct Files;

    #[async_trait]
    impl ToolProvider for Files {
        fn name(&self) -> &str {
            "files"
        }

        async fn list(&self) -> Result<Vec<ToolInfo>, AgentError> {
            Ok(vec![ToolInfo::new("read_file", "read"), ToolInfo::new("secret", "denied")])
        }

        async fn invoke(&self, tool: &str, args: Value) -> Result<String, String> {
            match tool {
                "secret" => Err("permission denied".into()),
                _ => Ok(format!("fn {}() {{}}", args["path"].as_str().unwrap_or("x"))),
            }
        }
    }

    /// 先读 a.rs、再访问 secret，之后按 answer 决定是否给出最终答案
    struct Plan {
        answer: Option<&'static str>,
    }

    #[async_trait]
    impl ResearchDecider for Plan {
        async fn next_step(&self, t: &[Message], _c: &ToolCatalog) -> Result<ResearchStep, AgentError> {
            let calls = t.iter().filter(|m| m.is_tool_request()).count();
            let call = |tool: &str| -> Result<ResearchStep, AgentError> {
                Ok(ResearchStep::ToolCall(ToolCall {
                    tool: tool.into(),
                    args: json!({ "path": "a.rs" }),
                }))
            };
            match (calls, self.answer) {
                (0, _) => call("read_file"),
                (1, _) => call("secret"),
                (_, Some(a)) => Ok(ResearchStep::FinalAnswer(a.into())),
                (_, None) => call("read_file"),
            }
        }
    }

    async fn run(answer: Option<&'static str>, depth: usize) -> (Transcript, Termination) {
        let provider: Arc<dyn ToolProvider> = Arc::new(Files);
        let infos = provider.list().await.unwrap();
        let catalog = ToolCatalog::from_listings("/tmp", vec![(provider, infos)]).unwrap();
        let exec = ToolExecutor::with_timeout(Arc::new(catalog), Duration::from_secs(1));
        let recovery = RecoveryEngine::new();
        let plan = Plan { answer };
        let session = ResearchSession::new(&plan, &exec, &recovery, CancellationToken::new())
            .with_max_depth(depth);
        let report = research_loop(&session, "How is a.rs structured?").await.unwrap();
        (report.transcript, report.termination)
    }

    #[tokio::test]
    async fn test_final_answer_kept_and_failed_call_excluded() {
        let (t, term) = run(Some("a.rs defines one function."), 10).await;
        assert_eq!(term, Termination::Completed);
        let artifact = ExtractiveCompressor::new().compress(&t, term).await;
        assert!(!artifact.truncated);
        assert!(artifact.text.starts_with("a.rs defines one function."));
        assert!(artifact.text.contains("read_file"));
        assert!(!artifact.text.contains("secret"));
        assert!(!artifact.text.contains("permission denied"));
    }

    #[tokio::test]
    async fn test_compression_is_idempotent_and_does_not_mutate() {
        let (t, term) = run(Some("answer"), 10).await;
        let before = t.messages().len();
        let c = ExtractiveCompressor::new();
        let a = c.compress(&t, term).await;
        let b = c.compress(&t, term).await;
        assert_eq!(a, b);
        assert_eq!(t.messages().len(), before);
    }

    #[tokio::test]
    async fn test_depth_exceeded_carries_notice() {
        let (t, term) = run(None, 4).await;
        assert_eq!(term, Termination::DepthExceeded);
        let artifact = ExtractiveCompressor::new().compress(&t, term).await;
        assert!(artifact.truncated);
        assert!(artifact.text.starts_with("[Truncated"));
        assert!(artifact.text.contains("fn a.rs() {}"));
        assert!(!artifact.text.contains("permission denied"));
    }

    #[tokio::test]
    async fn test_llm_compressor_only_without_answer() {
        let llm = Arc::new(ScriptedLlmClient::new(["a.rs holds a single function."]));
        let compressor = LlmCompressor::new(llm.clone());

        let (done, term) = run(Some("final"), 10).await;
        let a = compressor.compress(&done, term).await;
        assert!(a.text.starts_with("final"));
        assert_eq!(llm.call_count(), 0);

        let (partial, term) = run(None, 3).await;
        let b = compressor.compress(&partial, term).await;
        assert!(b.truncated);
        assert!(b.text.contains("a.rs holds a single function."));
        let sent = llm.call(0).unwrap();
        assert!(!sent[1].content.contains("permission denied"));
    }

    #[tokio::test]
    async fn test_llm_compressor_falls_back() {
        let llm = Arc::new(ScriptedLlmClient::default());
        let compressor = LlmCompressor::new(llm);
        let (partial, term) = run(None, 3).await;
        let artifact = compressor.compress(&partial, term).await;
        assert_eq!(artifact, ExtractiveCompressor::new().compress(&partial, term).await);
    }
}
