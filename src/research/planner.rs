//! 研究规划器：决定下一步是调用工具还是给出最终答案
//!
//! 调用 LLM 得到回复；parse_llm_output 从文本中提取 JSON 并解析为 ToolCall 或最终答案。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::research::extract_json;
use crate::tools::{tool_call_schema_json, ToolCatalog};

/// 模型提出的工具调用（{"tool": "read_file", "args": {"path": "..."}}）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
}

fn empty_args() -> serde_json::Value {
    serde_json::json!({})
}

/// 规划器输出
#[derive(Debug, Clone, PartialEq)]
pub enum ResearchStep {
    /// 需要执行工具
    ToolCall(ToolCall),
    /// 研究结束，给出最终答案
    FinalAnswer(String),
}

/// 解析 LLM 输出
///
/// - 以 `{` 开头的回复，或整条回复就是一个 ```json 代码块（至多带一行简短引导语），必须是合法的 tool call，否则为 JsonParseError
/// - 正文中夹带的 `{...}` 或代码块仅在能解析为 tool 非空的 tool call 时才视为调用，否则整条回复是最终答案
/// - 其余文本为最终答案；空回复为 JsonParseError
pub fn parse_llm_output(output: &str) -> Result<ResearchStep, AgentError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(AgentError::JsonParseError("empty reply".into()));
    }

    let explicit = trimmed.starts_with('{') || fence_is_whole_reply(trimmed);
    let Some(json_str) = extract_json(trimmed) else {
        return Ok(ResearchStep::FinalAnswer(trimmed.to_string()));
    };

    match serde_json::from_str::<ToolCall>(json_str) {
        Ok(call) if !call.tool.trim().is_empty() => Ok(ResearchStep::ToolCall(call)),
        Ok(_) if explicit => Err(AgentError::JsonParseError(format!(
            "tool name is empty: {}",
            json_str
        ))),
        Err(e) if explicit => Err(AgentError::JsonParseError(format!("{}: {}", e, json_str))),
        _ => Ok(ResearchStep::FinalAnswer(trimmed.to_string())),
    }
}

/// 引导语的最大字符数
const MAX_LEAD_IN_CHARS: usize = 120;

/// 回复是否仅由一个 json 代码块构成（之前至多一行简短引导语，之后没有其它文字）
fn fence_is_whole_reply(trimmed: &str) -> bool {
    let Some(start) = trimmed.find("```json") else {
        return false;
    };
    let lead = trimmed[..start].trim();
    if lead.contains('\n') || lead.chars().count() > MAX_LEAD_IN_CHARS {
        return false;
    }
    let body = &trimmed[start + 7..];
    match body.find("```") {
        Some(end) => body[end + 3..].trim().is_empty(),
        None => true,
    }
}

/// 研究循环的决策策略：根据 Transcript 与工具目录给出下一步
#[async_trait]
pub trait ResearchDecider: Send + Sync {
    async fn next_step(
        &self,
        transcript: &[Message],
        catalog: &ToolCatalog,
    ) -> Result<ResearchStep, AgentError>;
}

pub const DEFAULT_RESEARCH_PROMPT: &str = "You are a research assistant investigating a codebase on the user's behalf. \
The first user message is the research brief. Use the tools below to gather evidence from the files under the target directory, \
one tool call per reply. Paths are relative to the target directory. \
When you have enough evidence, stop calling tools and reply with a thorough final answer in plain text, \
citing the files you relied on. Do not call tools that are not listed.";

/// LLM 规划器：持有 LLM 与基础 system prompt，每轮拼入工具目录与 tool call schema
pub struct ResearchPlanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl ResearchPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self::with_system_prompt(llm, DEFAULT_RESEARCH_PROMPT)
    }

    pub fn with_system_prompt(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    /// 完整 system prompt：基础提示 + 日期 + 工具列表 + tool call schema
    pub fn build_system(&self, catalog: &ToolCatalog) -> String {
        let date = chrono::Local::now().format("%a %b %-d, %Y");
        format!(
            "{}\n\nToday's date is {}.\n\n## Available tools\n```json\n{}\n```\n\n## Tool call JSON Schema (you must output valid JSON matching this)\n```json\n{}\n```",
            self.system_prompt,
            date,
            catalog.to_schema_json(),
            tool_call_schema_json()
        )
    }
}

#[async_trait]
impl ResearchDecider for ResearchPlanner {
    async fn next_step(
        &self,
        transcript: &[Message],
        catalog: &ToolCatalog,
    ) -> Result<ResearchStep, AgentError> {
        let mut full_messages = vec![Message::system(self.build_system(catalog))];
        full_messages.extend(transcript.iter().cloned());
        let raw = self
            .llm
            .complete(&full_messages)
            .await
            .map_err(AgentError::LlmError)?;
        let (prompt_tokens, completion_tokens, total_tokens) = self.llm.token_usage();
        tracing::debug!(prompt_tokens, completion_tokens, total_tokens, "research decision");
        parse_llm_output(&raw)
    }
}
