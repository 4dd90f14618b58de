//! 研究流程：澄清路由、规划、有界循环、压缩

pub mod clarify;
pub mod compress;
pub mod loop_;
pub mod planner;

pub use clarify::{
    parse_scope_output, ClarificationRouter, LlmScopeDecider, RouterOutcome, ScopeDecider,
    ScopeDecision,
};
pub use compress::{CompressedArtifact, Compressor, ExtractiveCompressor, LlmCompressor};
pub use loop_::{
    research_loop, InvocationOutcome, InvocationRecord, LoopReport, ResearchSession, Termination,
    Transcript,
};
pub use planner::{parse_llm_output, ResearchDecider, ResearchPlanner, ResearchStep, ToolCall};

/// 从模型回复中取出 JSON 片段：优先 ```json 代码块，其次第一个 `{` 到最后一个 `}`
pub(crate) fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(extract_json("see {\"a\":1} here"), Some("{\"a\":1}"));
        assert_eq!(extract_json("no json"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }
}
