//! 工具执行器
//!
//! 持有一次研究所用的 ToolCatalog 与单次调用超时，execute(tool_name, args) 在超时内调用所属提供方；
//! 未知工具返回 UnknownTool，超时返回 ToolTimeout，失败返回 ToolInvocation；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::ToolCatalog;

/// 工具执行器：对每次调用施加超时，并将结果映射为 AgentError
pub struct ToolExecutor {
    catalog: Arc<ToolCatalog>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn with_timeout(catalog: Arc<ToolCatalog>, timeout: Duration) -> Self {
        Self { catalog, timeout }
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// 执行指定工具；输出 JSON 审计日志
    pub async fn execute(&self, tool_name: &str, args: serde_json::Value) -> Result<String, AgentError> {
        let Some(tool) = self.catalog.get(tool_name) else {
            tracing::warn!(tool = %tool_name, "unknown tool requested");
            return Err(AgentError::UnknownTool(tool_name.to_string()));
        };

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, tool.invoke(args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "provider": tool.provider_name(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(r) => r,
            Err(_) => Err(AgentError::ToolTimeout {
                tool: tool_name.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.catalog.tool_names()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::tools::provider::{ToolInfo, ToolProvider};

    struct SlowProvider;

    #[async_trait]
    impl ToolProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn list(&self) -> Result<Vec<ToolInfo>, AgentError> {
            Ok(vec![ToolInfo::new("sleepy", "sleeps"), ToolInfo::new("quick", "returns")])
        }

        async fn invoke(&self, tool: &str, _args: Value) -> Result<String, String> {
            if tool == "sleepy" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok("done".to_string())
        }
    }

    async fn executor(timeout: Duration) -> ToolExecutor {
        let provider: Arc<dyn ToolProvider> = Arc::new(SlowProvider);
        let infos = provider.list().await.unwrap();
        let catalog = ToolCatalog::from_listings("/tmp", vec![(provider, infos)]).unwrap();
        ToolExecutor::with_timeout(Arc::new(catalog), timeout)
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let exec = executor(Duration::from_secs(1)).await;
        let err = exec.execute("nope", json!({})).await.unwrap_err();
        assert_eq!(err, AgentError::UnknownTool("nope".into()));
    }

    #[tokio::test]
    async fn test_timeout_is_recoverable() {
        let exec = executor(Duration::from_millis(20)).await;
        let err = exec.execute("sleepy", json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolTimeout { ref tool, .. } if tool == "sleepy"));
        assert!(err.is_recoverable());
        assert_eq!(exec.execute("quick", json!({})).await.unwrap(), "done");
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = json!({ "text": "a".repeat(500) });
        assert!(args_preview(&long).ends_with("..."));
        assert_eq!(args_preview(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
