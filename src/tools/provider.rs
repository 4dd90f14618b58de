//! 工具提供方契约
//!
//! 每个提供方在启动时绑定到一个目标目录，对外只有 list / invoke 两个操作；
//! ProviderLauncher 负责按目标目录启动全部已配置的提供方（内置 workspace + 外部 MCP 进程）。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ProviderSpec, ToolsSection};
use crate::core::AgentError;
use crate::tools::mcp::McpProvider;
use crate::tools::workspace::WorkspaceProvider;

/// 提供方 list() 返回的单个工具描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: empty_object_schema(),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }
}

/// 工具提供方：list 列出工具，invoke 按名调用（Err 为面向模型的失败描述）
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// 提供方名称（用于冲突报告与审计日志）
    fn name(&self) -> &str;

    async fn list(&self) -> Result<Vec<ToolInfo>, AgentError>;

    async fn invoke(&self, tool: &str, args: Value) -> Result<String, String>;
}

/// 按目标目录启动提供方
#[async_trait]
pub trait ProviderLauncher: Send + Sync {
    async fn launch(&self, target: &Path) -> Result<Vec<Arc<dyn ToolProvider>>, AgentError>;
}

/// 默认启动器：内置 workspace 提供方（可关）+ [[tools.providers]] 中的每个 MCP 进程
pub struct DefaultProviderLauncher {
    builtin_workspace: bool,
    max_read_bytes: usize,
    max_search_results: usize,
    specs: Vec<ProviderSpec>,
    handshake_timeout: Duration,
}

impl DefaultProviderLauncher {
    pub fn from_config(tools: &ToolsSection) -> Self {
        Self {
            builtin_workspace: tools.builtin_workspace,
            max_read_bytes: tools.max_read_bytes,
            max_search_results: tools.max_search_results,
            specs: tools.providers.clone(),
            handshake_timeout: Duration::from_secs(tools.discovery_timeout_secs),
        }
    }
}

#[async_trait]
impl ProviderLauncher for DefaultProviderLauncher {
    async fn launch(&self, target: &Path) -> Result<Vec<Arc<dyn ToolProvider>>, AgentError> {
        let mut providers: Vec<Arc<dyn ToolProvider>> = Vec::new();
        if self.builtin_workspace {
            providers.push(Arc::new(
                WorkspaceProvider::new(target)
                    .with_limits(self.max_read_bytes, self.max_search_results),
            ));
        }
        for spec in &self.specs {
            tracing::info!(provider = %spec.name, command = %spec.command, "launching tool provider");
            let provider = tokio::time::timeout(
                self.handshake_timeout,
                McpProvider::spawn(spec, target),
            )
            .await
            .map_err(|_| AgentError::ProviderUnavailable {
                provider: spec.name.clone(),
                reason: format!("handshake timed out after {:?}", self.handshake_timeout),
            })?
            .map_err(|e| AgentError::ProviderUnavailable {
                provider: spec.name.clone(),
                reason: e.to_string(),
            })?;
            providers.push(Arc::new(provider));
        }
        Ok(providers)
    }
}
