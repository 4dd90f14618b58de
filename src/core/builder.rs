//! Orchestrator 构建器：统一的初始化逻辑
//!
//! 从 AppConfig 组装 SessionStore、ToolRegistry、澄清路由、研究规划器与压缩器；
//! 每个协作者都可显式注入（测试用脚本化 LLM 或桩策略）。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::{load_config, AppConfig};
use crate::core::orchestrator::{LoopLimits, Orchestrator};
use crate::core::session::SessionStore;
use crate::core::AgentError;
use crate::llm::{create_deepseek_client, LlmClient, OpenAiClient};
use crate::research::{
    ClarificationRouter, Compressor, ExtractiveCompressor, LlmCompressor, LlmScopeDecider,
    ResearchDecider, ResearchPlanner, ScopeDecider,
};
use crate::tools::{DefaultProviderLauncher, ProviderLauncher, ToolRegistry};

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容）；两种 Key 都没有时返回 ConfigError
pub fn create_llm_from_config(cfg: &AppConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
    let provider = cfg.llm.provider.to_lowercase();
    // 有 DeepSeek Key 或（配置为 deepseek 且仅有 OpenAI Key 时也走 DeepSeek 兼容端点）
    let use_deepseek = std::env::var("DEEPSEEK_API_KEY").is_ok()
        || (provider == "deepseek" && std::env::var("OPENAI_API_KEY").is_ok());
    let use_openai = std::env::var("OPENAI_API_KEY").is_ok() && provider != "deepseek";

    if use_deepseek {
        let model = cfg
            .llm
            .deepseek
            .model
            .clone()
            .unwrap_or_else(|| cfg.llm.model.clone());
        tracing::info!("Using DeepSeek LLM ({})", model);
        Ok(Arc::new(create_deepseek_client(Some(&model))))
    } else if use_openai {
        let model = cfg
            .llm
            .openai
            .model
            .clone()
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        let base = cfg.llm.base_url.as_deref();
        tracing::info!("Using OpenAI LLM ({})", model);
        Ok(Arc::new(OpenAiClient::new(
            base,
            &model,
            std::env::var("OPENAI_API_KEY").ok().as_deref(),
        )))
    } else {
        Err(AgentError::ConfigError(
            "no LLM API key found: set DEEPSEEK_API_KEY or OPENAI_API_KEY".to_string(),
        ))
    }
}

/// Orchestrator 构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    scope_decider: Option<Arc<dyn ScopeDecider>>,
    research_decider: Option<Arc<dyn ResearchDecider>>,
    compressor: Option<Arc<dyn Compressor>>,
    launcher: Option<Arc<dyn ProviderLauncher>>,
    store: Option<Arc<SessionStore>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            scope_decider: None,
            research_decider: None,
            compressor: None,
            launcher: None,
            store: None,
        }
    }

    /// 指定 LLM 客户端（否则按配置创建）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_scope_decider(mut self, decider: Arc<dyn ScopeDecider>) -> Self {
        self.scope_decider = Some(decider);
        self
    }

    pub fn with_research_decider(mut self, decider: Arc<dyn ResearchDecider>) -> Self {
        self.research_decider = Some(decider);
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// 指定提供方启动器（否则使用内置 workspace + 配置中的 MCP 进程）
    pub fn with_launcher(mut self, launcher: Arc<dyn ProviderLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 仅在某个策略缺省、需要 LLM 时才创建客户端
    fn llm(&mut self) -> Result<Arc<dyn LlmClient>, AgentError> {
        if let Some(llm) = &self.llm {
            return Ok(llm.clone());
        }
        let llm = create_llm_from_config(&self.config)?;
        self.llm = Some(llm.clone());
        Ok(llm)
    }

    pub fn build(mut self) -> Result<Orchestrator, AgentError> {
        if self.config.research.max_depth == 0 {
            return Err(AgentError::ConfigError(
                "research.max_depth must be at least 1".to_string(),
            ));
        }

        let scope_decider: Arc<dyn ScopeDecider> = match self.scope_decider.take() {
            Some(d) => d,
            None => Arc::new(LlmScopeDecider::new(self.llm()?)),
        };
        let research_decider: Arc<dyn ResearchDecider> = match self.research_decider.take() {
            Some(d) => d,
            None => Arc::new(ResearchPlanner::new(self.llm()?)),
        };
        let compressor: Arc<dyn Compressor> = match self.compressor.take() {
            Some(c) => c,
            None if self.config.research.compress_with_llm => {
                Arc::new(LlmCompressor::new(self.llm()?))
            }
            None => Arc::new(ExtractiveCompressor::new()),
        };
        let launcher: Arc<dyn ProviderLauncher> = match self.launcher.take() {
            Some(l) => l,
            None => Arc::new(DefaultProviderLauncher::from_config(&self.config.tools)),
        };

        let research = &self.config.research;
        let tools = &self.config.tools;
        let decision_timeout = Duration::from_secs(research.decision_timeout_secs);
        let registry = ToolRegistry::new(launcher, Duration::from_secs(tools.discovery_timeout_secs));

        tracing::info!(
            max_depth = research.max_depth,
            providers = tools.providers.len(),
            builtin_workspace = tools.builtin_workspace,
            "orchestrator configured"
        );

        Ok(Orchestrator::new(
            self.store.take().unwrap_or_default(),
            Arc::new(registry),
            ClarificationRouter::new(scope_decider, decision_timeout),
            research_decider,
            compressor,
            LoopLimits {
                max_depth: research.max_depth,
                tool_timeout: Duration::from_secs(tools.tool_timeout_secs),
                decision_timeout,
            },
        ))
    }
}

/// 便捷函数：加载配置并构建 Orchestrator
pub fn create_orchestrator(config_path: Option<PathBuf>) -> anyhow::Result<Orchestrator> {
    let config = load_config(config_path).context("Failed to load configuration")?;
    OrchestratorBuilder::new(config)
        .build()
        .context("Failed to build orchestrator")
}
