//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DELVE__*` 覆盖（双下划线表示嵌套，如 `DELVE__RESEARCH__MAX_DEPTH=20`）。
//! 引擎只消费配置（工具提供方启动参数、递归深度上限、各类超时），不负责凭据加载。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub research: ResearchSection,
    pub tools: ToolsSection,
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub deepseek: LlmModelSection,
    #[serde(default)]
    pub openai: LlmModelSection,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            deepseek: LlmModelSection::default(),
            openai: LlmModelSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmModelSection {
    pub model: Option<String>,
}

/// [research] 段：研究循环深度与决策超时
#[derive(Debug, Clone, Deserialize)]
pub struct ResearchSection {
    /// 单次研究循环最多执行的工具调用轮数
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// 单次决策（澄清判定 / 规划）调用超时（秒）
    #[serde(default = "default_decision_timeout_secs")]
    pub decision_timeout_secs: u64,
    /// 循环未得出最终答案时是否让 LLM 归纳已有观察
    #[serde(default)]
    pub compress_with_llm: bool,
}

pub const DEFAULT_MAX_DEPTH: usize = 50;

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_decision_timeout_secs() -> u64 {
    60
}

impl Default for ResearchSection {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            decision_timeout_secs: default_decision_timeout_secs(),
            compress_with_llm: false,
        }
    }
}

/// [tools] 段：工具超时、内置工作区工具、外部提供方
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 提供方启动 + tools/list 超时（秒）
    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,
    /// 是否注册进程内 workspace 提供方（list_directory / read_file / search_files / directory_tree）
    #[serde(default = "default_true")]
    pub builtin_workspace: bool,
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: usize,
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,
    /// [[tools.providers]]：外部 MCP 提供方
    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_discovery_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_max_read_bytes() -> usize {
    256 * 1024
}

fn default_max_search_results() -> usize {
    50
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            discovery_timeout_secs: default_discovery_timeout_secs(),
            builtin_workspace: true,
            max_read_bytes: default_max_read_bytes(),
            max_search_results: default_max_search_results(),
            providers: Vec::new(),
        }
    }
}

/// 外部工具提供方启动参数；args 中的 {{target}} 替换为目标目录
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProviderSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ProviderSpec {
    /// 替换 {{target}} 后的启动参数
    pub fn args_for(&self, target: &Path) -> Vec<String> {
        let target = target.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace("{{target}}", &target))
            .collect()
    }
}

/// 从 config 目录加载配置，环境变量 DELVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DELVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DELVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
