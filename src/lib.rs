//! Delve - 对话式代码库研究引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、会话存储、回合编排（Orchestrator）与构建器
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / 脚本化 Mock）
//! - **memory**: 对话消息
//! - **observability**: tracing 初始化
//! - **research**: 澄清路由、研究规划、有界研究循环、压缩
//! - **tools**: 工具提供方（内置 workspace / MCP）、注册表与执行器

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod research;
pub mod tools;

pub use crate::core::{Orchestrator, OrchestratorBuilder, TurnOutcome, TurnReply};
