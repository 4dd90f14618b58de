//! 工具注册表
//!
//! discover(target) 校验目标目录、启动提供方、汇总各提供方的工具为扁平目录（ToolCatalog）。
//! 目录按规范化路径缓存：填充后可并发读取；同一路径的发现过程串行（每个路径同时最多一次发现）。
//! 目录只对发现时的目标路径有效，换路径即重新发现。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::core::AgentError;
use crate::tools::provider::{ProviderLauncher, ToolInfo, ToolProvider};

/// 目录中的单个工具：名称、描述、参数 schema 与调用能力（委托给所属提供方）
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    provider: Arc<dyn ToolProvider>,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("provider", &self.provider.name())
            .finish()
    }
}

impl ToolDescriptor {
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// 调用工具；失败统一为 ToolInvocation
    pub async fn invoke(&self, args: Value) -> Result<String, AgentError> {
        self.provider
            .invoke(&self.name, args)
            .await
            .map_err(|cause| AgentError::ToolInvocation {
                tool: self.name.clone(),
                cause,
            })
    }
}

/// 扁平工具目录（按名称排序）
#[derive(Debug)]
pub struct ToolCatalog {
    target: PathBuf,
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolCatalog {
    /// 汇总各提供方的工具；跨提供方重名返回 ToolNameConflict
    pub fn from_listings(
        target: impl Into<PathBuf>,
        listings: Vec<(Arc<dyn ToolProvider>, Vec<ToolInfo>)>,
    ) -> Result<Self, AgentError> {
        let mut tools: BTreeMap<String, ToolDescriptor> = BTreeMap::new();
        for (provider, infos) in listings {
            for info in infos {
                if let Some(existing) = tools.get(&info.name) {
                    return Err(AgentError::ToolNameConflict {
                        name: info.name,
                        first: existing.provider_name().to_string(),
                        second: provider.name().to_string(),
                    });
                }
                tools.insert(
                    info.name.clone(),
                    ToolDescriptor {
                        name: info.name,
                        description: info.description,
                        input_schema: info.input_schema,
                        provider: provider.clone(),
                    },
                );
            }
        }
        Ok(Self {
            target: target.into(),
            tools,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// (name, description) 列表，描述超过 80 字符时截断
    pub fn summaries(&self) -> Vec<(String, String)> {
        self.tools
            .values()
            .map(|t| {
                let desc = if t.description.chars().count() > 80 {
                    format!("{}...", t.description.chars().take(77).collect::<String>())
                } else {
                    t.description.clone()
                };
                (t.name.clone(), desc)
            })
            .collect()
    }

    /// 工具 schema JSON（注入规划提示）
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tools
            .values()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

type CatalogSlot = Arc<Mutex<Option<Arc<ToolCatalog>>>>;

/// 工具注册表：按目标路径缓存目录，发现时启动提供方
pub struct ToolRegistry {
    launcher: Arc<dyn ProviderLauncher>,
    discovery_timeout: Duration,
    catalogs: RwLock<HashMap<PathBuf, CatalogSlot>>,
}

impl ToolRegistry {
    pub fn new(launcher: Arc<dyn ProviderLauncher>, discovery_timeout: Duration) -> Self {
        Self {
            launcher,
            discovery_timeout,
            catalogs: RwLock::new(HashMap::new()),
        }
    }

    /// 校验目标目录：绝对路径、存在、是目录、可读；返回规范化路径
    pub async fn validate_target(target: &Path) -> Result<PathBuf, AgentError> {
        let invalid = |reason: &str| AgentError::InvalidTarget {
            path: target.to_path_buf(),
            reason: reason.to_string(),
        };
        if !target.is_absolute() {
            return Err(invalid("path must be absolute"));
        }
        let meta = tokio::fs::metadata(target)
            .await
            .map_err(|e| invalid(&format!("not accessible: {}", e)))?;
        if !meta.is_dir() {
            return Err(invalid("not a directory"));
        }
        tokio::fs::read_dir(target)
            .await
            .map_err(|e| invalid(&format!("not readable: {}", e)))?;
        tokio::fs::canonicalize(target)
            .await
            .map_err(|e| invalid(&format!("cannot canonicalize: {}", e)))
    }

    /// 发现目标目录下的工具目录；已缓存则直接返回
    pub async fn discover(&self, target: &Path) -> Result<Arc<ToolCatalog>, AgentError> {
        self.discover_inner(target, false).await
    }

    /// 丢弃缓存并重新发现（提供方自身状态变化时使用）
    pub async fn refresh(&self, target: &Path) -> Result<Arc<ToolCatalog>, AgentError> {
        self.discover_inner(target, true).await
    }

    async fn discover_inner(
        &self,
        target: &Path,
        force: bool,
    ) -> Result<Arc<ToolCatalog>, AgentError> {
        let canonical = Self::validate_target(target).await?;
        let slot = self.slot_for(&canonical).await;

        let mut guard = slot.lock().await;
        if !force {
            if let Some(catalog) = guard.as_ref() {
                return Ok(catalog.clone());
            }
        }

        let catalog = Arc::new(self.populate(&canonical).await?);
        tracing::info!(
            target = %canonical.display(),
            tools = catalog.len(),
            "tool catalog discovered"
        );
        *guard = Some(catalog.clone());
        Ok(catalog)
    }

    async fn slot_for(&self, canonical: &Path) -> CatalogSlot {
        if let Some(slot) = self.catalogs.read().await.get(canonical) {
            return slot.clone();
        }
        self.catalogs
            .write()
            .await
            .entry(canonical.to_path_buf())
            .or_default()
            .clone()
    }

    async fn populate(&self, canonical: &Path) -> Result<ToolCatalog, AgentError> {
        let providers = self.launcher.launch(canonical).await?;
        let timeout = self.discovery_timeout;
        let listings = try_join_all(providers.into_iter().map(|provider| async move {
            let infos = tokio::time::timeout(timeout, provider.list())
                .await
                .map_err(|_| AgentError::ProviderUnavailable {
                    provider: provider.name().to_string(),
                    reason: format!("tools/list timed out after {:?}", timeout),
                })??;
            Ok::<_, AgentError>((provider, infos))
        }))
        .await?;
        ToolCatalog::from_listings(canonical, listings)
    }
}
