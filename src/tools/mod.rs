pub mod executor;
pub mod mcp;
pub mod provider;
pub mod registry;
pub mod schema;
pub mod workspace;

pub use executor::ToolExecutor;
pub use mcp::{McpError, McpProvider};
pub use provider::{DefaultProviderLauncher, ProviderLauncher, ToolInfo, ToolProvider};
pub use registry::{ToolCatalog, ToolDescriptor, ToolRegistry};
pub use schema::tool_call_schema_json;
pub use workspace::{SafeFs, WorkspaceProvider};
