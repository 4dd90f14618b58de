//! MCP 工具提供方：以子进程启动外部 MCP server，经 stdio 交换 NDJSON 格式的 JSON-RPC 2.0 消息
//!
//! 启动后完成 initialize 握手并发送 notifications/initialized；list 对应 tools/list（支持分页游标），
//! invoke 对应 tools/call。同一提供方上的请求经 Mutex 串行，子进程随提供方一起释放（kill_on_drop）。

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::ProviderSpec;
use crate::core::AgentError;
use crate::tools::provider::{ToolInfo, ToolProvider};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// MCP 协议层错误
#[derive(Error, Debug)]
pub enum McpError {
    #[error("Failed to spawn {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport closed while waiting for response")]
    Closed,

    #[error("Invalid JSON-RPC message: {0}")]
    Parse(String),

    #[error("Server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for McpError {
    fn from(e: std::io::Error) -> Self {
        McpError::Transport(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// 收到的任意 JSON-RPC 消息（响应、通知或服务端请求）
#[derive(Debug, Deserialize)]
struct IncomingMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListToolsResult {
    tools: Vec<ToolInfo>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallToolResult {
    #[serde(default)]
    content: Vec<ToolContent>,
    #[serde(default)]
    is_error: Option<bool>,
}

impl CallToolResult {
    fn into_text(self) -> (bool, String) {
        let text = self
            .content
            .into_iter()
            .map(|c| match c {
                ToolContent::Text { text } => text,
                ToolContent::Image { mime_type } => format!("[image: {}]", mime_type),
                ToolContent::Other => "[unsupported content]".to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        (self.is_error.unwrap_or(false), text)
    }
}

/// 握手返回的服务端信息
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
}

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 连接状态跨越被取消的调用保留：未写完的字节留在 outbox，未读完的一行留在 line_buf，
/// 因此超时打断一次调用后，下一次调用仍能从正确的位置继续读写
struct Connection {
    reader: BufReader<BoxReader>,
    writer: BoxWriter,
    next_id: i64,
    line_buf: Vec<u8>,
    outbox: Vec<u8>,
}

impl Connection {
    fn new(reader: BoxReader, writer: BoxWriter) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            next_id: 1,
            line_buf: Vec::new(),
            outbox: Vec::new(),
        }
    }

    async fn write_message(&mut self, message: &Value) -> Result<(), McpError> {
        serde_json::to_writer(&mut self.outbox, message).map_err(|e| McpError::Parse(e.to_string()))?;
        self.outbox.push(b'\n');
        while !self.outbox.is_empty() {
            let n = self.writer.write(&self.outbox).await?;
            if n == 0 {
                return Err(McpError::Closed);
            }
            self.outbox.drain(..n);
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<IncomingMessage, McpError> {
        loop {
            let n = self.reader.read_until(b'\n', &mut self.line_buf).await?;
            if n == 0 {
                return Err(McpError::Closed);
            }
            if self.line_buf.last() != Some(&b'\n') {
                // EOF 前的最后一段不完整输出
                self.line_buf.clear();
                return Err(McpError::Closed);
            }
            let line = std::mem::take(&mut self.line_buf);
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed).map_err(|e| McpError::Parse(e.to_string()));
        }
    }

    async fn notify(&mut self, method: &str) -> Result<(), McpError> {
        self.write_message(&json!({ "jsonrpc": "2.0", "method": method }))
            .await
    }

    /// 发送请求并等待同 id 的响应；期间收到的通知与服务端请求被跳过
    async fn request(&mut self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.next_id;
        self.next_id += 1;
        self.write_message(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;

        loop {
            let msg = self.read_message().await?;
            if msg.method.is_some() {
                tracing::debug!(method = ?msg.method, "skipping server-initiated MCP message");
                continue;
            }
            if msg.id.as_ref().and_then(|v| v.as_i64()) != Some(id) {
                tracing::debug!(expected = id, got = ?msg.id, "skipping unmatched MCP response");
                continue;
            }
            if let Some(err) = msg.error {
                return Err(McpError::Server {
                    code: err.code,
                    message: err.message,
                });
            }
            return msg
                .result
                .ok_or_else(|| McpError::Protocol(format!("{} response has no result", method)));
        }
    }
}

/// 基于 MCP 的工具提供方
pub struct McpProvider {
    name: String,
    server: ServerInfo,
    conn: Mutex<Connection>,
    _child: Option<Child>,
}

impl McpProvider {
    /// 启动子进程（参数中 {{target}} 替换为目标目录）并完成握手
    pub async fn spawn(spec: &ProviderSpec, target: &Path) -> Result<Self, McpError> {
        let mut child = Command::new(&spec.command)
            .args(spec.args_for(target))
            .envs(&spec.env)
            .current_dir(target)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::Spawn {
                command: spec.command.clone(),
                reason: e.to_string(),
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("Failed to capture child stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("Failed to capture child stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            let provider = spec.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(provider = %provider, "{}", line);
                }
            });
        }

        let mut provider = Self::connect(&spec.name, stdout, stdin).await?;
        provider._child = Some(child);
        Ok(provider)
    }

    /// 在任意读写流上完成握手（子进程 stdio 或测试用内存管道）
    pub async fn connect<R, W>(name: &str, reader: R, writer: W) -> Result<Self, McpError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut conn = Connection::new(Box::new(reader), Box::new(writer));

        let result = conn
            .request(
                "initialize",
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "delve",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }),
            )
            .await?;

        let server = ServerInfo {
            name: result["serverInfo"]["name"]
                .as_str()
                .unwrap_or("unknown")
                .into(),
            version: result["serverInfo"]["version"]
                .as_str()
                .unwrap_or("0.0.0")
                .into(),
            protocol_version: result["protocolVersion"]
                .as_str()
                .unwrap_or(MCP_PROTOCOL_VERSION)
                .into(),
        };
        conn.notify("notifications/initialized").await?;

        tracing::info!(
            provider = %name,
            server = %server.name,
            version = %server.version,
            "MCP provider initialized"
        );

        Ok(Self {
            name: name.to_string(),
            server,
            conn: Mutex::new(conn),
            _child: None,
        })
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server
    }
}

#[async_trait]
impl ToolProvider for McpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self) -> Result<Vec<ToolInfo>, AgentError> {
        let unavailable = |e: McpError| AgentError::ProviderUnavailable {
            provider: self.name.clone(),
            reason: e.to_string(),
        };
        let mut conn = self.conn.lock().await;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = conn.request("tools/list", params).await.map_err(unavailable)?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| unavailable(McpError::Parse(e.to_string())))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        tracing::debug!(provider = %self.name, count = tools.len(), "discovered MCP tools");
        Ok(tools)
    }

    async fn invoke(&self, tool: &str, args: Value) -> Result<String, String> {
        let mut conn = self.conn.lock().await;
        let result = conn
            .request("tools/call", json!({ "name": tool, "arguments": args }))
            .await
            .map_err(|e| e.to_string())?;
        let parsed: CallToolResult =
            serde_json::from_value(result).map_err(|e| format!("invalid tools/call result: {}", e))?;
        match parsed.into_text() {
            (true, text) => Err(text),
            (false, text) => Ok(text),
        }
    }
}
