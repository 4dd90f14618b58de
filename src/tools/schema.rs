//! 工具调用 JSON Schema 生成（schemars）
//!
//! 将「合法 tool call」的 JSON 结构注入规划提示，减少模型输出格式错误。

use schemars::{schema_for, JsonSchema};
use std::collections::HashMap;

/// 工具调用请求格式：与规划器解析的 `{"tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，必须是当前目录中列出的某个工具
    pub tool: String,
    /// 工具参数，须符合该工具的 input schema（path、pattern、depth 等）
    pub args: HashMap<String, serde_json::Value>,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
