//! 对话消息
//!
//! Thread 历史与研究 Transcript 共用的消息结构；一经追加即不可变，顺序即语义。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致；System 仅用于发往模型的提示，不写入 Thread）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// 单条消息；Tool 消息与发起它的 Assistant 消息通过 tool_call_id 关联
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
        }
    }

    /// 工具调用请求（Assistant 发出，携带调用 ID）
    pub fn tool_request(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
        }
    }

    /// 工具结果（成功载荷或错误描述）
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
        }
    }

    pub fn is_tool_request(&self) -> bool {
        self.role == Role::Assistant && self.tool_call_id.is_some()
    }
}

/// 把消息序列拼成纯文本（供决策提示使用），每行形如 `user: ...`
pub fn render_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
                Role::System => "system",
            };
            format!("{}: {}", role, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_messages_share_call_id() {
        let req = Message::tool_request("call_1", r#"{"tool":"read_file"}"#);
        let res = Message::tool_result("call_1", "fn main() {}");
        assert!(req.is_tool_request());
        assert!(!res.is_tool_request());
        assert_eq!(req.tool_call_id, res.tool_call_id);
        assert_eq!(res.role, Role::Tool);
    }

    #[test]
    fn test_render_history() {
        let text = render_history(&[Message::user("look at auth"), Message::assistant("which repo?")]);
        assert_eq!(text, "user: look at auth\nassistant: which repo?");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::tool_result("c", "x")).unwrap();
        assert!(json.contains("\"role\":\"tool\""));
        assert!(json.contains("\"tool_call_id\":\"c\""));
    }
}
