//! 脚本化 Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序弹出预置回复；脚本耗尽后返回错误。同时记录每次调用收到的消息，便于断言提示内容。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::Message;

/// 按顺序返回预置回复的客户端
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|s| Ok(s.into())).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 追加一条回复
    pub fn push_reply(&self, reply: impl Into<String>) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(Ok(reply.into()));
        }
    }

    /// 追加一次失败（模拟服务不可用）
    pub fn push_error(&self, error: impl Into<String>) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(Err(error.into()));
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// 第 n 次调用收到的消息
    pub fn call(&self, n: usize) -> Option<Vec<Message>> {
        self.calls.lock().ok().and_then(|c| c.get(n).cloned())
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        self.replies
            .lock()
            .map_err(|e| e.to_string())?
            .pop_front()
            .unwrap_or_else(|| Err("mock script exhausted".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let llm = ScriptedLlmClient::new(["a", "b"]);
        llm.push_error("down");
        assert_eq!(llm.complete(&[]).await.unwrap(), "a");
        assert_eq!(llm.complete(&[Message::user("x")]).await.unwrap(), "b");
        assert_eq!(llm.complete(&[]).await.unwrap_err(), "down");
        assert!(llm.complete(&[]).await.is_err());
        assert_eq!(llm.call_count(), 4);
        assert_eq!(llm.call(1).unwrap()[0].content, "x");
    }
}
