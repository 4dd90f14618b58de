//! 会话存储
//!
//! ThreadId -> Thread（消息历史 + 研究简报 + 状态）。仅进程内保存；
//! append 是唯一的消息写入口，简报与状态由澄清路由每个线程最多写入一次。
//! 同一线程的多个回合通过 TurnGuard（公平的异步互斥锁）按到达顺序串行处理。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::core::AgentError;
use crate::memory::Message;

/// 线程 ID（不透明字符串，由调用边界生成）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(String);

impl ThreadId {
    /// 生成新的线程 ID（v4 UUID）
    pub fn generate() -> Self {
        Self(format!("thread_{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ThreadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 线程状态：AWAITING_INPUT -> BRIEF_PENDING -> BRIEF_READY
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadStatus {
    AwaitingInput,
    BriefPending,
    BriefReady,
}

/// 单个线程的快照
#[derive(Clone, Debug, Serialize)]
pub struct Thread {
    pub id: ThreadId,
    pub messages: Vec<Message>,
    pub brief: Option<String>,
    pub status: ThreadStatus,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    fn new(id: ThreadId) -> Self {
        Self {
            id,
            messages: Vec::new(),
            brief: None,
            status: ThreadStatus::AwaitingInput,
            created_at: Utc::now(),
        }
    }
}

struct ThreadSlot {
    thread: Thread,
    /// 回合锁：持有期间同一线程的其他回合排队等待
    turn_lock: Arc<Mutex<()>>,
}

/// 回合守卫；drop 时释放线程，下一个排队的回合开始
pub struct TurnGuard {
    thread_id: ThreadId,
    _guard: OwnedMutexGuard<()>,
}

impl TurnGuard {
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }
}

/// 会话存储：进程内 HashMap，读写经 RwLock
#[derive(Default)]
pub struct SessionStore {
    threads: RwLock<HashMap<ThreadId, ThreadSlot>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以给定 ID 创建线程；ID 已存在时保持原线程不变
    pub async fn create_thread(&self, id: ThreadId) -> ThreadId {
        let mut threads = self.threads.write().await;
        threads.entry(id.clone()).or_insert_with(|| {
            tracing::debug!(thread = %id, "thread created");
            ThreadSlot {
                thread: Thread::new(id.clone()),
                turn_lock: Arc::new(Mutex::new(())),
            }
        });
        id
    }

    /// 追加一条消息并返回追加后的线程快照
    pub async fn append(&self, id: &ThreadId, message: Message) -> Result<Thread, AgentError> {
        self.with_thread(id, |t| {
            t.messages.push(message);
            t.clone()
        })
        .await
    }

    pub async fn get(&self, id: &ThreadId) -> Result<Thread, AgentError> {
        let threads = self.threads.read().await;
        threads
            .get(id)
            .map(|slot| slot.thread.clone())
            .ok_or_else(|| AgentError::UnknownThread(id.to_string()))
    }

    pub async fn contains(&self, id: &ThreadId) -> bool {
        self.threads.read().await.contains_key(id)
    }

    /// AWAITING_INPUT -> BRIEF_PENDING；其余状态不变
    pub async fn mark_pending(&self, id: &ThreadId) -> Result<ThreadStatus, AgentError> {
        self.with_thread(id, |t| {
            if t.status == ThreadStatus::AwaitingInput {
                t.status = ThreadStatus::BriefPending;
            }
            t.status
        })
        .await
    }

    /// 写入研究简报并置为 BRIEF_READY；每个线程仅允许一次
    pub async fn finalize_brief(
        &self,
        id: &ThreadId,
        brief: impl Into<String>,
    ) -> Result<Thread, AgentError> {
        let brief = brief.into();
        self.with_thread(id, |t| {
            if t.brief.is_some() {
                return Err(AgentError::BriefAlreadySet(t.id.to_string()));
            }
            t.brief = Some(brief);
            t.status = ThreadStatus::BriefReady;
            Ok(t.clone())
        })
        .await?
    }

    /// 等待并占用线程的回合锁（公平锁，按到达顺序）
    pub async fn begin_turn(&self, id: &ThreadId) -> Result<TurnGuard, AgentError> {
        let lock = {
            let threads = self.threads.read().await;
            let slot = threads
                .get(id)
                .ok_or_else(|| AgentError::UnknownThread(id.to_string()))?;
            slot.turn_lock.clone()
        };
        let guard = lock.lock_owned().await;
        Ok(TurnGuard {
            thread_id: id.clone(),
            _guard: guard,
        })
    }

    /// 当前线程数
    pub async fn len(&self) -> usize {
        self.threads.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.threads.read().await.is_empty()
    }

    async fn with_thread<F, R>(&self, id: &ThreadId, f: F) -> Result<R, AgentError>
    where
        F: FnOnce(&mut Thread) -> R,
    {
        let mut threads = self.threads.write().await;
        threads
            .get_mut(id)
            .map(|slot| f(&mut slot.thread))
            .ok_or_else(|| AgentError::UnknownThread(id.to_string()))
    }
}
