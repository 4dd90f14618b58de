//! 消息层：Thread 历史与 Transcript 共用的 Message / Role

pub mod conversation;

pub use conversation::{render_history, Message, Role};
