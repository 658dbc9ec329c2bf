use serde::{Deserialize, Serialize};

pub const DEFAULT_SESSION_TOPIC: &str = "New Conversation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Terminal and in-flight states of a stored message.
///
/// `Streaming` can only appear on disk when the process died mid-stream;
/// loaders are expected to normalize it to `Cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatusRecord {
    Streaming,
    Done,
    Cancelled,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub role: MessageRole,
    pub content: String,
    pub created_at_unix_seconds: u64,
    pub status: MessageStatusRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: u64,
    pub topic: String,
    pub updated_at_unix_seconds: u64,
    pub messages: Vec<MessageRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStateRecord {
    pub sessions: Vec<SessionRecord>,
    #[serde(default)]
    pub current_index: usize,
}
