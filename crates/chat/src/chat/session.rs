use std::time::{SystemTime, UNIX_EPOCH};

use quill_llm::StreamTarget;
use quill_storage::{
    ChatStateRecord, DEFAULT_SESSION_TOPIC, MessageRecord, MessageRole, MessageStatusRecord,
    SessionRecord,
};

/// Maximum characters of the first user message used as an automatic topic.
const TOPIC_EXCERPT_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl SessionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl From<Role> for quill_llm::Role {
    fn from(role: Role) -> Self {
        match role {
            Role::System => quill_llm::Role::System,
            Role::User => quill_llm::Role::User,
            Role::Assistant => quill_llm::Role::Assistant,
        }
    }
}

impl From<Role> for MessageRole {
    fn from(role: Role) -> Self {
        match role {
            Role::System => MessageRole::System,
            Role::User => MessageRole::User,
            Role::Assistant => MessageRole::Assistant,
        }
    }
}

impl From<MessageRole> for Role {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::System => Role::System,
            MessageRole::User => Role::User,
            MessageRole::Assistant => Role::Assistant,
        }
    }
}

/// Lifecycle state of one message.
///
/// `Streaming` marks an assistant placeholder that is still receiving chunks;
/// everything else is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Streaming,
    Done,
    Cancelled,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub created_at_unix_seconds: u64,
    pub status: MessageStatus,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            role,
            content: content.into(),
            created_at_unix_seconds: current_unix_timestamp_seconds(),
            status,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, MessageStatus::Done)
    }

    /// Empty assistant placeholder that a response stream will fill.
    pub fn assistant_streaming() -> Self {
        Self::new(Role::Assistant, "", MessageStatus::Streaming)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.status, MessageStatus::Streaming)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, MessageStatus::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub topic: String,
    pub messages: Vec<Message>,
    pub updated_at_unix_seconds: u64,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            topic: DEFAULT_SESSION_TOPIC.to_string(),
            messages: Vec::new(),
            updated_at_unix_seconds: current_unix_timestamp_seconds(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at_unix_seconds = current_unix_timestamp_seconds();
    }

    pub fn has_streaming_message(&self) -> bool {
        self.messages.iter().any(Message::is_streaming)
    }

    /// Index of the closest user message at or before `index`.
    ///
    /// The scan is inclusive so resending from a user message returns that
    /// message itself.
    pub fn nearest_user_message_before(&self, index: usize) -> Option<usize> {
        let start = index.min(self.messages.len().saturating_sub(1));
        self.messages
            .get(..=start)?
            .iter()
            .rposition(|message| matches!(message.role, Role::User))
    }
}

/// All sessions plus the selection cursor.
///
/// The session list is never empty; deleting the last session replaces it
/// with a fresh one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatState {
    pub sessions: Vec<Session>,
    pub current_index: usize,
}

impl Default for ChatState {
    fn default() -> Self {
        Self {
            sessions: vec![Session::new(SessionId::new(1))],
            current_index: 0,
        }
    }
}

impl ChatState {
    pub fn current_session(&self) -> &Session {
        &self.sessions[self.current_index]
    }

    pub fn current_session_mut(&mut self) -> &mut Session {
        &mut self.sessions[self.current_index]
    }

    pub fn next_session_id(&self) -> SessionId {
        let max = self
            .sessions
            .iter()
            .map(|session| session.id.0)
            .max()
            .unwrap_or(0);
        SessionId::new(max + 1)
    }

    pub fn message_mut(&mut self, target: StreamTarget) -> Option<&mut Message> {
        self.sessions
            .get_mut(target.session_index)?
            .messages
            .get_mut(target.message_index)
    }

    pub fn to_record(&self) -> ChatStateRecord {
        ChatStateRecord {
            sessions: self
                .sessions
                .iter()
                .map(|session| SessionRecord {
                    id: session.id.0,
                    topic: session.topic.clone(),
                    updated_at_unix_seconds: session.updated_at_unix_seconds,
                    messages: session
                        .messages
                        .iter()
                        .map(|message| MessageRecord {
                            role: message.role.into(),
                            content: message.content.clone(),
                            created_at_unix_seconds: message.created_at_unix_seconds,
                            status: match &message.status {
                                MessageStatus::Streaming => MessageStatusRecord::Streaming,
                                MessageStatus::Done => MessageStatusRecord::Done,
                                MessageStatus::Cancelled => MessageStatusRecord::Cancelled,
                                MessageStatus::Error(details) => {
                                    MessageStatusRecord::Error(details.clone())
                                }
                            },
                        })
                        .collect(),
                })
                .collect(),
            current_index: self.current_index,
        }
    }

    /// Rebuilds runtime state from a stored snapshot.
    ///
    /// Messages persisted as `Streaming` belong to a stream that died with a
    /// previous process, so they come back as `Cancelled`.
    pub fn from_record(record: ChatStateRecord) -> Self {
        let mut sessions = record
            .sessions
            .into_iter()
            .map(|session| Session {
                id: SessionId::new(session.id),
                topic: session.topic,
                updated_at_unix_seconds: session.updated_at_unix_seconds,
                messages: session
                    .messages
                    .into_iter()
                    .map(|message| Message {
                        role: message.role.into(),
                        content: message.content,
                        created_at_unix_seconds: message.created_at_unix_seconds,
                        status: match message.status {
                            MessageStatusRecord::Streaming | MessageStatusRecord::Cancelled => {
                                MessageStatus::Cancelled
                            }
                            MessageStatusRecord::Done => MessageStatus::Done,
                            MessageStatusRecord::Error(details) => MessageStatus::Error(details),
                        },
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();

        if sessions.is_empty() {
            sessions.push(Session::new(SessionId::new(1)));
        }
        let current_index = record.current_index.min(sessions.len() - 1);

        Self {
            sessions,
            current_index,
        }
    }
}

/// Derives a session topic from the first user message.
pub fn topic_excerpt(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }

    let excerpt = trimmed
        .chars()
        .take(TOPIC_EXCERPT_LIMIT)
        .collect::<String>();
    Some(excerpt)
}

pub fn current_unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(messages: Vec<Message>) -> Session {
        let mut session = Session::new(SessionId::new(1));
        session.messages = messages;
        session
    }

    #[test]
    fn nearest_user_message_scan_is_inclusive() {
        let session = session_with(vec![
            Message::user("first"),
            Message::new(Role::Assistant, "reply", MessageStatus::Done),
            Message::user("second"),
            Message::new(Role::Assistant, "reply", MessageStatus::Done),
        ]);

        assert_eq!(session.nearest_user_message_before(3), Some(2));
        assert_eq!(session.nearest_user_message_before(2), Some(2));
        assert_eq!(session.nearest_user_message_before(1), Some(0));
    }

    #[test]
    fn nearest_user_message_handles_missing_user_turns() {
        let session = session_with(vec![Message::new(
            Role::Assistant,
            "unsolicited",
            MessageStatus::Done,
        )]);
        assert_eq!(session.nearest_user_message_before(0), None);

        let empty = session_with(Vec::new());
        assert_eq!(empty.nearest_user_message_before(0), None);
    }

    #[test]
    fn from_record_normalizes_stale_streaming_messages() {
        let mut state = ChatState::default();
        state.current_session_mut().messages = vec![
            Message::user("Hello"),
            Message::assistant_streaming(),
        ];

        let reloaded = ChatState::from_record(state.to_record());
        let status = reloaded.current_session().messages[1].status.clone();
        assert_eq!(status, MessageStatus::Cancelled);
    }

    #[test]
    fn from_record_guarantees_a_session_and_valid_cursor() {
        let reloaded = ChatState::from_record(ChatStateRecord {
            sessions: Vec::new(),
            current_index: 9,
        });
        assert_eq!(reloaded.sessions.len(), 1);
        assert_eq!(reloaded.current_index, 0);
        assert_eq!(reloaded.current_session().topic, DEFAULT_SESSION_TOPIC);
    }

    #[test]
    fn next_session_id_is_one_past_the_maximum() {
        let mut state = ChatState::default();
        assert_eq!(state.next_session_id(), SessionId::new(2));

        state.sessions.push(Session::new(SessionId::new(7)));
        assert_eq!(state.next_session_id(), SessionId::new(8));
    }

    #[test]
    fn topic_excerpt_trims_and_truncates() {
        assert_eq!(topic_excerpt("  Hello  "), Some("Hello".to_string()));
        assert_eq!(topic_excerpt("   "), None);

        let long = "x".repeat(80);
        assert_eq!(topic_excerpt(&long).map(|t| t.chars().count()), Some(50));
    }
}
