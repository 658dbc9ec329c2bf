pub mod error;
pub mod json_file;
pub mod memory;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use json_file::{DEFAULT_STORE_RELATIVE_PATH, JsonFileStore};
pub use memory::MemoryStore;
pub use types::{
    ChatStateRecord, DEFAULT_SESSION_TOPIC, MessageRecord, MessageRole, MessageStatusRecord,
    SessionRecord,
};

/// Whole-state persistence seam for the chat engine.
///
/// The engine saves the full snapshot on every mutation, so implementations
/// only need load-all and replace-all semantics.
pub trait StateStore: Send + Sync {
    fn load(&self) -> StorageResult<Option<ChatStateRecord>>;
    fn save(&self, state: &ChatStateRecord) -> StorageResult<()>;
}
