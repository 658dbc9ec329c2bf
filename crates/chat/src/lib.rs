pub mod chat;
pub mod config;

pub use chat::{
    ChatError, ChatResult, ChatState, ChatStore, ControllerRegistry, IngestOutcome, Message,
    MessageStatus, Prompt, PromptHinter, PromptStore, Role, Session, SessionId, SubmitHandle,
};
pub use config::ChatConfig;
