mod ingest;
mod prompt;
mod registry;
mod session;
mod store;

pub use ingest::{IngestContext, IngestOutcome, run_ingest};
pub use prompt::{
    Debouncer, Prompt, PromptHinter, PromptStore, SEARCH_DEBOUNCE, SEARCH_TEXT_LIMIT,
    autocomplete_query,
};
pub use registry::{CancelToken, ControllerRegistry};
pub use session::{
    ChatState, Message, MessageStatus, Role, Session, SessionId, current_unix_timestamp_seconds,
    topic_excerpt,
};
pub use store::{ChatError, ChatResult, ChatStore, SubmitHandle};
