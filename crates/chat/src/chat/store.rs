use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use quill_llm::{LlmProvider, ProviderMessage, StreamRequest, StreamTarget};
use quill_storage::{StateStore, StorageError};
use snafu::{ResultExt, Snafu};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::ingest::{IngestContext, IngestOutcome, run_ingest};
use super::registry::ControllerRegistry;
use super::session::{ChatState, Message, MessageStatus, Session, SessionId};
use crate::config::ChatConfig;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("failed to load chat state on `{stage}`, {source}"))]
    LoadState {
        stage: &'static str,
        source: StorageError,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Handle to one in-flight submission.
///
/// Holding it is optional; the spawned tasks run to completion on their own.
pub struct SubmitHandle {
    target: StreamTarget,
    ingest: JoinHandle<IngestOutcome>,
    worker: JoinHandle<()>,
}

impl SubmitHandle {
    pub fn target(&self) -> StreamTarget {
        self.target
    }

    /// Waits for the stream to reach its terminal state.
    pub async fn wait(self) -> IngestOutcome {
        let outcome = match self.ingest.await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(target = ?self.target, error = %error, "ingest task panicked");
                IngestOutcome::Failed("ingest task panicked".to_string())
            }
        };
        let _ = self.worker.await;
        outcome
    }
}

/// Owns the session list and drives the streaming-response lifecycle.
///
/// Every mutation persists the full state snapshot and bumps the revision
/// counter that `subscribe` exposes.
pub struct ChatStore {
    state: Arc<RwLock<ChatState>>,
    registry: Arc<ControllerRegistry>,
    provider: Arc<dyn LlmProvider>,
    store: Arc<dyn StateStore>,
    config: ChatConfig,
    revision: Arc<watch::Sender<u64>>,
}

impl ChatStore {
    pub fn load(
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn StateStore>,
        config: ChatConfig,
    ) -> ChatResult<Self> {
        let state = match store.load().context(LoadStateSnafu { stage: "store-load" })? {
            Some(record) => ChatState::from_record(record),
            None => ChatState::default(),
        };

        let (revision, _) = watch::channel(0);
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            registry: Arc::new(ControllerRegistry::new()),
            provider,
            store,
            config,
            revision: Arc::new(revision),
        })
    }

    /// Sends `input` as a new user turn in the current session and opens a
    /// response stream into a fresh assistant placeholder.
    ///
    /// Returns `None` without touching state when the input is blank or the
    /// current session already has a response streaming.
    pub fn submit(&self, input: &str) -> Option<SubmitHandle> {
        let content = input.trim();
        if content.is_empty() {
            tracing::debug!("ignoring empty submission");
            return None;
        }

        let (target, request) = {
            let mut state = self.state_write();
            let session_index = state.current_index;
            let max_context_messages = self.config.max_context_messages;
            let session = state.current_session_mut();
            if session.has_streaming_message() {
                tracing::debug!(
                    session_index,
                    "ignoring submission while a response is streaming"
                );
                return None;
            }

            session.messages.push(Message::user(content));
            session.messages.push(Message::assistant_streaming());
            session.touch();

            let message_index = session.messages.len() - 1;
            let target = StreamTarget::new(session_index, message_index);
            let request = self.build_stream_request(target, session, max_context_messages);
            (target, request)
        };

        self.persist();
        self.bump_revision();
        self.open_stream(target, request)
    }

    /// Requests cancellation of the stream filling the message at
    /// (`session_index`, `message_index`); false when nothing is streaming
    /// there.
    pub fn stop(&self, session_index: usize, message_index: usize) -> bool {
        self.registry
            .stop(StreamTarget::new(session_index, message_index))
    }

    /// Re-submits the closest user turn at or before `message_index` in the
    /// current session as a brand-new exchange.
    pub fn resend(&self, message_index: usize) -> Option<SubmitHandle> {
        let content = {
            let state = self.state_read();
            let session = state.current_session();
            let Some(user_index) = session.nearest_user_message_before(message_index) else {
                tracing::debug!(message_index, "resend found no prior user message");
                return None;
            };
            session.messages[user_index].content.clone()
        };

        self.submit(&content)
    }

    pub fn new_session(&self) -> SessionId {
        let id = {
            let mut state = self.state_write();
            let id = state.next_session_id();
            state.sessions.push(Session::new(id));
            state.current_index = state.sessions.len() - 1;
            id
        };

        self.persist();
        self.bump_revision();
        tracing::info!(session_id = id.0, "created session");
        id
    }

    pub fn switch_session(&self, index: usize) -> bool {
        {
            let mut state = self.state_write();
            if index >= state.sessions.len() {
                return false;
            }
            state.current_index = index;
        }

        self.persist();
        self.bump_revision();
        true
    }

    /// Removes the session at `index`, cancelling streams whose positions the
    /// removal would invalidate. The list never becomes empty; removing the
    /// last session leaves one fresh session behind.
    pub fn remove_session(&self, index: usize) -> bool {
        {
            let state = self.state_read();
            if index >= state.sessions.len() {
                return false;
            }
        }

        self.registry.stop_sessions_from(index);

        {
            let mut state = self.state_write();
            if index >= state.sessions.len() {
                return false;
            }

            // The streams just cancelled were keyed by pre-removal positions,
            // so their ingest tasks can no longer resolve the placeholders.
            // Finalize those messages here instead of leaving them streaming.
            for session in state.sessions.iter_mut().skip(index) {
                for message in &mut session.messages {
                    if message.is_streaming() {
                        message.status = MessageStatus::Cancelled;
                    }
                }
            }

            let removed = state.sessions.remove(index);
            tracing::info!(session_id = removed.id.0, "removed session");

            if state.sessions.is_empty() {
                state.sessions.push(Session::new(SessionId::new(1)));
                state.current_index = 0;
            } else if state.current_index > index {
                state.current_index -= 1;
            } else {
                state.current_index = state.current_index.min(state.sessions.len() - 1);
            }
        }

        self.persist();
        self.bump_revision();
        true
    }

    /// An explicit rename keeps the caller's full text; only automatic topics
    /// are excerpted.
    pub fn rename_session(&self, index: usize, topic: &str) -> bool {
        let topic = topic.trim();
        if topic.is_empty() {
            return false;
        }

        {
            let mut state = self.state_write();
            let Some(session) = state.sessions.get_mut(index) else {
                return false;
            };
            session.topic = topic.to_string();
            session.touch();
        }

        self.persist();
        self.bump_revision();
        true
    }

    pub fn snapshot(&self) -> ChatState {
        self.state_read().clone()
    }

    /// Revision counter that changes on every state mutation, including chunk
    /// appends; callers re-read the snapshot when it moves.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn active_stream_count(&self) -> usize {
        self.registry.active_count()
    }

    fn build_stream_request(
        &self,
        target: StreamTarget,
        session: &Session,
        max_context_messages: usize,
    ) -> StreamRequest {
        let mut messages = session
            .messages
            .iter()
            .filter(|message| {
                !message.is_streaming()
                    && !message.is_error()
                    && !message.content.trim().is_empty()
            })
            .map(|message| ProviderMessage::new(message.role.into(), message.content.clone()))
            .collect::<Vec<_>>();

        // Only the most recent turns travel with the request.
        let overflow = messages.len().saturating_sub(max_context_messages);
        if overflow > 0 {
            messages.drain(..overflow);
        }

        let mut request = StreamRequest::new(target, self.config.model.clone(), messages);
        if !self.config.preamble.trim().is_empty() {
            request = request.with_preamble(self.config.preamble.clone());
        }
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }

    fn open_stream(&self, target: StreamTarget, request: StreamRequest) -> Option<SubmitHandle> {
        match self.provider.stream_chat(request) {
            Ok(handle) => {
                let cancel = self.registry.register(target);
                let worker = tokio::spawn(handle.worker);
                let ingest = tokio::spawn(run_ingest(
                    self.ingest_context(),
                    target,
                    handle.stream,
                    cancel,
                ));
                Some(SubmitHandle {
                    target,
                    ingest,
                    worker,
                })
            }
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    provider_id = %self.provider.id(),
                    error = %error,
                    "failed to open response stream"
                );
                self.fail_placeholder(target, &error.to_string());
                None
            }
        }
    }

    fn fail_placeholder(&self, target: StreamTarget, details: &str) {
        {
            let mut state = self.state_write();
            if let Some(message) = state.message_mut(target)
                && message.is_streaming()
            {
                message.content = format!("Request failed: {details}");
                message.status = MessageStatus::Error(details.to_string());
            }
            if let Some(session) = state.sessions.get_mut(target.session_index) {
                session.touch();
            }
        }

        self.persist();
        self.bump_revision();
    }

    fn ingest_context(&self) -> IngestContext {
        IngestContext {
            state: Arc::clone(&self.state),
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            revision: Arc::clone(&self.revision),
        }
    }

    fn persist(&self) {
        let record = self.state_read().to_record();
        if let Err(error) = self.store.save(&record) {
            tracing::error!(error = %error, "failed to persist chat state");
        }
    }

    fn bump_revision(&self) {
        self.revision
            .send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    fn state_read(&self) -> RwLockReadGuard<'_, ChatState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_write(&self) -> RwLockWriteGuard<'_, ChatState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use quill_llm::ScriptedProvider;
    use quill_storage::{DEFAULT_SESSION_TOPIC, MemoryStore};

    use super::*;
    use crate::chat::session::Role;

    fn test_config() -> ChatConfig {
        ChatConfig {
            model: "scripted-v1".to_string(),
            ..ChatConfig::default()
        }
    }

    fn store_with(provider: ScriptedProvider) -> (ChatStore, Arc<MemoryStore>) {
        let memory = Arc::new(MemoryStore::new());
        let store = ChatStore::load(Arc::new(provider), memory.clone(), test_config()).unwrap();
        (store, memory)
    }

    #[tokio::test]
    async fn submit_streams_chunks_into_the_assistant_placeholder() {
        let (store, memory) = store_with(ScriptedProvider::completing(["Hi", " there"]));

        let handle = store.submit("Hello").unwrap();
        assert_eq!(handle.target(), StreamTarget::new(0, 1));
        assert_eq!(handle.wait().await, IngestOutcome::Completed);

        let state = store.snapshot();
        let messages = &state.current_session().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hi there");
        assert_eq!(messages[1].status, MessageStatus::Done);

        assert_eq!(store.active_stream_count(), 0);
        // Submission and the terminal transition both hit the store.
        assert!(memory.save_count() >= 2);
        assert!(memory.load().unwrap().is_some());
    }

    #[tokio::test]
    async fn stop_finalizes_the_placeholder_as_cancelled() {
        let (store, _memory) = store_with(ScriptedProvider::hanging());

        let handle = store.submit("Hello").unwrap();
        let target = handle.target();
        assert!(store.stop(target.session_index, target.message_index));
        assert_eq!(handle.wait().await, IngestOutcome::Cancelled);

        let state = store.snapshot();
        let message = &state.current_session().messages[1];
        assert_eq!(message.content, "");
        assert_eq!(message.status, MessageStatus::Cancelled);
        assert!(!message.is_error());

        assert!(!store.stop(target.session_index, target.message_index));
        assert_eq!(store.active_stream_count(), 0);
    }

    #[tokio::test]
    async fn transport_failure_keeps_partial_content_and_marks_error() {
        let (store, _memory) =
            store_with(ScriptedProvider::failing_after(["partial"], "connection reset"));

        let handle = store.submit("Hello").unwrap();
        assert_eq!(
            handle.wait().await,
            IngestOutcome::Failed("connection reset".to_string())
        );

        let state = store.snapshot();
        let message = &state.current_session().messages[1];
        assert!(message.content.starts_with("partial"));
        assert!(message.content.contains("Request failed: connection reset"));
        assert_eq!(
            message.status,
            MessageStatus::Error("connection reset".to_string())
        );
    }

    #[tokio::test]
    async fn blank_input_is_ignored() {
        let (store, memory) = store_with(ScriptedProvider::completing(["x"]));

        assert!(store.submit("").is_none());
        assert!(store.submit("   \n\t").is_none());
        assert!(store.snapshot().current_session().messages.is_empty());
        assert_eq!(memory.save_count(), 0);
    }

    #[tokio::test]
    async fn submission_is_rejected_while_a_response_is_streaming() {
        let (store, _memory) = store_with(ScriptedProvider::hanging());

        let handle = store.submit("first").unwrap();
        assert!(store.submit("second").is_none());
        assert_eq!(store.snapshot().current_session().messages.len(), 2);

        let target = handle.target();
        store.stop(target.session_index, target.message_index);
        handle.wait().await;
    }

    #[tokio::test]
    async fn resend_appends_a_fresh_exchange() {
        let (store, _memory) = store_with(ScriptedProvider::completing(["pong"]));

        store.submit("ping").unwrap().wait().await;

        // Resending from the assistant reply finds the user turn before it.
        let handle = store.resend(1).unwrap();
        assert_eq!(handle.target(), StreamTarget::new(0, 3));
        handle.wait().await;

        let state = store.snapshot();
        let messages = &state.current_session().messages;
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].content, "ping");
        assert_eq!(messages[3].content, "pong");
    }

    #[tokio::test]
    async fn resend_without_a_prior_user_turn_is_a_no_op() {
        let (store, _memory) = store_with(ScriptedProvider::completing(["x"]));
        assert!(store.resend(0).is_none());
        assert!(store.snapshot().current_session().messages.is_empty());
    }

    #[tokio::test]
    async fn completed_exchange_names_a_default_topic_session() {
        let (store, _memory) = store_with(ScriptedProvider::completing(["sure"]));

        store.submit("Explain lifetimes").unwrap().wait().await;
        assert_eq!(store.snapshot().current_session().topic, "Explain lifetimes");

        // A renamed session keeps its name on later exchanges.
        assert!(store.rename_session(0, "Rust questions"));
        store.submit("And borrows?").unwrap().wait().await;
        assert_eq!(store.snapshot().current_session().topic, "Rust questions");
    }

    #[tokio::test]
    async fn session_commands_manage_the_list_and_cursor() {
        let (store, _memory) = store_with(ScriptedProvider::completing(["x"]));

        let second = store.new_session();
        assert_eq!(second, SessionId::new(2));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.sessions.len(), 2);
        assert_eq!(snapshot.current_index, 1);

        assert!(store.switch_session(0));
        assert!(!store.switch_session(5));
        assert_eq!(store.snapshot().current_index, 0);

        // Removing a session before the cursor shifts it left.
        assert!(store.switch_session(1));
        assert!(store.remove_session(0));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.current_index, 0);
        assert_eq!(snapshot.current_session().id, second);
    }

    #[tokio::test]
    async fn removing_the_last_session_leaves_a_fresh_one() {
        let (store, _memory) = store_with(ScriptedProvider::completing(["x"]));

        store.submit("hello").unwrap().wait().await;
        assert!(store.remove_session(0));
        assert!(!store.remove_session(3));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.sessions.len(), 1);
        assert!(snapshot.current_session().messages.is_empty());
        assert_eq!(snapshot.current_session().topic, DEFAULT_SESSION_TOPIC);
    }

    #[tokio::test]
    async fn removing_a_session_cancels_its_stream() {
        let (store, _memory) = store_with(ScriptedProvider::hanging());

        let handle = store.submit("hello").unwrap();
        assert_eq!(store.active_stream_count(), 1);

        assert!(store.remove_session(0));
        assert_eq!(handle.wait().await, IngestOutcome::Cancelled);
        assert_eq!(store.active_stream_count(), 0);
    }

    #[tokio::test]
    async fn removing_an_earlier_session_finalizes_streams_in_shifted_sessions() {
        let (store, _memory) = store_with(ScriptedProvider::hanging());

        store.new_session();
        let handle = store.submit("hello").unwrap();
        assert_eq!(handle.target(), StreamTarget::new(1, 1));

        assert!(store.remove_session(0));
        assert_eq!(handle.wait().await, IngestOutcome::Cancelled);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.sessions.len(), 1);
        let message = &snapshot.current_session().messages[1];
        assert_eq!(message.status, MessageStatus::Cancelled);
        assert_eq!(store.active_stream_count(), 0);

        // The shifted session accepts submissions again.
        let next = store.submit("again").unwrap();
        let target = next.target();
        assert_eq!(target, StreamTarget::new(0, 3));
        store.stop(target.session_index, target.message_index);
        next.wait().await;
    }

    #[tokio::test]
    async fn silently_closed_stream_is_a_failure() {
        let (store, _memory) = store_with(ScriptedProvider::disconnecting_after(["half"]));

        let handle = store.submit("Hello").unwrap();
        assert_eq!(
            handle.wait().await,
            IngestOutcome::Failed("response stream ended unexpectedly".to_string())
        );

        let state = store.snapshot();
        let message = &state.current_session().messages[1];
        assert!(message.content.starts_with("half"));
        assert!(
            message
                .content
                .contains("Request failed: response stream ended unexpectedly")
        );
        assert!(message.is_error());
    }

    #[tokio::test]
    async fn rename_keeps_the_full_topic_text() {
        let (store, _memory) = store_with(ScriptedProvider::completing(["x"]));

        let long_topic = "a".repeat(80);
        assert!(store.rename_session(0, &format!("  {long_topic}  ")));
        assert_eq!(store.snapshot().current_session().topic, long_topic);

        assert!(!store.rename_session(0, "   "));
        assert!(!store.rename_session(7, "out of range"));
        assert_eq!(store.snapshot().current_session().topic, long_topic);
    }

    #[tokio::test]
    async fn reload_normalizes_interrupted_streams_to_cancelled() {
        let (store, memory) = store_with(ScriptedProvider::hanging());

        let handle = store.submit("hello").unwrap();
        let target = handle.target();

        // Reopen from the snapshot persisted while the stream was live.
        let reloaded = ChatStore::load(
            Arc::new(ScriptedProvider::completing(["x"])),
            memory.clone(),
            test_config(),
        )
        .unwrap();
        let message = reloaded.snapshot().current_session().messages[1].clone();
        assert_eq!(message.status, MessageStatus::Cancelled);

        store.stop(target.session_index, target.message_index);
        handle.wait().await;
    }

    #[tokio::test]
    async fn revision_counter_moves_on_every_mutation() {
        let (store, _memory) = store_with(ScriptedProvider::completing(["Hi", " there"]));
        let revisions = store.subscribe();
        let before = *revisions.borrow();

        store.submit("Hello").unwrap().wait().await;
        let after = *revisions.borrow();

        // Submission, two chunks, and the terminal transition each bump it.
        assert!(after.wrapping_sub(before) >= 4);
    }
}
