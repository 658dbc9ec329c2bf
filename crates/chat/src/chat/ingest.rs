use std::sync::{Arc, PoisonError, RwLock};

use quill_llm::{ProviderEventStream, StreamEventPayload, StreamTarget};
use quill_storage::{DEFAULT_SESSION_TOPIC, StateStore};
use tokio::sync::watch;

use super::registry::{CancelToken, ControllerRegistry};
use super::session::{ChatState, MessageStatus, Role, topic_excerpt};

/// Terminal result of one response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Shared pieces an ingest task needs to fold stream events into state.
#[derive(Clone)]
pub struct IngestContext {
    pub state: Arc<RwLock<ChatState>>,
    pub registry: Arc<ControllerRegistry>,
    pub store: Arc<dyn StateStore>,
    pub revision: Arc<watch::Sender<u64>>,
}

impl IngestContext {
    fn bump_revision(&self) {
        self.revision
            .send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    fn persist(&self) {
        let record = {
            let state = self
                .state
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            state.to_record()
        };
        if let Err(error) = self.store.save(&record) {
            tracing::error!(error = %error, "failed to persist chat state");
        }
    }
}

/// Consumes one response stream and applies it to the targeted placeholder.
///
/// Runs until the stream reaches a terminal event or the cancel token fires;
/// exactly one terminal status is written, after which the registry entry for
/// `target` is gone and the state has been persisted.
pub async fn run_ingest(
    ctx: IngestContext,
    target: StreamTarget,
    mut stream: ProviderEventStream,
    mut cancel: CancelToken,
) -> IngestOutcome {
    let outcome = loop {
        tokio::select! {
            _ = &mut cancel => {
                tracing::debug!(target = ?target, "ingest cancelled");
                stream.cancel();
                break IngestOutcome::Cancelled;
            }
            event = stream.recv() => {
                match event {
                    Some(event) if event.target == target => match event.payload {
                        StreamEventPayload::Delta(chunk) => {
                            append_chunk(&ctx, target, &chunk);
                        }
                        StreamEventPayload::Done => break IngestOutcome::Completed,
                        StreamEventPayload::Error(details) => {
                            tracing::warn!(
                                target = ?target,
                                error = %details,
                                "response stream failed"
                            );
                            break IngestOutcome::Failed(details);
                        }
                    },
                    Some(event) => {
                        tracing::warn!(
                            expected = ?target,
                            received = ?event.target,
                            "dropping stream event with a foreign target"
                        );
                    }
                    None => {
                        // The worker died without sending Done or Error.
                        tracing::warn!(
                            target = ?target,
                            "response stream closed without a terminal event"
                        );
                        break IngestOutcome::Failed(
                            "response stream ended unexpectedly".to_string(),
                        );
                    }
                }
            }
        }
    };

    finalize(&ctx, target, &outcome);
    outcome
}

fn append_chunk(ctx: &IngestContext, target: StreamTarget, chunk: &str) {
    {
        let mut state = ctx.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.message_mut(target) {
            Some(message) if message.is_streaming() => message.content.push_str(chunk),
            _ => {
                tracing::warn!(target = ?target, "dropping chunk for a non-streaming message");
                return;
            }
        }
    }
    ctx.bump_revision();
}

fn finalize(ctx: &IngestContext, target: StreamTarget, outcome: &IngestOutcome) {
    ctx.registry.remove(target);

    {
        let mut state = ctx.state.write().unwrap_or_else(PoisonError::into_inner);
        let Some(message) = state.message_mut(target) else {
            tracing::warn!(target = ?target, "stream finished for a missing message");
            return;
        };
        if !message.is_streaming() {
            tracing::debug!(target = ?target, "stream finished for an already finalized message");
            return;
        }

        match outcome {
            IngestOutcome::Completed => message.status = MessageStatus::Done,
            IngestOutcome::Cancelled => message.status = MessageStatus::Cancelled,
            IngestOutcome::Failed(details) => {
                // Keep whatever partial content arrived and note the failure below it.
                if !message.content.is_empty() {
                    message.content.push_str("\n\n");
                }
                message.content.push_str("Request failed: ");
                message.content.push_str(details);
                message.status = MessageStatus::Error(details.clone());
            }
        }

        if let Some(session) = state.sessions.get_mut(target.session_index) {
            if matches!(outcome, IngestOutcome::Completed)
                && session.topic == DEFAULT_SESSION_TOPIC
                && let Some(topic) = session
                    .messages
                    .iter()
                    .find(|message| matches!(message.role, Role::User))
                    .and_then(|message| topic_excerpt(&message.content))
            {
                session.topic = topic;
            }
            session.touch();
        }
    }

    ctx.persist();
    ctx.bump_revision();

    tracing::info!(target = ?target, outcome = ?outcome, "response stream finished");
}
