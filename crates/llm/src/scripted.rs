use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::provider::{
    LlmProvider, ProviderResult, ProviderStreamHandle, ProviderWorker, StreamEvent,
    StreamEventPayload, StreamRequest, StreamTarget, make_event_stream,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";

/// One step of a scripted response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Chunk(String),
    Wait(Duration),
    Fail(String),
    /// Ends the stream abruptly, without a terminal event.
    Disconnect,
    /// Parks the worker until the stream is cancelled or dropped.
    HangUntilCancelled,
}

/// Deterministic in-process transport for tests and QA runs.
///
/// Replays a fixed script for every request instead of talking to a network
/// provider, so lifecycle behavior can be exercised without credentials.
pub struct ScriptedProvider {
    script: Vec<ScriptStep>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self { script }
    }

    /// Script that streams the given chunks and completes normally.
    pub fn completing<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            chunks
                .into_iter()
                .map(|chunk| ScriptStep::Chunk(chunk.into()))
                .collect(),
        )
    }

    /// Script that streams the given chunks, then fails with `error`.
    pub fn failing_after<I, S>(chunks: I, error: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut script = chunks
            .into_iter()
            .map(|chunk| ScriptStep::Chunk(chunk.into()))
            .collect::<Vec<_>>();
        script.push(ScriptStep::Fail(error.into()));
        Self::new(script)
    }

    /// Script that streams the given chunks, then drops the connection
    /// without a terminal event.
    pub fn disconnecting_after<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut script = chunks
            .into_iter()
            .map(|chunk| ScriptStep::Chunk(chunk.into()))
            .collect::<Vec<_>>();
        script.push(ScriptStep::Disconnect);
        Self::new(script)
    }

    /// Script that emits nothing and waits for cancellation.
    pub fn hanging() -> Self {
        Self::new(vec![ScriptStep::HangUntilCancelled])
    }

    async fn run_script(
        script: Vec<ScriptStep>,
        target: StreamTarget,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for step in script {
            // A resolved or closed cancel channel both mean the consumer is gone.
            match cancel_rx.try_recv() {
                Ok(()) | Err(oneshot::error::TryRecvError::Closed) => {
                    tracing::debug!(target = ?target, "scripted stream cancelled");
                    return;
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }

            match step {
                ScriptStep::Chunk(text) => {
                    let event = StreamEvent {
                        target,
                        payload: StreamEventPayload::Delta(text),
                    };
                    if event_tx.send(event).is_err() {
                        return;
                    }
                }
                ScriptStep::Wait(delay) => {
                    tokio::select! {
                        _ = &mut cancel_rx => {
                            tracing::debug!(target = ?target, "scripted stream cancelled");
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                ScriptStep::Fail(message) => {
                    let _ = event_tx.send(StreamEvent {
                        target,
                        payload: StreamEventPayload::Error(message),
                    });
                    return;
                }
                ScriptStep::Disconnect => return,
                ScriptStep::HangUntilCancelled => {
                    let _ = cancel_rx.await;
                    tracing::debug!(target = ?target, "scripted stream cancelled");
                    return;
                }
            }
        }

        let _ = event_tx.send(StreamEvent {
            target,
            payload: StreamEventPayload::Done,
        });
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-v1"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: ProviderWorker = Box::pin(Self::run_script(
            self.script.clone(),
            request.target,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}
