use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use quill_llm::StreamTarget;
use tokio::sync::oneshot;

/// Resolves when the registered stream should stop ingesting.
///
/// Fires both on an explicit `stop` and when a newer stream replaces this
/// registration, so a superseded ingest task winds down on its own.
pub struct CancelToken {
    signal: oneshot::Receiver<()>,
}

impl Future for CancelToken {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender counts as cancellation too.
        match Pin::new(&mut self.signal).poll(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Tracks the cancel capability of every in-flight response stream.
///
/// Keys are the placeholder positions being filled; registering a target that
/// is already present drops the previous sender, which cancels the old stream.
#[derive(Default)]
pub struct ControllerRegistry {
    handles: Mutex<HashMap<StreamTarget, oneshot::Sender<()>>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StreamTarget, oneshot::Sender<()>>> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, target: StreamTarget) -> CancelToken {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        if self.lock().insert(target, cancel_tx).is_some() {
            tracing::debug!(target = ?target, "replaced an existing stream controller");
        }
        CancelToken { signal: cancel_rx }
    }

    /// Requests cancellation of the stream at `target`.
    ///
    /// Returns false when no stream is registered there, which makes repeated
    /// stop requests harmless.
    pub fn stop(&self, target: StreamTarget) -> bool {
        match self.lock().remove(&target) {
            Some(cancel_tx) => {
                let delivered = cancel_tx.send(()).is_ok();
                tracing::debug!(target = ?target, delivered, "stop requested");
                true
            }
            None => false,
        }
    }

    /// Clears a finished registration without signalling; no-op when `target`
    /// was already removed or replaced.
    pub fn remove(&self, target: StreamTarget) -> bool {
        self.lock().remove(&target).is_some()
    }

    /// Stops every stream targeting `min_session_index` or any later session.
    ///
    /// Removing a session shifts the indices of everything after it, so
    /// streams keyed to those positions can no longer be trusted.
    pub fn stop_sessions_from(&self, min_session_index: usize) -> usize {
        let mut handles = self.lock();
        let targets = handles
            .keys()
            .filter(|target| target.session_index >= min_session_index)
            .copied()
            .collect::<Vec<_>>();
        for target in &targets {
            if let Some(cancel_tx) = handles.remove(target) {
                let _ = cancel_tx.send(());
            }
        }
        targets.len()
    }

    pub fn is_active(&self, target: StreamTarget) -> bool {
        self.lock().contains_key(&target)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}
