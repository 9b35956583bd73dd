//! Shared engine state
//!
//! The single point of contact between the input side (HTTP handlers,
//! console reader) and a running session. Holds the response latch, the
//! event bus and a handle to the current session; the session itself is
//! owned by its orchestrator thread.

use crate::latch::ResponseLatch;
use audiometer_common::events::{EventBus, TestEvent};
use audiometer_common::SessionReport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Handle to the current (or last) session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub cancel: CancellationToken,
    pub snapshot: watch::Receiver<SessionReport>,
}

/// Shared state accessible by all components
pub struct SharedState {
    /// Response latch written by every input source
    pub latch: Arc<ResponseLatch>,

    /// Event broadcaster for SSE events
    pub events: EventBus,

    session: RwLock<Option<SessionHandle>>,
    task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            latch: Arc::new(ResponseLatch::new()),
            events: EventBus::new(256),
            session: RwLock::new(None),
            task: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Subscribe to event stream for SSE
    pub fn subscribe_events(&self) -> broadcast::Receiver<TestEvent> {
        self.events.subscribe()
    }

    /// Claim the single session slot and install its handle
    ///
    /// Returns false if a session is running. The claim and the handle
    /// change together under the session lock, so a concurrent
    /// [`cancel_session`](Self::cancel_session) never sees the new claim
    /// paired with the previous session's handle.
    pub async fn begin_session(&self, handle: SessionHandle) -> bool {
        let mut session = self.session.write().await;
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        debug!("Session slot claimed by {}", handle.session_id);
        *session = Some(handle);
        true
    }

    /// Release the session slot
    pub fn end_session(&self) {
        self.running.store(false, Ordering::SeqCst);
        debug!("Session slot released");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Lock the task slot; the launcher holds it across spawning
    pub async fn task_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().await
    }

    pub async fn session(&self) -> Option<SessionHandle> {
        self.session.read().await.clone()
    }

    /// Latest snapshot of the current or last session
    pub async fn snapshot(&self) -> Option<SessionReport> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|handle| handle.snapshot.borrow().clone())
    }

    /// Request cancellation of the running session
    ///
    /// Returns false if no session is running.
    pub async fn cancel_session(&self) -> bool {
        let session = self.session.read().await;
        if !self.is_running() {
            return false;
        }
        match session.as_ref() {
            Some(handle) => {
                info!("Cancellation requested for session {}", handle.session_id);
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until the current session task (including persistence) is done
    pub async fn join_session(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(cancel: &CancellationToken) -> SessionHandle {
        let (_tx, rx) = watch::channel(SessionReport::new(Uuid::new_v4(), None));
        SessionHandle {
            session_id: Uuid::new_v4(),
            cancel: cancel.clone(),
            snapshot: rx,
        }
    }

    #[tokio::test]
    async fn test_single_session_slot() {
        let state = SharedState::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        assert!(state.begin_session(handle(&first)).await);
        assert!(!state.begin_session(handle(&second)).await);

        // The rejected claim left the running session's handle in place
        assert!(state.cancel_session().await);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        state.end_session();
        assert!(state.begin_session(handle(&second)).await);
    }

    #[tokio::test]
    async fn test_cancel_without_session() {
        let state = SharedState::new();
        assert!(!state.cancel_session().await);
        assert!(state.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_reaches_new_session_before_its_task_exists() {
        let state = SharedState::new();
        let old = CancellationToken::new();
        assert!(state.begin_session(handle(&old)).await);
        state.end_session();

        // No task stored yet for the new session
        let new = CancellationToken::new();
        assert!(state.begin_session(handle(&new)).await);
        assert!(state.cancel_session().await);
        assert!(new.is_cancelled());
        assert!(!old.is_cancelled());
    }

    #[tokio::test]
    async fn test_join_waits_for_stored_task() {
        let state = SharedState::new();
        let cancel = CancellationToken::new();
        assert!(state.begin_session(handle(&cancel)).await);

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        {
            let mut slot = state.task_slot().await;
            *slot = Some(tokio::spawn(async move {
                let _ = done_tx.send(());
            }));
        }
        state.join_session().await;
        assert!(done_rx.await.is_ok());
        assert!(state.task_slot().await.is_none());
    }
}
