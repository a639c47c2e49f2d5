//! Per-session background task isolation.
//!
//! The service maps `session_id → task`. Dispatching for a session cancels
//! the existing task (if any) and starts a new one, enforcing at-most-one
//! active cycle per session: a new customer message implicitly cancels any
//! in-flight cycle.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use colloquy_core::ids::SessionId;

struct ActiveTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    generation: u64,
}

#[derive(Clone, Default)]
pub struct BackgroundTaskService {
    tasks: Arc<DashMap<SessionId, Arc<ActiveTask>>>,
    generation: Arc<AtomicU64>,
}

impl BackgroundTaskService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and replace any running task for `session_id`, then spawn the
    /// future produced by `make` under a fresh cancellation token.
    pub fn dispatch<F, Fut>(&self, session_id: &SessionId, make: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Some((_, prior)) = self.tasks.remove(session_id) {
            debug!(session_id = %session_id, "cancelling superseded processing task");
            prior.cancel.cancel();
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let fut = make(cancel.clone());

        let tasks = self.tasks.clone();
        let sid = session_id.clone();
        let handle = tokio::spawn(async move {
            fut.await;
            // Only remove our own entry; a replacement may already be there.
            tasks.remove_if(&sid, |_, task| task.generation == generation);
        });

        self.tasks.insert(
            session_id.clone(),
            Arc::new(ActiveTask {
                cancel,
                handle,
                generation,
            }),
        );
    }

    /// Cancel the task for a session. Returns whether one was running.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        if let Some((_, task)) = self.tasks.remove(session_id) {
            task.cancel.cancel();
            true
        } else {
            false
        }
    }

    pub fn is_running(&self, session_id: &SessionId) -> bool {
        self.tasks
            .get(session_id)
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel everything; returns how many tasks were active.
    pub fn cancel_all(&self) -> usize {
        let count = self.tasks.len();
        for entry in self.tasks.iter() {
            entry.value().cancel.cancel();
        }
        self.tasks.clear();
        count
    }
}
