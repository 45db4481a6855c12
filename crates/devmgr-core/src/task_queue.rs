//! Serializing task queue
//!
//! A bounded FIFO drained by a single Tokio worker. Every unit submitted to
//! the queue runs alone, in submission order, so work that touches the
//! session's connection and transceiver never overlaps.
//!
//! Stopping comes in two flavours:
//!
//! - [`TaskQueue::stop`] closes the queue and waits for the worker to finish.
//!   It must not be called from inside a unit, since the worker would be
//!   waiting on itself.
//! - [`TaskQueue::stop_no_wait`] closes the queue and returns at once. The
//!   unit currently running is allowed to finish; every unit still queued is
//!   completed with the stop cause without being run. This is the variant a
//!   unit uses to tear down its own queue.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::{SessionError, SessionResult};

// ----------------------------------------------------------------------------
// Queue Internals
// ----------------------------------------------------------------------------

/// A queued unit. The argument is the abandon cause: `Some` means the queue
/// was stopped before the unit got its turn and it must not run.
type Job = Box<dyn FnOnce(Option<SessionError>) -> BoxFuture<'static, ()> + Send>;

/// Abandon cause shared between one queue generation and its worker
type AbandonSlot = Arc<Mutex<Option<SessionError>>>;

#[derive(Default)]
struct QueueState {
    tx: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    abandon: AbandonSlot,
    /// Cause of the most recent stop, handed to late submitters
    stop_cause: Option<SessionError>,
}

fn lock_slot(slot: &AbandonSlot) -> MutexGuard<'_, Option<SessionError>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Task Queue
// ----------------------------------------------------------------------------

/// Single-worker serializing executor
#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    /// Create a stopped queue
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a fresh worker with room for `capacity` queued units
    pub fn start(&self, capacity: usize) -> SessionResult<()> {
        let mut state = self.state();
        if state.tx.is_some() {
            return Err(SessionError::QueueAlreadyRunning);
        }

        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let abandon: AbandonSlot = Arc::default();
        let worker_abandon = Arc::clone(&abandon);

        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let cause = lock_slot(&worker_abandon).clone();
                job(cause).await;
            }
            debug!("Task queue worker exited");
        });

        state.tx = Some(tx);
        state.worker = Some(worker);
        state.abandon = abandon;
        state.stop_cause = None;
        debug!("Task queue started (capacity {})", capacity);
        Ok(())
    }

    /// Close the queue without waiting. Callable from inside a unit.
    pub fn stop_no_wait(&self, cause: SessionError) {
        let mut state = self.state();
        Self::close_locked(&mut state, cause);
    }

    /// Close the queue and wait for the worker to drain
    pub async fn stop(&self, cause: SessionError) {
        let worker = {
            let mut state = self.state();
            Self::close_locked(&mut state, cause);
            state.worker.take()
        };

        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Task queue worker terminated abnormally: {}", e);
            }
        }
    }

    fn close_locked(state: &mut QueueState, cause: SessionError) {
        if state.tx.take().is_none() {
            return;
        }
        debug!("Stopping task queue: {}", cause);
        *lock_slot(&state.abandon) = Some(cause.clone());
        state.stop_cause = Some(cause);
    }

    fn closed_error(&self) -> SessionError {
        self.state()
            .stop_cause
            .clone()
            .unwrap_or(SessionError::QueueStopped)
    }

    pub fn is_running(&self) -> bool {
        self.state().tx.is_some()
    }

    /// Submit a unit and return a receiver for its result
    ///
    /// Waits only for queue capacity, never for the unit itself.
    pub async fn enqueue<T, F>(&self, unit: F) -> SessionResult<oneshot::Receiver<SessionResult<T>>>
    where
        T: Send + 'static,
        F: Future<Output = SessionResult<T>> + Send + 'static,
    {
        let tx = self.state().tx.clone();
        let tx = tx.ok_or_else(|| self.closed_error())?;

        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::new(move |abandon: Option<SessionError>| {
            async move {
                let result = match abandon {
                    Some(cause) => Err(cause),
                    None => unit.await,
                };
                let _ = done_tx.send(result);
            }
            .boxed()
        });

        if tx.send(job).await.is_err() {
            return Err(self.closed_error());
        }
        Ok(done_rx)
    }

    /// Submit a unit and wait for it to complete
    pub async fn run<T, F>(&self, unit: F) -> SessionResult<T>
    where
        T: Send + 'static,
        F: Future<Output = SessionResult<T>> + Send + 'static,
    {
        let done = self.enqueue(unit).await?;
        match done.await {
            Ok(result) => result,
            // The worker went away with the unit still queued
            Err(_) => Err(self.closed_error()),
        }
    }
}
