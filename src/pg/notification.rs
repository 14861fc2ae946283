//! Asynchronous notifications and the background poller.
//!
//! Foreground work and the poller share one fair single-permit gate. A
//! [`PauseScope`] holds the permit for as long as it lives, and scopes nest:
//! only the outermost one acquires and releases. The poller takes the same
//! permit for each poll and gives it back before sleeping, so a waiting
//! foreground operation is never starved.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use super::error::{BackendError, PgResult};
use super::session::{Session, SharedSession};
use super::state::{Drained, Operation, Until};

/// A `NOTIFY` delivered by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// Asynchronous events published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    Notification(Notification),
    Notice(BackendError),
    ParameterStatus { name: String, value: String },
}

#[derive(Debug, Default)]
struct GateState {
    depth: usize,
    permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug)]
struct GateInner {
    semaphore: Arc<Semaphore>,
    state: Mutex<GateState>,
}

/// Mutual exclusion between foreground operations and the poller.
#[derive(Debug, Clone)]
pub struct NotificationGate {
    inner: Arc<GateInner>,
}

impl Default for NotificationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationGate {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                semaphore: Arc::new(Semaphore::new(1)),
                state: Mutex::new(GateState::default()),
            }),
        }
    }

    /// Suspend polling until the returned scope is dropped.
    ///
    /// Nested calls return immediately; the permit is only released when
    /// the outermost scope goes away.
    pub async fn pause(&self) -> PauseScope {
        {
            let mut state = self.inner.state.lock();
            if state.depth > 0 {
                state.depth += 1;
                return PauseScope { gate: self.clone() };
            }
        }

        // The semaphore is never closed, so acquisition only fails if the
        // gate is being torn down; the scope then simply holds nothing.
        let permit = self.inner.semaphore.clone().acquire_owned().await.ok();
        let mut state = self.inner.state.lock();
        state.depth += 1;
        state.permit = permit;
        PauseScope { gate: self.clone() }
    }

    /// Number of live scopes.
    pub fn depth(&self) -> usize {
        self.inner.state.lock().depth
    }

    pub fn is_paused(&self) -> bool {
        self.depth() > 0
    }

    async fn acquire_for_poll(&self) -> Option<OwnedSemaphorePermit> {
        self.inner.semaphore.clone().acquire_owned().await.ok()
    }

    fn leave(&self) {
        let released = {
            let mut state = self.inner.state.lock();
            state.depth = state.depth.saturating_sub(1);
            if state.depth == 0 {
                state.permit.take()
            } else {
                None
            }
        };
        drop(released);
    }
}

/// Held while notifications are paused.
#[derive(Debug)]
#[must_use = "notifications resume as soon as the scope is dropped"]
pub struct PauseScope {
    gate: NotificationGate,
}

impl Drop for PauseScope {
    fn drop(&mut self) {
        self.gate.leave();
    }
}

// ============================================================================
// Poller
// ============================================================================

/// Handle to a running poller. Dropping it also stops the task.
#[derive(Debug)]
pub(crate) struct PollerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Signal shutdown and wait for the task to exit.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!("Notification poller ended abnormally: {}", err);
        }
    }
}

pub(crate) fn spawn_poller(
    session: SharedSession,
    gate: NotificationGate,
    interval: Duration,
) -> PollerHandle {
    let (shutdown, mut signal) = watch::channel(false);
    let task = tokio::spawn(async move {
        debug!("Notification poller started ({:?} interval)", interval);
        loop {
            tokio::select! {
                _ = signal.changed() => break,
                keep = poll_once(&session, &gate, interval) => {
                    if !keep {
                        break;
                    }
                }
            }
            tokio::select! {
                _ = signal.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("Notification poller stopped");
    });
    PollerHandle { shutdown, task }
}

async fn poll_once(session: &SharedSession, gate: &NotificationGate, wait: Duration) -> bool {
    let Some(_permit) = gate.acquire_for_poll().await else {
        return false;
    };
    let mut session = session.lock().await;
    match session.poll_notifications(wait).await {
        Ok(keep) => keep,
        Err(err) => {
            warn!("Notification poller stopping: {}", err);
            false
        }
    }
}

impl Session {
    /// Wait up to `wait` for bytes, then dispatch every complete message.
    ///
    /// Returns `false` when polling should stop because the session is gone.
    pub(crate) async fn poll_notifications(&mut self, wait: Duration) -> PgResult<bool> {
        if !self.is_open() {
            return Ok(false);
        }
        if self.unfinished.is_some() || !self.state.permits(Operation::Poll) {
            return Ok(true);
        }
        self.mediator.reset();
        // Complete messages already buffered go out without touching the
        // socket. A partial frame needs more bytes, so it falls through to
        // a read like an empty buffer does.
        let buffered = self.read_buf.len();
        self.dispatch_available().await?;
        if self.read_buf.len() == buffered {
            let read = self.read_within(wait).await;
            if self.guard(read)? {
                self.dispatch_available().await?;
            }
        }
        self.mediator.reset();
        Ok(true)
    }

    async fn dispatch_available(&mut self) -> PgResult<()> {
        while !matches!(self.drain(Until::Available).await?, Drained::Idle) {}
        Ok(())
    }
}
