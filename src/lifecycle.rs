//! Process-wide shutdown coordination.
//!
//! Every connection task is spawned through a [`Lifecycle`] so shutdown can
//! broadcast a single drain signal and then wait for the tracked tasks to
//! finish within a grace period. Tasks still running past the deadline are
//! abandoned, not killed: their sockets are closed by the tasks themselves
//! once they observe the signal.

use parking_lot::Mutex;
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::{
    sync::{CancellationToken, WaitForCancellationFuture},
    task::TaskTracker,
};
use tracing::{debug, error, info, warn};

/// ShutdownState tracks the Running -> Draining -> Stopped progression
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running = 0,
    Draining = 1,
    Stopped = 2,
}

impl ShutdownState {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0 => ShutdownState::Running,
            1 => ShutdownState::Draining,
            _ => ShutdownState::Stopped,
        }
    }
}

/// DrainOutcome reports how `await_drain` finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// every tracked task finished before the deadline
    Drained,
    /// the deadline elapsed with this many tasks still running
    Abandoned(usize),
}

struct Inner {
    token: CancellationToken,
    tracker: TaskTracker,
    state: AtomicU8,
    fatal: Mutex<Option<anyhow::Error>>,
}

/// Lifecycle is the shared shutdown coordinator; clones share one state
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                state: AtomicU8::new(ShutdownState::Running as u8),
                fatal: Mutex::new(None),
            }),
        }
    }

    /// signal_shutdown moves Running -> Draining and wakes every waiter.
    /// Returns true only for the call that performed the transition.
    pub fn signal_shutdown(&self) -> bool {
        let transitioned = self
            .inner
            .state
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if transitioned {
            info!("shutdown requested, draining connections");
            self.inner.token.cancel();
        }
        transitioned
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_byte(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// cancelled resolves once shutdown has been signalled
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    /// token hands out the drain signal for code that must own it
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// spawn runs a unit of work that shutdown will wait on
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.tracker.spawn(task)
    }

    /// active_tasks counts tracked tasks that have not finished yet
    pub fn active_tasks(&self) -> usize {
        self.inner.tracker.len()
    }

    /// report_fatal records a process-fatal error and triggers shutdown.
    /// The first error wins; later ones are only logged.
    pub fn report_fatal(&self, err: anyhow::Error) {
        {
            let mut fatal = self.inner.fatal.lock();
            if fatal.is_none() {
                error!("fatal error: {err:#}");
                *fatal = Some(err);
            } else {
                debug!("additional fatal error after shutdown: {err:#}");
            }
        }
        self.signal_shutdown();
    }

    /// take_fatal hands the recorded terminal error to the caller
    pub fn take_fatal(&self) -> Option<anyhow::Error> {
        self.inner.fatal.lock().take()
    }

    /// await_drain waits for every tracked task or until `grace` elapses.
    /// On expiry it logs a single warning and returns without killing anything.
    pub async fn await_drain(&self, grace: Duration) -> DrainOutcome {
        self.inner.tracker.close();

        let outcome = match tokio::time::timeout(grace, self.inner.tracker.wait()).await {
            Ok(()) => {
                debug!("all connection tasks finished");
                DrainOutcome::Drained
            }
            Err(_) => {
                let abandoned = self.inner.tracker.len();
                warn!(
                    abandoned,
                    "grace period elapsed, abandoning unfinished connection tasks"
                );
                DrainOutcome::Abandoned(abandoned)
            }
        };

        self.inner
            .state
            .store(ShutdownState::Stopped as u8, Ordering::Release);
        outcome
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
