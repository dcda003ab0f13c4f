//! Clock and timer collaborator.
//!
//! The notification manager never sleeps itself. It asks a [`Clock`] to run a
//! task after a delay and keeps the returned [`TimerHandle`] so the task can be
//! cancelled on any state transition. A cancelled timer never runs its task.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// Cancellation handle for a scheduled timer task.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Cancel the timer. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Source of wall-clock time and delayed tasks.
pub trait Clock: Send + Sync {
    /// Current instant, used for `updated_at` and notification timestamps.
    fn now(&self) -> DateTime<Utc>;

    /// Run `task` once `after` has elapsed, unless the handle is cancelled first.
    fn start_timer(&self, after: Duration, task: BoxFuture<'static, ()>) -> TimerHandle;
}

/// Tokio-backed clock. Timers are spawned tasks racing a cancellation token.
#[derive(Debug, Default, Clone)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn start_timer(&self, after: Duration, task: BoxFuture<'static, ()>) -> TimerHandle {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = child.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    if !child.is_cancelled() {
                        task.await;
                    }
                }
            }
        });
        TimerHandle::new(token)
    }
}
