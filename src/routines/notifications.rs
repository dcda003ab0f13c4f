//! Notification timer manager: per-routine popup lifecycle with cancellable timers.
//!
//! Each routine id moves through `Idle → Pending → Closing → Idle`:
//! - `schedule()` shows a notification and arms a dwell timer. Scheduling an id
//!   that is already active replaces it and cancels the old timer.
//! - The dwell timer expiring, `activate()` (click-through) and `dismiss()`
//!   (close button) each emit exactly one [`NotificationUpdate::Dismissed`].
//! - Expiry and activation linger in `Closing` for the exit-animation grace
//!   period before the entry is cleared; a user dismissal clears at once.
//!
//! Every notification belongs to the user who owns the routine. User-facing
//! operations name that user and do nothing for anyone else's notification.
//!
//! The id → entry map is owned by a single mutex, so every operation on every
//! id is serialized. Timers carry the sequence number of the state that armed
//! them and are ignored if the entry has since moved on.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use crate::clock::{Clock, TimerHandle};
use crate::config::NotificationConfig;

/// A visible notification for one routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub user_id: String,
    pub routine_id: String,
    pub title: String,
    pub message: String,
    pub shown_at: DateTime<Utc>,
}

/// Lifecycle phase of a routine's notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPhase {
    /// Nothing shown.
    Idle,
    /// Visible, dwell timer running.
    Pending,
    /// Exit animation running after expiry or click-through.
    Closing,
}

/// Why a notification went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DismissReason {
    Expired,
    User,
    Activated,
    /// The routine itself was deleted.
    Deleted,
}

/// Broadcast to renderers and the navigation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationUpdate {
    Shown {
        event: NotificationEvent,
    },
    /// The dismiss callback. Sent exactly once per shown notification.
    Dismissed {
        user_id: String,
        routine_id: String,
        reason: DismissReason,
    },
    /// Navigate to the routine's detail view.
    Navigate {
        user_id: String,
        routine_id: String,
    },
    /// Entry removed; the routine is `Idle` again.
    Cleared {
        user_id: String,
        routine_id: String,
    },
}

impl NotificationUpdate {
    /// Owner of the notification this update is about.
    pub fn user_id(&self) -> &str {
        match self {
            NotificationUpdate::Shown { event } => &event.user_id,
            NotificationUpdate::Dismissed { user_id, .. }
            | NotificationUpdate::Navigate { user_id, .. }
            | NotificationUpdate::Cleared { user_id, .. } => user_id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Expire,
    Clear,
}

struct Entry {
    event: NotificationEvent,
    phase: NotificationPhase,
    seq: u64,
    timer: TimerHandle,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Entry for `routine_id` if it belongs to `user_id`.
    fn owned(&self, user_id: &str, routine_id: &str) -> Option<&Entry> {
        self.entries
            .get(routine_id)
            .filter(|e| e.event.user_id == user_id)
    }
}

struct Inner {
    config: NotificationConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    tx: broadcast::Sender<NotificationUpdate>,
}

/// Schedules, expires and dismisses routine notifications.
#[derive(Clone)]
pub struct NotificationManager {
    inner: Arc<Inner>,
}

impl NotificationManager {
    pub fn new(config: NotificationConfig, clock: Arc<dyn Clock>) -> Self {
        let (tx, _rx) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                state: Mutex::new(State::default()),
                tx,
            }),
        }
    }

    /// Subscribe to notification updates for every user. Each renderer calls
    /// this and filters on [`NotificationUpdate::user_id`].
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationUpdate> {
        self.inner.tx.subscribe()
    }

    /// Show a notification for `routine_id`, owned by `user_id`, replacing any
    /// active one.
    pub async fn schedule(&self, user_id: &str, routine_id: &str, title: &str, message: &str) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if let Some(old) = state.entries.remove(routine_id) {
            old.timer.cancel();
            debug!(routine_id, phase = ?old.phase, "Replacing active notification");
        }

        let seq = state.next_seq();
        let timer = arm(inner, routine_id, seq, inner.config.dwell, Stage::Expire);
        let event = NotificationEvent {
            user_id: user_id.to_string(),
            routine_id: routine_id.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            shown_at: inner.clock.now(),
        };
        state.entries.insert(
            routine_id.to_string(),
            Entry {
                event: event.clone(),
                phase: NotificationPhase::Pending,
                seq,
                timer,
            },
        );

        info!(routine_id, user_id, "Notification shown");
        let _ = inner.tx.send(NotificationUpdate::Shown { event });
    }

    /// Close a pending notification at the user's request.
    ///
    /// Returns `false` (and does nothing) if `user_id` has nothing pending for
    /// the id.
    pub async fn dismiss(&self, user_id: &str, routine_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;

        if !is_pending(&state, user_id, routine_id) {
            debug!(routine_id, user_id, "Dismiss ignored, no pending notification");
            return false;
        }
        clear_now(&self.inner, &mut state, routine_id, Some(DismissReason::User));
        info!(routine_id, "Notification dismissed");
        true
    }

    /// Click-through: close the notification and request navigation.
    ///
    /// Returns `false` (and does nothing) if `user_id` has nothing pending for
    /// the id.
    pub async fn activate(&self, user_id: &str, routine_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;

        if !is_pending(&state, user_id, routine_id) {
            debug!(routine_id, user_id, "Activate ignored, no pending notification");
            return false;
        }
        begin_closing(&self.inner, &mut state, routine_id, DismissReason::Activated);

        info!(routine_id, "Notification activated");
        let _ = self.inner.tx.send(NotificationUpdate::Navigate {
            user_id: user_id.to_string(),
            routine_id: routine_id.to_string(),
        });
        true
    }

    /// Drop the notification of a deleted routine in any phase.
    ///
    /// A pending one reports `Dismissed { reason: Deleted }`; one already
    /// closing has had its dismissal and is only cleared.
    pub async fn withdraw(&self, user_id: &str, routine_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;

        let reason = match state.owned(user_id, routine_id).map(|e| e.phase) {
            Some(NotificationPhase::Pending) => Some(DismissReason::Deleted),
            Some(_) => None,
            None => return false,
        };
        clear_now(&self.inner, &mut state, routine_id, reason);
        info!(routine_id, "Notification withdrawn");
        true
    }

    /// Current phase for `routine_id`.
    pub async fn phase(&self, routine_id: &str) -> NotificationPhase {
        let state = self.inner.state.lock().await;
        state
            .entries
            .get(routine_id)
            .map(|e| e.phase)
            .unwrap_or(NotificationPhase::Idle)
    }

    /// Notifications currently pending for `user_id`, oldest first.
    pub async fn active(&self, user_id: &str) -> Vec<NotificationEvent> {
        let state = self.inner.state.lock().await;
        let mut events: Vec<NotificationEvent> = state
            .entries
            .values()
            .filter(|e| e.phase == NotificationPhase::Pending && e.event.user_id == user_id)
            .map(|e| e.event.clone())
            .collect();
        events.sort_by(|a, b| a.shown_at.cmp(&b.shown_at));
        events
    }

    /// Cancel every timer and forget all notifications without callbacks.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        let count = state.entries.len();
        for (_, entry) in state.entries.drain() {
            entry.timer.cancel();
        }
        if count > 0 {
            info!(count, "Notification timers cancelled on shutdown");
        }
    }
}

fn is_pending(state: &State, user_id: &str, routine_id: &str) -> bool {
    state
        .owned(user_id, routine_id)
        .is_some_and(|e| e.phase == NotificationPhase::Pending)
}

/// Remove an entry immediately, emitting `Dismissed` (when a reason is given)
/// followed by `Cleared`.
fn clear_now(inner: &Inner, state: &mut State, routine_id: &str, reason: Option<DismissReason>) {
    let Some(entry) = state.entries.remove(routine_id) else {
        return;
    };
    entry.timer.cancel();

    let user_id = entry.event.user_id;
    if let Some(reason) = reason {
        let _ = inner.tx.send(NotificationUpdate::Dismissed {
            user_id: user_id.clone(),
            routine_id: routine_id.to_string(),
            reason,
        });
    }
    let _ = inner.tx.send(NotificationUpdate::Cleared {
        user_id,
        routine_id: routine_id.to_string(),
    });
}

/// Move a pending entry to `Closing`, emit its dismissal, and arm the clear timer.
fn begin_closing(inner: &Arc<Inner>, state: &mut State, routine_id: &str, reason: DismissReason) {
    let seq = state.next_seq();
    let Some(entry) = state.entries.get_mut(routine_id) else {
        return;
    };
    entry.timer.cancel();
    entry.timer = arm(inner, routine_id, seq, inner.config.exit_grace, Stage::Clear);
    entry.seq = seq;
    entry.phase = NotificationPhase::Closing;

    let _ = inner.tx.send(NotificationUpdate::Dismissed {
        user_id: entry.event.user_id.clone(),
        routine_id: routine_id.to_string(),
        reason,
    });
}

fn arm(inner: &Arc<Inner>, routine_id: &str, seq: u64, after: Duration, stage: Stage) -> TimerHandle {
    let task = on_timer(Arc::downgrade(inner), routine_id.to_string(), seq, stage);
    inner.clock.start_timer(after, task)
}

fn on_timer(inner: Weak<Inner>, routine_id: String, seq: u64, stage: Stage) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut state = inner.state.lock().await;
        let current = state.entries.get(&routine_id).map(|e| (e.seq, e.phase));

        match (stage, current) {
            (Stage::Expire, Some((s, NotificationPhase::Pending))) if s == seq => {
                info!(routine_id = %routine_id, "Notification expired");
                begin_closing(&inner, &mut state, &routine_id, DismissReason::Expired);
            }
            (Stage::Clear, Some((s, NotificationPhase::Closing))) if s == seq => {
                debug!(routine_id = %routine_id, "Notification cleared");
                clear_now(&inner, &mut state, &routine_id, None);
            }
            _ => debug!(routine_id = %routine_id, seq, "Stale notification timer ignored"),
        }
    })
}
