//! Reminder engine: turns routine trigger times into notifications.
//!
//! A ticker calls [`ReminderEngine::check_due`] every interval. Each check
//! covers the window since the previous check for that user, so a routine
//! fires once even if ticks drift. Times are local wall-clock times.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, Duration as ChronoDuration, Local, NaiveDateTime};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::ReminderConfig;
use crate::error::RoutineError;
use crate::routines::model::{Invocation, Routine, is_scheduled_today};
use crate::routines::notifications::NotificationManager;
use crate::store::RoutineStore;

/// Fires routine notifications when their trigger time is reached.
pub struct ReminderEngine {
    config: ReminderConfig,
    store: Arc<dyn RoutineStore>,
    notifications: NotificationManager,
    /// Upper bound of the last checked window, per user.
    last_check: Mutex<HashMap<String, NaiveDateTime>>,
}

impl ReminderEngine {
    pub fn new(
        config: ReminderConfig,
        store: Arc<dyn RoutineStore>,
        notifications: NotificationManager,
    ) -> Self {
        Self {
            config,
            store,
            notifications,
            last_check: Mutex::new(HashMap::new()),
        }
    }

    /// Schedule notifications for every routine of `user_id` whose trigger
    /// time fell in `(last check, now]`. Returns the number fired.
    ///
    /// The window only advances once the routines were read, so a failed
    /// read is retried by the next check.
    pub async fn check_due(&self, user_id: &str, now: NaiveDateTime) -> Result<usize, RoutineError> {
        let mut last = self.last_check.lock().await;
        let fallback = now
            - ChronoDuration::from_std(self.config.interval)
                .unwrap_or_else(|_| ChronoDuration::minutes(1));
        let since = last.get(user_id).copied().unwrap_or(fallback);
        if since >= now {
            return Ok(0);
        }
        // Never look back more than a day.
        let since = since.max(now - ChronoDuration::days(1));

        let routines = self.store.list_routines(user_id).await?;
        last.insert(user_id.to_string(), now);
        drop(last);

        let mut fired = 0;
        for routine in routines.iter().filter(|r| is_due(r, since, now)) {
            self.notifications
                .schedule(user_id, &routine.id, &routine.title, &routine.message)
                .await;
            fired += 1;
        }

        if fired > 0 {
            info!(user_id, fired, "Routine reminders fired");
        }
        Ok(fired)
    }

    /// Show a routine's notification now, regardless of its schedule.
    pub async fn fire_manual(&self, user_id: &str, routine_id: &str) -> Result<Routine, RoutineError> {
        let routine = self.store.get_routine(user_id, routine_id).await?;
        debug!(routine_id, user_id, "Manual notification");
        self.notifications
            .schedule(user_id, &routine.id, &routine.title, &routine.message)
            .await;
        Ok(routine)
    }

    pub fn notifications(&self) -> &NotificationManager {
        &self.notifications
    }
}

/// Whether `routine` should fire for a trigger time in `(since, now]`.
fn is_due(routine: &Routine, since: NaiveDateTime, now: NaiveDateTime) -> bool {
    if !routine.notification || routine.completed {
        return false;
    }
    let mut day = since.date();
    while day <= now.date() {
        let fire_at = day.and_time(routine.time);
        if fire_at > since
            && fire_at <= now
            && is_scheduled_today(routine, day.weekday(), Invocation::Automatic)
        {
            return true;
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    false
}

/// Spawn the reminder ticker background task.
pub fn spawn_reminder_ticker(engine: Arc<ReminderEngine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(engine.config.interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let now = Local::now().naive_local();
            for user_id in &engine.config.user_ids {
                if let Err(e) = engine.check_due(user_id, now).await {
                    error!(user_id = %user_id, "Reminder check failed: {}", e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

    use super::*;
    use crate::clock::TokioClock;
    use crate::config::NotificationConfig;
    use crate::routines::model::Weekday;
    use crate::routines::notifications::NotificationPhase;
    use crate::error::StoreError;
    use crate::store::MemoryStore;

    /// Memory store whose next `list_routines` call fails once when armed.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_next_list: AtomicBool,
    }

    #[async_trait]
    impl RoutineStore for FlakyStore {
        async fn list_routines(&self, user_id: &str) -> Result<Vec<Routine>, StoreError> {
            if self.fail_next_list.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Backend("blip".into()));
            }
            self.inner.list_routines(user_id).await
        }
        async fn get_routine(&self, user_id: &str, id: &str) -> Result<Routine, StoreError> {
            self.inner.get_routine(user_id, id).await
        }
        async fn create_routine(&self, routine: &Routine) -> Result<(), StoreError> {
            self.inner.create_routine(routine).await
        }
        async fn update_routine(&self, user_id: &str, routine: &Routine) -> Result<(), StoreError> {
            self.inner.update_routine(user_id, routine).await
        }
        async fn delete_routine(&self, user_id: &str, id: &str) -> Result<(), StoreError> {
            self.inner.delete_routine(user_id, id).await
        }
        async fn set_positions(
            &self,
            user_id: &str,
            positions: &[(String, i64)],
            updated_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.inner.set_positions(user_id, positions, updated_at).await
        }
    }

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    // 2026-03-02 is a Monday.
    fn monday(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap().and_time(at(h, m))
    }

    fn routine(id: &str, time: NaiveTime, days: &[Weekday]) -> Routine {
        Routine::new("user1", id, time, Utc::now())
            .with_id(id)
            .with_days(days.iter().copied())
    }

    async fn engine_with(routines: Vec<Routine>) -> ReminderEngine {
        let store = Arc::new(MemoryStore::new());
        for r in &routines {
            store.create_routine(r).await.unwrap();
        }
        let config = ReminderConfig {
            interval: Duration::from_secs(60),
            ..Default::default()
        };
        let notifications =
            NotificationManager::new(NotificationConfig::default(), Arc::new(TokioClock));
        ReminderEngine::new(config, store, notifications)
    }

    #[test]
    fn due_only_inside_window_on_repeat_day() {
        let r = routine("r1", at(7, 30), &[Weekday::Monday]);
        assert!(is_due(&r, monday(7, 29), monday(7, 30)));
        assert!(!is_due(&r, monday(7, 30), monday(7, 31)));
        assert!(!is_due(&r, monday(7, 0), monday(7, 29)));

        let tuesday = |h, m| monday(h, m) + ChronoDuration::days(1);
        assert!(!is_due(&r, tuesday(7, 29), tuesday(7, 30)));
    }

    #[test]
    fn due_across_midnight() {
        let r = routine("r1", at(0, 5), &[Weekday::Tuesday]);
        let since = monday(23, 59);
        let now = monday(0, 10) + ChronoDuration::days(1);
        assert!(is_due(&r, since, now));
    }

    #[test]
    fn completed_or_silent_routines_never_due() {
        let mut r = routine("r1", at(7, 30), &[Weekday::Monday]);
        r.completed = true;
        assert!(!is_due(&r, monday(7, 0), monday(8, 0)));

        let mut r = routine("r1", at(7, 30), &[Weekday::Monday]);
        r.notification = false;
        assert!(!is_due(&r, monday(7, 0), monday(8, 0)));

        let manual_only = routine("r2", at(7, 30), &[]);
        assert!(!is_due(&manual_only, monday(7, 0), monday(8, 0)));
    }

    #[tokio::test]
    async fn check_due_fires_once_per_window() {
        let engine = engine_with(vec![
            routine("stretch", at(7, 30), &[Weekday::Monday]),
            routine("water", at(9, 0), &[Weekday::Monday]),
        ])
        .await;

        assert_eq!(engine.check_due("user1", monday(7, 30)).await.unwrap(), 1);
        assert_eq!(
            engine.notifications().phase("stretch").await,
            NotificationPhase::Pending
        );
        assert_eq!(
            engine.notifications().phase("water").await,
            NotificationPhase::Idle
        );

        // Same instant again: empty window.
        assert_eq!(engine.check_due("user1", monday(7, 30)).await.unwrap(), 0);
        assert_eq!(engine.check_due("user1", monday(7, 31)).await.unwrap(), 0);
        assert_eq!(engine.check_due("user1", monday(9, 0)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fire_manual_ignores_schedule() {
        let engine = engine_with(vec![routine("someday", at(7, 30), &[])]).await;

        let fired = engine.fire_manual("user1", "someday").await.unwrap();
        assert_eq!(fired.id, "someday");
        assert_eq!(
            engine.notifications().phase("someday").await,
            NotificationPhase::Pending
        );
    }

    #[tokio::test]
    async fn fire_manual_unknown_routine() {
        let engine = engine_with(vec![routine("r1", at(7, 30), &[])]).await;

        assert!(matches!(
            engine.fire_manual("user1", "ghost").await,
            Err(RoutineError::NotFound { .. })
        ));
        assert!(matches!(
            engine.fire_manual("user2", "r1").await,
            Err(RoutineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn failed_read_keeps_window_open() {
        let store = Arc::new(FlakyStore::default());
        store
            .create_routine(&routine("stretch", at(7, 30), &[Weekday::Monday]))
            .await
            .unwrap();
        let notifications =
            NotificationManager::new(NotificationConfig::default(), Arc::new(TokioClock));
        let engine = ReminderEngine::new(
            ReminderConfig {
                interval: Duration::from_secs(60),
                ..Default::default()
            },
            store.clone(),
            notifications,
        );

        assert_eq!(engine.check_due("user1", monday(7, 29)).await.unwrap(), 0);

        store.fail_next_list.store(true, Ordering::SeqCst);
        assert!(matches!(
            engine.check_due("user1", monday(7, 30)).await,
            Err(RoutineError::Persistence(StoreError::Backend(_)))
        ));
        assert_eq!(
            engine.notifications().phase("stretch").await,
            NotificationPhase::Idle
        );

        // The next check still covers 07:30.
        assert_eq!(engine.check_due("user1", monday(7, 31)).await.unwrap(), 1);
        assert_eq!(
            engine.notifications().phase("stretch").await,
            NotificationPhase::Pending
        );
        assert_eq!(
            engine.notifications().active("user1").await[0].user_id,
            "user1"
        );
    }
}
