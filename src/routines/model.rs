//! Routine data model: weekday sets, the routine record, and pure updates.
//!
//! Everything here is a deterministic function of its inputs. Persistence and
//! timers live in [`crate::store`] and [`super::notifications`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RoutineError;

/// Color tag given to routines created without one.
pub const DEFAULT_COLOR: &str = "#4f46e5";

/// One of the seven repeat days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    /// All days, Monday first.
    pub const ALL: [Weekday; 7] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
        Weekday::Sunday,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Weekday::Monday => "monday",
            Weekday::Tuesday => "tuesday",
            Weekday::Wednesday => "wednesday",
            Weekday::Thursday => "thursday",
            Weekday::Friday => "friday",
            Weekday::Saturday => "saturday",
            Weekday::Sunday => "sunday",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Weekday {
    type Err = RoutineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Weekday::ALL
            .into_iter()
            .find(|d| d.as_str() == lower)
            .ok_or_else(|| RoutineError::InvalidDay { day: s.to_string() })
    }
}

impl TryFrom<String> for Weekday {
    type Error = RoutineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<chrono::Weekday> for Weekday {
    fn from(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
            chrono::Weekday::Sun => Weekday::Sunday,
        }
    }
}

/// The set of days a routine repeats on. Empty means manual trigger only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Weekday>", into = "Vec<Weekday>")]
pub struct RepeatDays(u8);

impl RepeatDays {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & day.bit() != 0
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= day.bit();
    }

    pub fn remove(&mut self, day: Weekday) {
        self.0 &= !day.bit();
    }

    /// Copy of this set with `day` flipped.
    pub fn toggled(self, day: Weekday) -> Self {
        Self(self.0 ^ day.bit())
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Days in the set, Monday first.
    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        Weekday::ALL.into_iter().filter(|d| self.contains(*d))
    }
}

impl FromIterator<Weekday> for RepeatDays {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut days = RepeatDays::empty();
        for day in iter {
            days.insert(day);
        }
        days
    }
}

impl From<Vec<Weekday>> for RepeatDays {
    fn from(days: Vec<Weekday>) -> Self {
        days.into_iter().collect()
    }
}

impl From<RepeatDays> for Vec<Weekday> {
    fn from(days: RepeatDays) -> Self {
        days.iter().collect()
    }
}

/// An attached file. The data reference is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineFile {
    pub name: String,
    pub data: String,
}

/// A recurring task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    /// Stable for the routine's lifetime.
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub color: String,
    /// Trigger time-of-day.
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    pub repeat_days: RepeatDays,
    /// Completion for the currently displayed cycle only.
    pub completed: bool,
    /// Whether timed popups fire for this routine.
    pub notification: bool,
    /// Display order, lower first.
    pub position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<RoutineFile>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Routine {
    /// Create a routine with a fresh id and default presentation.
    pub fn new(
        user_id: impl Into<String>,
        title: impl Into<String>,
        time: NaiveTime,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            title: title.into(),
            message: String::new(),
            color: DEFAULT_COLOR.to_string(),
            time,
            repeat_days: RepeatDays::empty(),
            completed: false,
            notification: true,
            position: 0,
            before_image: None,
            after_image: None,
            files: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Builder: set message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Builder: set repeat days.
    pub fn with_days(mut self, days: impl IntoIterator<Item = Weekday>) -> Self {
        self.repeat_days = days.into_iter().collect();
        self
    }

    /// Builder: set position.
    pub fn with_position(mut self, position: i64) -> Self {
        self.position = position;
        self
    }

    /// Next completion state: `completed` flipped, `updated_at` set to `now`.
    pub fn toggled_completion(&self, now: DateTime<Utc>) -> Routine {
        let mut next = self.clone();
        next.completed = !self.completed;
        next.updated_at = now;
        next
    }
}

/// How a routine is being evaluated for "due" status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// Time-driven check from the reminder ticker.
    Automatic,
    /// Explicit "fire now" from the user.
    Manual,
}

/// Repeat-day set of `routine` with `day` added if absent, removed if present.
pub fn toggle_day(routine: &Routine, day: &str) -> Result<RepeatDays, RoutineError> {
    let day: Weekday = day.parse()?;
    Ok(routine.repeat_days.toggled(day))
}

/// Whether `routine` is due on `today`.
///
/// Routines with an empty repeat-day set are never due automatically, only
/// when invoked manually.
pub fn is_scheduled_today(
    routine: &Routine,
    today: impl Into<Weekday>,
    invocation: Invocation,
) -> bool {
    if routine.repeat_days.is_empty() {
        return invocation == Invocation::Manual;
    }
    routine.repeat_days.contains(today.into())
}

/// Sort routines into display order.
pub fn sort_by_position(routines: &mut [Routine]) {
    routines.sort_by(|a, b| {
        a.position
            .cmp(&b.position)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

/// Move `routine_id` to `to_index` (clamped to the end) and renumber positions
/// densely from zero.
pub fn reorder(
    routines: &mut Vec<Routine>,
    routine_id: &str,
    to_index: usize,
) -> Result<(), RoutineError> {
    sort_by_position(routines);
    let from = routines
        .iter()
        .position(|r| r.id == routine_id)
        .ok_or_else(|| RoutineError::NotFound {
            id: routine_id.to_string(),
        })?;

    let moved = routines.remove(from);
    let to = to_index.min(routines.len());
    routines.insert(to, moved);

    for (i, routine) in routines.iter_mut().enumerate() {
        routine.position = i as i64;
    }
    Ok(())
}

/// Create/update payload accepted at the API boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutineDraft {
    pub title: String,
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    #[serde(default)]
    pub message: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub repeat_days: RepeatDays,
    #[serde(default = "default_notification")]
    pub notification: bool,
    #[serde(default)]
    pub before_image: Option<String>,
    #[serde(default)]
    pub after_image: Option<String>,
    #[serde(default)]
    pub files: Vec<RoutineFile>,
}

fn default_color() -> String {
    DEFAULT_COLOR.to_string()
}

fn default_notification() -> bool {
    true
}

impl RoutineDraft {
    fn validate(&self) -> Result<(), RoutineError> {
        if self.title.trim().is_empty() {
            return Err(RoutineError::Invalid {
                reason: "title must not be empty".to_string(),
            });
        }
        if self.files.iter().any(|f| f.name.trim().is_empty()) {
            return Err(RoutineError::Invalid {
                reason: "file name must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Build a new routine owned by `user_id`.
    pub fn into_routine(
        self,
        user_id: impl Into<String>,
        position: i64,
        now: DateTime<Utc>,
    ) -> Result<Routine, RoutineError> {
        self.validate()?;
        let mut routine = Routine::new(user_id, self.title.trim(), self.time, now);
        routine.message = self.message;
        routine.color = self.color;
        routine.repeat_days = self.repeat_days;
        routine.notification = self.notification;
        routine.position = position;
        routine.before_image = self.before_image;
        routine.after_image = self.after_image;
        routine.files = self.files;
        Ok(routine)
    }

    /// Overwrite the editable fields of `routine`. Leaves it untouched on error.
    pub fn apply_to(self, routine: &mut Routine, now: DateTime<Utc>) -> Result<(), RoutineError> {
        self.validate()?;
        routine.title = self.title.trim().to_string();
        routine.time = self.time;
        routine.message = self.message;
        routine.color = self.color;
        routine.repeat_days = self.repeat_days;
        routine.notification = self.notification;
        routine.before_image = self.before_image;
        routine.after_image = self.after_image;
        routine.files = self.files;
        routine.updated_at = now;
        Ok(())
    }
}

/// `"HH:MM"` time-of-day (seconds accepted on input).
pub(crate) mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn format(time: &NaiveTime) -> String {
        time.format(FORMAT).to_string()
    }

    pub fn parse(s: &str) -> Result<NaiveTime, chrono::ParseError> {
        NaiveTime::parse_from_str(s, FORMAT).or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}
