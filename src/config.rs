//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Notification popup timing.
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// How long a notification stays visible before auto-expiry.
    pub dwell: Duration,
    /// Exit-animation grace period after expiry or click-through.
    pub exit_grace: Duration,
    /// Capacity of the notification broadcast channel.
    pub broadcast_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            dwell: Duration::from_millis(5000),
            exit_grace: Duration::from_millis(300),
            broadcast_capacity: 256,
        }
    }
}

/// Due-time reminder ticker.
#[derive(Debug, Clone)]
pub struct ReminderConfig {
    pub enabled: bool,
    /// How often the ticker scans for routines whose trigger time passed.
    pub interval: Duration,
    /// Users whose routines the ticker scans.
    pub user_ids: Vec<String>,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            user_ids: vec!["default".to_string()],
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// libSQL database file. `:memory:` keeps everything in RAM.
    pub db_path: PathBuf,
    pub notifications: NotificationConfig,
    pub reminders: ReminderConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from("./data/jin.db"),
            notifications: NotificationConfig::default(),
            reminders: ReminderConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `JIN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = parse_or(&lookup, "JIN_PORT", defaults.port)?;
        let db_path = lookup("JIN_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let dwell_ms: u64 = parse_or(
            &lookup,
            "JIN_NOTIFICATION_DWELL_MS",
            defaults.notifications.dwell.as_millis() as u64,
        )?;
        let grace_ms: u64 = parse_or(
            &lookup,
            "JIN_NOTIFICATION_GRACE_MS",
            defaults.notifications.exit_grace.as_millis() as u64,
        )?;
        if dwell_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "JIN_NOTIFICATION_DWELL_MS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let enabled = parse_or(&lookup, "JIN_REMINDERS_ENABLED", defaults.reminders.enabled)?;
        let interval_secs: u64 = parse_or(
            &lookup,
            "JIN_REMINDER_INTERVAL_SECS",
            defaults.reminders.interval.as_secs(),
        )?;
        if interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "JIN_REMINDER_INTERVAL_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let user_ids = match lookup("JIN_REMINDER_USERS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.reminders.user_ids,
        };

        Ok(Self {
            port,
            db_path,
            notifications: NotificationConfig {
                dwell: Duration::from_millis(dwell_ms),
                exit_grace: Duration::from_millis(grace_ms),
                ..defaults.notifications
            },
            reminders: ReminderConfig {
                enabled,
                interval: Duration::from_secs(interval_secs),
                user_ids,
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
