//! JIN: routine reminders with timed notifications.

pub mod clock;
pub mod config;
pub mod error;
pub mod routines;
pub mod store;
