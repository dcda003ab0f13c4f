//! Routines: model, completion tracking, reminders and notifications.

pub mod completion;
pub mod engine;
pub mod model;
pub mod notifications;
pub mod ws;
