//! Error types for JIN.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors reported by the persistence collaborator.
///
/// `NotFound` and `Unauthorized` are kept apart so callers can tell an
/// unknown id from one owned by another user.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Routine {id} not found")]
    NotFound { id: String },

    #[error("Routine {id} is not owned by user {user_id}")]
    Unauthorized { id: String, user_id: String },

    #[error("Routine {id} already exists")]
    Conflict { id: String },

    #[error("Storage backend failure: {0}")]
    Backend(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Routine operation errors.
#[derive(Debug, thiserror::Error)]
pub enum RoutineError {
    #[error("Invalid day: {day}")]
    InvalidDay { day: String },

    #[error("Routine {id} not found")]
    NotFound { id: String },

    #[error("Invalid routine: {reason}")]
    Invalid { reason: String },

    #[error("Persistence failure: {0}")]
    Persistence(StoreError),
}

impl From<StoreError> for RoutineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } | StoreError::Unauthorized { id, .. } => {
                RoutineError::NotFound { id }
            }
            other => RoutineError::Persistence(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_surfaces_as_not_found() {
        let err: RoutineError = StoreError::Unauthorized {
            id: "r1".into(),
            user_id: "bob".into(),
        }
        .into();
        assert!(matches!(err, RoutineError::NotFound { id } if id == "r1"));
    }

    #[test]
    fn backend_failure_passes_through() {
        let err: RoutineError = StoreError::Backend("disk full".into()).into();
        match err {
            RoutineError::Persistence(StoreError::Backend(msg)) => assert_eq!(msg, "disk full"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
