//! Completion tracker: flips a routine's `completed` flag and persists it.

use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{RoutineError, StoreError};
use crate::routines::model::Routine;
use crate::store::RoutineStore;

/// Toggles completion for the current cycle.
///
/// The tracker never retries. A failed write is returned to the caller and the
/// routine it was given stays as it was.
pub struct CompletionTracker {
    store: Arc<dyn RoutineStore>,
    clock: Arc<dyn Clock>,
}

impl CompletionTracker {
    pub fn new(store: Arc<dyn RoutineStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Flip `routine.completed`, persist it, and return the new value.
    pub async fn toggle_completion(
        &self,
        user_id: &str,
        routine: &Routine,
    ) -> Result<Routine, RoutineError> {
        let next = routine.toggled_completion(self.clock.now());

        if let Err(e) = self.store.update_routine(user_id, &next).await {
            match &e {
                StoreError::NotFound { .. } => {
                    warn!(routine_id = %routine.id, "Completion toggle for unknown routine")
                }
                StoreError::Unauthorized { .. } => {
                    warn!(routine_id = %routine.id, user_id, "Completion toggle for foreign routine")
                }
                other => {
                    warn!(routine_id = %routine.id, error = %other, "Failed to persist completion")
                }
            }
            return Err(e.into());
        }

        info!(
            routine_id = %next.id,
            completed = next.completed,
            "Routine completion toggled"
        );
        Ok(next)
    }

    /// Load a routine by id and toggle it.
    pub async fn toggle_by_id(
        &self,
        user_id: &str,
        routine_id: &str,
    ) -> Result<Routine, RoutineError> {
        let routine = self.store.get_routine(user_id, routine_id).await?;
        self.toggle_completion(user_id, &routine).await
    }
}
