//! `RoutineStore` trait: the persistence collaborator for routines.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::routines::model::Routine;

/// Backend-agnostic routine storage. Every call is scoped to an owning user.
///
/// Lookups of an id that exists under another user report
/// [`StoreError::Unauthorized`]; unknown ids report [`StoreError::NotFound`].
#[async_trait]
pub trait RoutineStore: Send + Sync {
    /// List a user's routines in display order.
    async fn list_routines(&self, user_id: &str) -> Result<Vec<Routine>, StoreError>;

    /// Get one routine.
    async fn get_routine(&self, user_id: &str, id: &str) -> Result<Routine, StoreError>;

    /// Insert a new routine. The owner is `routine.user_id`.
    async fn create_routine(&self, routine: &Routine) -> Result<(), StoreError>;

    /// Replace a stored routine with `routine`.
    async fn update_routine(&self, user_id: &str, routine: &Routine) -> Result<(), StoreError>;

    /// Delete a routine.
    async fn delete_routine(&self, user_id: &str, id: &str) -> Result<(), StoreError>;

    /// Set the display position of several routines. Either every listed
    /// routine is updated or none is.
    async fn set_positions(
        &self,
        user_id: &str,
        positions: &[(String, i64)],
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
