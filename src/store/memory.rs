//! In-memory `RoutineStore`, used in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::routines::model::{Routine, sort_by_position};
use crate::store::traits::RoutineStore;

#[derive(Default)]
pub struct MemoryStore {
    routines: RwLock<HashMap<String, Routine>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_owner(routine: &Routine, user_id: &str) -> Result<(), StoreError> {
    if routine.user_id != user_id {
        return Err(StoreError::Unauthorized {
            id: routine.id.clone(),
            user_id: user_id.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl RoutineStore for MemoryStore {
    async fn list_routines(&self, user_id: &str) -> Result<Vec<Routine>, StoreError> {
        let routines = self.routines.read().await;
        let mut owned: Vec<Routine> = routines
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        sort_by_position(&mut owned);
        Ok(owned)
    }

    async fn get_routine(&self, user_id: &str, id: &str) -> Result<Routine, StoreError> {
        let routines = self.routines.read().await;
        let routine = routines
            .get(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        check_owner(routine, user_id)?;
        Ok(routine.clone())
    }

    async fn create_routine(&self, routine: &Routine) -> Result<(), StoreError> {
        let mut routines = self.routines.write().await;
        if routines.contains_key(&routine.id) {
            return Err(StoreError::Conflict {
                id: routine.id.clone(),
            });
        }
        routines.insert(routine.id.clone(), routine.clone());
        Ok(())
    }

    async fn update_routine(&self, user_id: &str, routine: &Routine) -> Result<(), StoreError> {
        let mut routines = self.routines.write().await;
        let stored = routines
            .get_mut(&routine.id)
            .ok_or_else(|| StoreError::NotFound {
                id: routine.id.clone(),
            })?;
        check_owner(stored, user_id)?;
        check_owner(routine, user_id)?;
        *stored = routine.clone();
        Ok(())
    }

    async fn delete_routine(&self, user_id: &str, id: &str) -> Result<(), StoreError> {
        let mut routines = self.routines.write().await;
        let stored = routines
            .get(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        check_owner(stored, user_id)?;
        routines.remove(id);
        Ok(())
    }

    async fn set_positions(
        &self,
        user_id: &str,
        positions: &[(String, i64)],
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut routines = self.routines.write().await;
        for (id, _) in positions {
            let stored = routines
                .get(id)
                .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
            check_owner(stored, user_id)?;
        }
        for (id, position) in positions {
            if let Some(stored) = routines.get_mut(id) {
                stored.position = *position;
                stored.updated_at = updated_at;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveTime;

    use super::*;

    fn routine(id: &str, user: &str, position: i64) -> Routine {
        Routine::new(user, id, NaiveTime::from_hms_opt(8, 0, 0).unwrap(), Utc::now())
            .with_id(id)
            .with_position(position)
    }

    #[tokio::test]
    async fn list_is_scoped_and_ordered() {
        let store = MemoryStore::new();
        store.create_routine(&routine("b", "alice", 2)).await.unwrap();
        store.create_routine(&routine("a", "alice", 1)).await.unwrap();
        store.create_routine(&routine("x", "bob", 0)).await.unwrap();

        let ids: Vec<String> = store
            .list_routines("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn distinguishes_not_found_from_unauthorized() {
        let store = MemoryStore::new();
        store.create_routine(&routine("r1", "alice", 0)).await.unwrap();

        assert!(matches!(
            store.get_routine("alice", "nope").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.get_routine("bob", "r1").await,
            Err(StoreError::Unauthorized { .. })
        ));
        assert!(matches!(
            store.delete_routine("bob", "r1").await,
            Err(StoreError::Unauthorized { .. })
        ));
        assert!(store.get_routine("alice", "r1").await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let store = MemoryStore::new();
        store.create_routine(&routine("r1", "alice", 0)).await.unwrap();
        assert!(matches!(
            store.create_routine(&routine("r1", "alice", 0)).await,
            Err(StoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn update_and_delete() {
        let store = MemoryStore::new();
        let mut r = routine("r1", "alice", 0);
        store.create_routine(&r).await.unwrap();

        r.completed = true;
        store.update_routine("alice", &r).await.unwrap();
        assert!(store.get_routine("alice", "r1").await.unwrap().completed);

        store.delete_routine("alice", "r1").await.unwrap();
        assert!(matches!(
            store.update_routine("alice", &r).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn set_positions_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.create_routine(&routine("a", "alice", 0)).await.unwrap();
        store.create_routine(&routine("b", "alice", 1)).await.unwrap();
        store.create_routine(&routine("x", "bob", 0)).await.unwrap();

        let moves = [("a".to_string(), 1), ("x".to_string(), 0), ("b".to_string(), 0)];
        assert!(matches!(
            store.set_positions("alice", &moves, Utc::now()).await,
            Err(StoreError::Unauthorized { .. })
        ));
        assert_eq!(store.get_routine("alice", "a").await.unwrap().position, 0);
        assert_eq!(store.get_routine("alice", "b").await.unwrap().position, 1);

        let moves = [("a".to_string(), 1), ("b".to_string(), 0)];
        store.set_positions("alice", &moves, Utc::now()).await.unwrap();
        let ids: Vec<String> = store
            .list_routines("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["b", "a"]);
    }
}
