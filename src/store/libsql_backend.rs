//! libSQL backend: async `RoutineStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::routines::model::{RepeatDays, Routine, RoutineFile, hhmm};
use crate::store::migrations;
use crate::store::traits::RoutineStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to create in-memory database: {e}")))?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Backend(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn check_owner(&self, user_id: &str, id: &str) -> Result<(), StoreError> {
        check_owner(self.conn(), user_id, id).await
    }
}

/// Resolve the owner of `id`, distinguishing unknown ids from foreign ones.
async fn check_owner(conn: &Connection, user_id: &str, id: &str) -> Result<(), StoreError> {
    let mut rows = conn
        .query("SELECT user_id FROM routines WHERE id = ?1", params![id])
        .await
        .map_err(|e| StoreError::Backend(format!("check_owner: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => {
            let owner: String = row.get(0).unwrap_or_default();
            if owner == user_id {
                Ok(())
            } else {
                Err(StoreError::Unauthorized {
                    id: id.to_string(),
                    user_id: user_id.to_string(),
                })
            }
        }
        Ok(None) => Err(StoreError::NotFound { id: id.to_string() }),
        Err(e) => Err(StoreError::Backend(format!("check_owner: {e}"))),
    }
}

async fn write_positions(
    conn: &Connection,
    user_id: &str,
    positions: &[(String, i64)],
    updated_at: &str,
) -> Result<(), StoreError> {
    for (id, position) in positions {
        check_owner(conn, user_id, id).await?;
        conn.execute(
            "UPDATE routines SET position = ?1, updated_at = ?2 WHERE id = ?3 AND user_id = ?4",
            params![*position, updated_at, id.clone(), user_id],
        )
        .await
        .map_err(|e| StoreError::Backend(format!("set_positions: {e}")))?;
    }
    Ok(())
}

// ── Helper functions ────────────────────────────────────────────────

const ROUTINE_COLUMNS: &str = "id, user_id, title, message, color, time, repeat_days, completed, notification, position, before_image, after_image, files, created_at, updated_at";

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn optional_text(value: &Option<String>) -> libsql::Value {
    match value {
        Some(s) => libsql::Value::Text(s.clone()),
        None => libsql::Value::Null,
    }
}

fn row_to_routine(row: &libsql::Row) -> Result<Routine, StoreError> {
    let time_str: String = row.get(5).unwrap_or_default();
    let time = hhmm::parse(&time_str)
        .map_err(|e| StoreError::Serialization(format!("bad time '{time_str}': {e}")))?;

    let days_str: String = row.get(6).unwrap_or_else(|_| "[]".to_string());
    let repeat_days: RepeatDays = serde_json::from_str(&days_str)
        .map_err(|e| StoreError::Serialization(format!("bad repeat_days '{days_str}': {e}")))?;

    let files_str: String = row.get(12).unwrap_or_else(|_| "[]".to_string());
    let files: Vec<RoutineFile> = serde_json::from_str(&files_str)
        .map_err(|e| StoreError::Serialization(format!("bad files '{files_str}': {e}")))?;

    let created_str: String = row.get(13).unwrap_or_default();
    let updated_str: String = row.get(14).unwrap_or_default();

    Ok(Routine {
        id: row.get(0).unwrap_or_default(),
        user_id: row.get(1).unwrap_or_default(),
        title: row.get(2).unwrap_or_default(),
        message: row.get(3).unwrap_or_default(),
        color: row.get(4).unwrap_or_default(),
        time,
        repeat_days,
        completed: row.get::<i64>(7).unwrap_or(0) != 0,
        notification: row.get::<i64>(8).unwrap_or(1) != 0,
        position: row.get(9).unwrap_or(0),
        before_image: row.get::<String>(10).ok(),
        after_image: row.get::<String>(11).ok(),
        files,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

#[async_trait]
impl RoutineStore for LibSqlStore {
    async fn list_routines(&self, user_id: &str) -> Result<Vec<Routine>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ROUTINE_COLUMNS} FROM routines WHERE user_id = ?1 ORDER BY position, created_at"
                ),
                params![user_id],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("list_routines: {e}")))?;

        let mut routines = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_routine(&row) {
                Ok(r) => routines.push(r),
                Err(e) => warn!("Skipping routine row: {e}"),
            }
        }
        Ok(routines)
    }

    async fn get_routine(&self, user_id: &str, id: &str) -> Result<Routine, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ROUTINE_COLUMNS} FROM routines WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("get_routine: {e}")))?;

        let routine = match rows.next().await {
            Ok(Some(row)) => row_to_routine(&row)?,
            Ok(None) => return Err(StoreError::NotFound { id: id.to_string() }),
            Err(e) => return Err(StoreError::Backend(format!("get_routine: {e}"))),
        };

        if routine.user_id != user_id {
            return Err(StoreError::Unauthorized {
                id: id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        Ok(routine)
    }

    async fn create_routine(&self, routine: &Routine) -> Result<(), StoreError> {
        let repeat_days = serde_json::to_string(&routine.repeat_days)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let files = serde_json::to_string(&routine.files)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO routines ({ROUTINE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    routine.id.clone(),
                    routine.user_id.clone(),
                    routine.title.clone(),
                    routine.message.clone(),
                    routine.color.clone(),
                    hhmm::format(&routine.time),
                    repeat_days,
                    routine.completed as i64,
                    routine.notification as i64,
                    routine.position,
                    optional_text(&routine.before_image),
                    optional_text(&routine.after_image),
                    files,
                    routine.created_at.to_rfc3339(),
                    routine.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    StoreError::Conflict {
                        id: routine.id.clone(),
                    }
                } else {
                    StoreError::Backend(format!("create_routine: {msg}"))
                }
            })?;

        debug!(routine_id = %routine.id, user_id = %routine.user_id, "Routine created");
        Ok(())
    }

    async fn update_routine(&self, user_id: &str, routine: &Routine) -> Result<(), StoreError> {
        self.check_owner(user_id, &routine.id).await?;
        if routine.user_id != user_id {
            return Err(StoreError::Unauthorized {
                id: routine.id.clone(),
                user_id: user_id.to_string(),
            });
        }

        let repeat_days = serde_json::to_string(&routine.repeat_days)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let files = serde_json::to_string(&routine.files)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "UPDATE routines SET title=?1, message=?2, color=?3, time=?4, repeat_days=?5, completed=?6, notification=?7, position=?8, before_image=?9, after_image=?10, files=?11, updated_at=?12 WHERE id=?13 AND user_id=?14",
                params![
                    routine.title.clone(),
                    routine.message.clone(),
                    routine.color.clone(),
                    hhmm::format(&routine.time),
                    repeat_days,
                    routine.completed as i64,
                    routine.notification as i64,
                    routine.position,
                    optional_text(&routine.before_image),
                    optional_text(&routine.after_image),
                    files,
                    routine.updated_at.to_rfc3339(),
                    routine.id.clone(),
                    user_id,
                ],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("update_routine: {e}")))?;

        Ok(())
    }

    async fn delete_routine(&self, user_id: &str, id: &str) -> Result<(), StoreError> {
        self.check_owner(user_id, id).await?;
        self.conn()
            .execute(
                "DELETE FROM routines WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("delete_routine: {e}")))?;
        Ok(())
    }

    async fn set_positions(
        &self,
        user_id: &str,
        positions: &[(String, i64)],
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| StoreError::Backend(format!("set_positions: {e}")))?;

        if let Err(e) = write_positions(&tx, user_id, positions, &updated_at.to_rfc3339()).await {
            if let Err(rb) = tx.rollback().await {
                warn!(error = %rb, "Rollback of position update failed");
            }
            return Err(e);
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Backend(format!("set_positions commit: {e}")))?;
        debug!(user_id, count = positions.len(), "Routine positions updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveTime;

    use super::*;
    use crate::routines::model::Weekday;

    async fn test_db() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    fn make_routine(id: &str, user: &str) -> Routine {
        let mut routine = Routine::new(
            user,
            "Stretch",
            NaiveTime::from_hms_opt(7, 30, 0).unwrap(),
            Utc::now(),
        )
        .with_id(id)
        .with_message("Time to stretch")
        .with_days([Weekday::Monday, Weekday::Thursday]);
        routine.before_image = Some("img/before.png".to_string());
        routine.files = vec![RoutineFile {
            name: "plan.pdf".to_string(),
            data: "blob:123".to_string(),
        }];
        routine
    }

    #[tokio::test]
    async fn routine_create_and_get() {
        let db = test_db().await;
        let routine = make_routine("r1", "user1");
        db.create_routine(&routine).await.unwrap();

        let fetched = db.get_routine("user1", "r1").await.unwrap();
        assert_eq!(fetched.title, "Stretch");
        assert_eq!(fetched.message, "Time to stretch");
        assert_eq!(fetched.time, routine.time);
        assert_eq!(fetched.repeat_days, routine.repeat_days);
        assert_eq!(fetched.before_image.as_deref(), Some("img/before.png"));
        assert!(fetched.after_image.is_none());
        assert_eq!(fetched.files, routine.files);
        assert!(fetched.notification);
        assert!(!fetched.completed);
    }

    #[tokio::test]
    async fn routine_get_scoped_by_user() {
        let db = test_db().await;
        db.create_routine(&make_routine("r1", "user1")).await.unwrap();

        assert!(matches!(
            db.get_routine("user2", "r1").await,
            Err(StoreError::Unauthorized { .. })
        ));
        assert!(matches!(
            db.get_routine("user1", "missing").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn routine_list_ordered_by_position() {
        let db = test_db().await;
        db.create_routine(&make_routine("b", "user1").with_position(2))
            .await
            .unwrap();
        db.create_routine(&make_routine("a", "user1").with_position(1))
            .await
            .unwrap();
        db.create_routine(&make_routine("z", "user2")).await.unwrap();

        let list = db.list_routines("user1").await.unwrap();
        let ids: Vec<&str> = list.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn routine_update() {
        let db = test_db().await;
        let mut routine = make_routine("r1", "user1");
        db.create_routine(&routine).await.unwrap();

        routine.completed = true;
        routine.repeat_days = RepeatDays::empty();
        db.update_routine("user1", &routine).await.unwrap();

        let fetched = db.get_routine("user1", "r1").await.unwrap();
        assert!(fetched.completed);
        assert!(fetched.repeat_days.is_empty());

        assert!(matches!(
            db.update_routine("user2", &routine).await,
            Err(StoreError::Unauthorized { .. })
        ));
    }

    #[tokio::test]
    async fn routine_delete() {
        let db = test_db().await;
        db.create_routine(&make_routine("r1", "user1")).await.unwrap();

        assert!(matches!(
            db.delete_routine("user2", "r1").await,
            Err(StoreError::Unauthorized { .. })
        ));
        db.delete_routine("user1", "r1").await.unwrap();
        assert!(matches!(
            db.delete_routine("user1", "r1").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let db = test_db().await;
        db.create_routine(&make_routine("r1", "user1")).await.unwrap();
        assert!(matches!(
            db.create_routine(&make_routine("r1", "user1")).await,
            Err(StoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jin.db");
        {
            let db = LibSqlStore::new_local(&path).await.unwrap();
            db.create_routine(&make_routine("r1", "user1")).await.unwrap();
        }
        let db = LibSqlStore::new_local(&path).await.unwrap();
        assert_eq!(db.list_routines("user1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn set_positions_rolls_back_on_failure() {
        let db = test_db().await;
        db.create_routine(&make_routine("a", "user1").with_position(0))
            .await
            .unwrap();
        db.create_routine(&make_routine("b", "user1").with_position(1))
            .await
            .unwrap();

        // "a" is written before "ghost" fails.
        let moves = [
            ("a".to_string(), 2),
            ("ghost".to_string(), 0),
            ("b".to_string(), 0),
        ];
        assert!(matches!(
            db.set_positions("user1", &moves, Utc::now()).await,
            Err(StoreError::NotFound { .. })
        ));
        assert_eq!(db.get_routine("user1", "a").await.unwrap().position, 0);
        assert_eq!(db.get_routine("user1", "b").await.unwrap().position, 1);

        let moves = [("a".to_string(), 1), ("b".to_string(), 0)];
        db.set_positions("user1", &moves, Utc::now()).await.unwrap();
        let list = db.list_routines("user1").await.unwrap();
        let ids: Vec<&str> = list.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);
    }

    #[tokio::test]
    async fn corrupt_files_column_is_an_error() {
        let db = test_db().await;
        db.create_routine(&make_routine("r1", "user1")).await.unwrap();
        db.conn()
            .execute("UPDATE routines SET files = 'not json' WHERE id = 'r1'", ())
            .await
            .unwrap();

        assert!(matches!(
            db.get_routine("user1", "r1").await,
            Err(StoreError::Serialization(_))
        ));
    }
}
