//! Entity table repository

use crate::error::{Error, Result};
use crate::models::{EntityRecord, EntityType};
use libsql::{params, Connection, Row};

use super::opt_value;

/// Trait for entity table storage operations (async)
#[allow(async_fn_in_trait)]
pub trait EntityRepository {
    /// Insert a new row; fails with `DuplicateEntity` if the id exists (tombstones included)
    async fn insert(&self, record: &EntityRecord) -> Result<()>;

    /// Insert or fully replace a row
    async fn upsert(&self, record: &EntityRecord) -> Result<()>;

    /// Fetch a row by id, optionally including local tombstones
    async fn get(
        &self,
        entity_type: EntityType,
        id: &str,
        include_deleted: bool,
    ) -> Result<Option<EntityRecord>>;

    /// List live rows, most recently updated first
    async fn list(&self, entity_type: EntityType) -> Result<Vec<EntityRecord>>;

    /// Physically remove a row; returns whether a row existed
    async fn remove(&self, entity_type: EntityType, id: &str) -> Result<bool>;

    /// Flag a row as confirmed by the server
    async fn mark_synced(&self, entity_type: EntityType, id: &str, synced_at: i64) -> Result<()>;

    /// Count rows carrying unconfirmed local edits
    async fn count_unsynced(&self, entity_type: EntityType) -> Result<i64>;
}

/// libSQL implementation of `EntityRepository`
pub struct LibSqlEntityRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlEntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a record from a database row
    fn parse_record(entity_type: EntityType, row: &Row) -> Result<EntityRecord> {
        let data: String = row.get(1)?;
        let data = match serde_json::from_str(&data)? {
            serde_json::Value::Object(map) => map,
            _ => {
                return Err(Error::Database(format!(
                    "{entity_type} row holds a non-object payload"
                )))
            }
        };

        Ok(EntityRecord {
            id: row.get(0)?,
            entity_type,
            data,
            updated_at: row.get(2)?,
            is_synced: row.get::<i32>(3)? != 0,
            last_sync_at: row.get::<Option<i64>>(4)?,
            is_deleted: row.get::<i32>(5)? != 0,
        })
    }
}

impl EntityRepository for LibSqlEntityRepository<'_> {
    async fn insert(&self, record: &EntityRecord) -> Result<()> {
        if self
            .get(record.entity_type, &record.id, true)
            .await?
            .is_some()
        {
            return Err(Error::DuplicateEntity {
                entity_type: record.entity_type,
                id: record.id.clone(),
            });
        }

        let table = record.entity_type.table();
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {table} (id, data, updated_at, is_synced, last_sync_at, is_deleted)
                     VALUES (?, ?, ?, ?, ?, ?)"
                ),
                params![
                    record.id.as_str(),
                    serde_json::to_string(&record.data)?,
                    record.updated_at,
                    i32::from(record.is_synced),
                    opt_value(record.last_sync_at),
                    i32::from(record.is_deleted)
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert(&self, record: &EntityRecord) -> Result<()> {
        let table = record.entity_type.table();
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {table} (id, data, updated_at, is_synced, last_sync_at, is_deleted)
                     VALUES (?, ?, ?, ?, ?, ?)
                     ON CONFLICT(id) DO UPDATE SET
                        data = excluded.data,
                        updated_at = excluded.updated_at,
                        is_synced = excluded.is_synced,
                        last_sync_at = excluded.last_sync_at,
                        is_deleted = excluded.is_deleted"
                ),
                params![
                    record.id.as_str(),
                    serde_json::to_string(&record.data)?,
                    record.updated_at,
                    i32::from(record.is_synced),
                    opt_value(record.last_sync_at),
                    i32::from(record.is_deleted)
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(
        &self,
        entity_type: EntityType,
        id: &str,
        include_deleted: bool,
    ) -> Result<Option<EntityRecord>> {
        let table = entity_type.table();
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT id, data, updated_at, is_synced, last_sync_at, is_deleted
                     FROM {table}
                     WHERE id = ? AND (is_deleted = 0 OR ? = 1)"
                ),
                params![id, i32::from(include_deleted)],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_record(entity_type, &row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, entity_type: EntityType) -> Result<Vec<EntityRecord>> {
        let table = entity_type.table();
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT id, data, updated_at, is_synced, last_sync_at, is_deleted
                     FROM {table}
                     WHERE is_deleted = 0
                     ORDER BY updated_at DESC, id ASC"
                ),
                (),
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_record(entity_type, &row)?);
        }
        Ok(records)
    }

    async fn remove(&self, entity_type: EntityType, id: &str) -> Result<bool> {
        let table = entity_type.table();
        let affected = self
            .conn
            .execute(&format!("DELETE FROM {table} WHERE id = ?"), [id])
            .await?;
        Ok(affected > 0)
    }

    async fn mark_synced(&self, entity_type: EntityType, id: &str, synced_at: i64) -> Result<()> {
        let table = entity_type.table();
        self.conn
            .execute(
                &format!("UPDATE {table} SET is_synced = 1, last_sync_at = ? WHERE id = ?"),
                params![synced_at, id],
            )
            .await?;
        Ok(())
    }

    async fn count_unsynced(&self, entity_type: EntityType) -> Result<i64> {
        let table = entity_type.table();
        let mut rows = self
            .conn
            .query(
                &format!("SELECT COUNT(*) FROM {table} WHERE is_synced = 0"),
                (),
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn task(id: &str, title: &str) -> EntityRecord {
        EntityRecord::new(
            EntityType::Task,
            id,
            json!({ "title": title }).as_object().unwrap().clone(),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_get() {
        let db = setup().await;
        let repo = LibSqlEntityRepository::new(db.connection());

        let record = task("t-1", "Write docs");
        repo.insert(&record).await.unwrap();

        let fetched = repo.get(EntityType::Task, "t-1", false).await.unwrap().unwrap();
        assert_eq!(fetched, record);
        assert!(repo
            .get(EntityType::Project, "t-1", false)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_duplicate_rejected() {
        let db = setup().await;
        let repo = LibSqlEntityRepository::new(db.connection());

        repo.insert(&task("t-1", "A")).await.unwrap();
        let error = repo.insert(&task("t-1", "B")).await.unwrap_err();
        assert!(matches!(error, Error::DuplicateEntity { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tombstones_hidden_from_list() {
        let db = setup().await;
        let repo = LibSqlEntityRepository::new(db.connection());

        let mut record = task("t-1", "A");
        repo.insert(&record).await.unwrap();
        record.is_deleted = true;
        repo.upsert(&record).await.unwrap();

        assert!(repo.list(EntityType::Task).await.unwrap().is_empty());
        assert!(repo.get(EntityType::Task, "t-1", false).await.unwrap().is_none());
        assert!(repo.get(EntityType::Task, "t-1", true).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mark_synced_and_count() {
        let db = setup().await;
        let repo = LibSqlEntityRepository::new(db.connection());

        repo.insert(&task("t-1", "A")).await.unwrap();
        repo.insert(&task("t-2", "B")).await.unwrap();
        assert_eq!(repo.count_unsynced(EntityType::Task).await.unwrap(), 2);

        repo.mark_synced(EntityType::Task, "t-1", 99).await.unwrap();
        let synced = repo.get(EntityType::Task, "t-1", false).await.unwrap().unwrap();
        assert!(synced.is_synced);
        assert_eq!(synced.last_sync_at, Some(99));
        assert_eq!(repo.count_unsynced(EntityType::Task).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remove_missing_is_false() {
        let db = setup().await;
        let repo = LibSqlEntityRepository::new(db.connection());

        assert!(!repo.remove(EntityType::Task, "nope").await.unwrap());
    }
}
