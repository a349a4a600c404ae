//! Offline change log persistence

use crate::error::Result;
use crate::models::{EntityType, OfflineChangeRecord, Resolution};
use libsql::{params, Connection, Row};
use serde_json::Value;

use super::opt_value;

const CHANGE_COLUMNS: &str = "id, entity_id, entity_type, change_type, conflicting_local,
    conflicting_remote, detected_at, resolution, resolved, resolved_at, last_error";

/// Repository over `offline_changes`
pub struct ChangeLogRepository<'a> {
    conn: &'a Connection,
}

impl<'a> ChangeLogRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Persist a newly detected conflict
    pub async fn insert(&self, record: &OfflineChangeRecord) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO offline_changes ({CHANGE_COLUMNS})
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params![
                    record.id.as_str(),
                    record.entity_id.as_str(),
                    record.entity_type.as_str(),
                    record.change_type.as_str(),
                    serde_json::to_string(&record.conflicting_local)?,
                    serde_json::to_string(&record.conflicting_remote)?,
                    record.detected_at,
                    opt_value(record.resolution.map(Resolution::as_str)),
                    i32::from(record.resolved),
                    opt_value(record.resolved_at),
                    opt_value(record.last_error.clone())
                ],
            )
            .await?;
        Ok(())
    }

    /// The unresolved conflict for an entity, if one is open
    pub async fn open_for(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<OfflineChangeRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CHANGE_COLUMNS} FROM offline_changes
                     WHERE entity_type = ? AND entity_id = ? AND resolved = 0
                     ORDER BY detected_at ASC
                     LIMIT 1"
                ),
                params![entity_type.as_str(), entity_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_change(&row)?)),
            None => Ok(None),
        }
    }

    /// Replace the remote snapshot of an open conflict with a newer one
    pub async fn refresh_remote(&self, id: &str, remote: &Value) -> Result<()> {
        self.conn
            .execute(
                "UPDATE offline_changes SET conflicting_remote = ? WHERE id = ? AND resolved = 0",
                params![serde_json::to_string(remote)?, id],
            )
            .await?;
        Ok(())
    }

    /// Fetch a change record by id
    pub async fn get(&self, id: &str) -> Result<Option<OfflineChangeRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {CHANGE_COLUMNS} FROM offline_changes WHERE id = ?"),
                [id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_change(&row)?)),
            None => Ok(None),
        }
    }

    /// All unresolved conflicts, oldest first
    pub async fn unresolved(&self) -> Result<Vec<OfflineChangeRecord>> {
        self.query_many(
            &format!(
                "SELECT {CHANGE_COLUMNS} FROM offline_changes
                 WHERE resolved = 0
                 ORDER BY detected_at ASC, id ASC"
            ),
            (),
        )
        .await
    }

    /// Entities that currently have an unresolved conflict
    pub async fn open_entities(&self) -> Result<Vec<(EntityType, String)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT DISTINCT entity_type, entity_id FROM offline_changes WHERE resolved = 0",
                (),
            )
            .await?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next().await? {
            let entity_type: String = row.get(0)?;
            entities.push((entity_type.parse()?, row.get(1)?));
        }
        Ok(entities)
    }

    /// Recent conflicts, newest first, optionally including resolved ones
    pub async fn list(&self, include_resolved: bool, limit: usize) -> Result<Vec<OfflineChangeRecord>> {
        self.query_many(
            &format!(
                "SELECT {CHANGE_COLUMNS} FROM offline_changes
                 WHERE resolved = 0 OR ? = 1
                 ORDER BY detected_at DESC, id DESC
                 LIMIT ?"
            ),
            params![i32::from(include_resolved), i64::try_from(limit).unwrap_or(i64::MAX)],
        )
        .await
    }

    /// Store the chosen resolution; `resolved = false` parks the record
    pub async fn set_outcome(
        &self,
        id: &str,
        resolution: Resolution,
        resolved: bool,
        resolved_at: Option<i64>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE offline_changes
                 SET resolution = ?, resolved = ?, resolved_at = ?, last_error = NULL
                 WHERE id = ?",
                params![
                    resolution.as_str(),
                    i32::from(resolved),
                    opt_value(resolved_at),
                    id
                ],
            )
            .await?;
        Ok(())
    }

    /// Remember why a resolution attempt failed
    pub async fn set_error(&self, id: &str, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE offline_changes SET last_error = ? WHERE id = ?",
                params![error, id],
            )
            .await?;
        Ok(())
    }

    /// Number of unresolved conflicts
    pub async fn count_open(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM offline_changes WHERE resolved = 0", ())
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    /// Garbage-collect resolved records older than the cutoff
    pub async fn purge_resolved_before(&self, cutoff: i64) -> Result<u64> {
        Ok(self
            .conn
            .execute(
                "DELETE FROM offline_changes WHERE resolved = 1 AND resolved_at < ?",
                [cutoff],
            )
            .await?)
    }

    async fn query_many(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<OfflineChangeRecord>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(parse_change(&row)?);
        }
        Ok(records)
    }
}

fn parse_change(row: &Row) -> Result<OfflineChangeRecord> {
    let entity_type: String = row.get(2)?;
    let change_type: String = row.get(3)?;
    let local: String = row.get(4)?;
    let remote: String = row.get(5)?;
    let resolution = row
        .get::<Option<String>>(7)?
        .map(|value| value.parse::<Resolution>())
        .transpose()?;

    Ok(OfflineChangeRecord {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        entity_type: entity_type.parse()?,
        change_type: change_type.parse()?,
        conflicting_local: serde_json::from_str(&local)?,
        conflicting_remote: serde_json::from_str(&remote)?,
        detected_at: row.get(6)?,
        resolution,
        resolved: row.get::<i32>(8)? != 0,
        resolved_at: row.get::<Option<i64>>(9)?,
        last_error: row.get::<Option<String>>(10)?,
    })
}
