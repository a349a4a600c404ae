//! Per-workspace sync watermark persistence

use std::collections::BTreeSet;

use crate::error::Result;
use crate::models::SyncCursor;
use libsql::{params, Connection};

/// Repository over `sync_watermarks`
pub struct WatermarkRepository<'a> {
    conn: &'a Connection,
}

impl<'a> WatermarkRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Current watermark for a workspace (Unix ms), `None` before the first pull
    pub async fn get(&self, workspace_id: &str) -> Result<Option<i64>> {
        Ok(self
            .cursor(workspace_id)
            .await?
            .map(|cursor| cursor.watermark_ms))
    }

    /// Full download position for a workspace, `None` before the first pull
    pub async fn cursor(&self, workspace_id: &str) -> Result<Option<SyncCursor>> {
        let mut rows = self
            .conn
            .query(
                "SELECT watermark_ms, boundary_keys FROM sync_watermarks WHERE workspace_id = ?",
                [workspace_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let boundary: String = row.get(1)?;
        Ok(Some(SyncCursor {
            watermark_ms: row.get(0)?,
            boundary: serde_json::from_str::<BTreeSet<String>>(&boundary)?,
        }))
    }

    /// Store a cursor unless the stored one is further ahead. Returns the stored watermark.
    pub async fn advance(&self, workspace_id: &str, cursor: &SyncCursor, now: i64) -> Result<i64> {
        let boundary = serde_json::to_string(&cursor.boundary)?;
        self.conn
            .execute(
                "INSERT INTO sync_watermarks (workspace_id, watermark_ms, boundary_keys, updated_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(workspace_id) DO UPDATE SET
                    watermark_ms = excluded.watermark_ms,
                    boundary_keys = excluded.boundary_keys,
                    updated_at = excluded.updated_at
                 WHERE excluded.watermark_ms >= sync_watermarks.watermark_ms",
                params![workspace_id, cursor.watermark_ms, boundary, now],
            )
            .await?;

        Ok(self.get(workspace_id).await?.unwrap_or(cursor.watermark_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watermark_is_monotonic() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = WatermarkRepository::new(db.connection());

        assert_eq!(repo.get("default").await.unwrap(), None);
        assert_eq!(repo.advance("default", &SyncCursor::new(100), 1).await.unwrap(), 100);
        assert_eq!(repo.advance("default", &SyncCursor::new(50), 2).await.unwrap(), 100);
        assert_eq!(repo.advance("default", &SyncCursor::new(150), 3).await.unwrap(), 150);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watermarks_are_per_workspace() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = WatermarkRepository::new(db.connection());

        repo.advance("alpha", &SyncCursor::new(10), 1).await.unwrap();
        assert_eq!(repo.get("beta").await.unwrap(), None);
        assert_eq!(repo.get("alpha").await.unwrap(), Some(10));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_boundary_keys_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = WatermarkRepository::new(db.connection());
        let cursor = SyncCursor {
            watermark_ms: 42,
            boundary: BTreeSet::from(["task:a".to_string(), "project:b".to_string()]),
        };

        repo.advance("default", &cursor, 1).await.unwrap();
        assert_eq!(repo.cursor("default").await.unwrap(), Some(cursor));
    }
}
