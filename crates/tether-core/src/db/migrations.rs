//! Database migrations

use crate::error::Result;
use crate::models::EntityType;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 4;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }
    if version < 3 {
        migrate_v3(conn).await?;
    }
    if version < 4 {
        migrate_v4(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Execute statements atomically, rolling back on the first failure
async fn apply(conn: &Connection, version: i32, statements: &[String]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version} (latest {CURRENT_VERSION})");
    Ok(())
}

/// Migration to version 1: entity tables
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let mut statements = vec!["CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )"
    .to_string()];

    for entity_type in EntityType::ALL {
        let table = entity_type.table();
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                is_synced INTEGER NOT NULL DEFAULT 0,
                last_sync_at INTEGER,
                is_deleted INTEGER NOT NULL DEFAULT 0
            )"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_synced ON {table}(is_synced)"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_updated ON {table}(updated_at DESC)"
        ));
    }

    apply(conn, 1, &statements).await
}

/// Migration to version 2: sync queue, offline change log and watermarks
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'PENDING',
            last_error TEXT,
            completed_at INTEGER
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status, enqueued_at, seq)",
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_type, entity_id)",
        "CREATE TABLE IF NOT EXISTS offline_changes (
            id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            change_type TEXT NOT NULL,
            conflicting_local TEXT NOT NULL,
            conflicting_remote TEXT NOT NULL,
            detected_at INTEGER NOT NULL,
            resolution TEXT,
            resolved INTEGER NOT NULL DEFAULT 0,
            resolved_at INTEGER,
            last_error TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_offline_changes_open ON offline_changes(resolved, detected_at)",
        "CREATE INDEX IF NOT EXISTS idx_offline_changes_entity ON offline_changes(entity_type, entity_id)",
        "CREATE TABLE IF NOT EXISTS sync_watermarks (
            workspace_id TEXT PRIMARY KEY,
            watermark_ms INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
    ]
    .map(str::to_string);

    apply(conn, 2, &statements).await
}

/// Migration to version 3: dead-letter storage for exhausted queue items
async fn migrate_v3(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_dead_letters (
            id TEXT PRIMARY KEY,
            queue_item_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            retry_count INTEGER NOT NULL,
            last_error TEXT NOT NULL,
            failed_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_dead_letters_failed_at ON sync_dead_letters(failed_at DESC)",
    ]
    .map(str::to_string);

    apply(conn, 3, &statements).await
}

/// Migration to version 4: records already applied at the watermark instant
async fn migrate_v4(conn: &Connection) -> Result<()> {
    let statements = [
        "ALTER TABLE sync_watermarks ADD COLUMN boundary_keys TEXT NOT NULL DEFAULT '[]'",
    ]
    .map(str::to_string);

    apply(conn, 4, &statements).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT EXISTS(
                    SELECT 1 FROM sqlite_master
                    WHERE type = 'table' AND name = ?
                )",
                [name],
            )
            .await
            .unwrap();

        rows.next()
            .await
            .unwrap()
            .is_some_and(|row| row.get::<i32>(0).unwrap() != 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap(); // Should not fail

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_create_every_table() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        for entity_type in EntityType::ALL {
            assert!(table_exists(&conn, entity_type.table()).await);
        }
        for table in [
            "sync_queue",
            "offline_changes",
            "sync_watermarks",
            "sync_dead_letters",
        ] {
            assert!(table_exists(&conn, table).await, "missing {table}");
        }
    }
}
