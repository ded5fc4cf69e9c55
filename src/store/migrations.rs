//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "conversations",
        sql: r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                participant_address TEXT NOT NULL,
                display_name TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_address
                ON conversations(participant_address, updated_at DESC, created_at DESC);

            CREATE TABLE IF NOT EXISTS conversation_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                message_id TEXT,
                legacy_id TEXT,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL,
                subject TEXT,
                sender_display_name TEXT NOT NULL,
                is_from_operator INTEGER NOT NULL DEFAULT 0,
                read INTEGER NOT NULL DEFAULT 0,
                reply_to_message_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_conversation_messages_conversation
                ON conversation_messages(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_conversation_messages_message_id
                ON conversation_messages(message_id);
            CREATE INDEX IF NOT EXISTS idx_conversation_messages_legacy_id
                ON conversation_messages(legacy_id);
        "#,
    },
    Migration {
        version: 2,
        name: "ingestion_log",
        sql: r#"
            CREATE TABLE IF NOT EXISTS ingestion_log (
                id TEXT PRIMARY KEY,
                uid INTEGER,
                raw TEXT NOT NULL,
                sender_address TEXT,
                sender_name TEXT,
                subject TEXT,
                reply_reference TEXT,
                matched_conversation_id TEXT,
                matched_reply_message_id TEXT,
                appended INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                processed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ingestion_log_processed_at
                ON ingestion_log(processed_at DESC);
            CREATE INDEX IF NOT EXISTS idx_ingestion_log_conversation
                ON ingestion_log(matched_conversation_id);
            CREATE INDEX IF NOT EXISTS idx_ingestion_log_appended
                ON ingestion_log(appended);
        "#,
    },
    Migration {
        version: 3,
        name: "sessions_and_dedup",
        sql: r#"
            CREATE TABLE IF NOT EXISTS operator_sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            ALTER TABLE conversation_messages ADD COLUMN source_hash TEXT;
            CREATE INDEX IF NOT EXISTS idx_conversation_messages_source_hash
                ON conversation_messages(conversation_id, source_hash);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("Failed to parse migration version: {e}"))),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, table: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                libsql::params![table],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get::<i64>(0).unwrap() == 1
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "conversations",
            "conversation_messages",
            "ingestion_log",
            "operator_sessions",
        ] {
            assert!(table_exists(&conn, table).await, "Table '{table}' should exist");
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let version: i64 = row.get(0).unwrap();
            let name: String = row.get(1).unwrap();
            seen.push((version, name));
        }
        assert_eq!(
            seen,
            vec![
                (1, "conversations".to_string()),
                (2, "ingestion_log".to_string()),
                (3, "sessions_and_dedup".to_string()),
            ]
        );
    }
}
