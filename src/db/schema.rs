//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL)
        .execute(pool)
        .await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Content-addressed packets (bytes live under the packet root)
CREATE TABLE IF NOT EXISTS file_packets (
    digest TEXT PRIMARY KEY,
    storage_ref TEXT,
    status TEXT NOT NULL DEFAULT 'NEW',
    size INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    last_used_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_file_packets_status_used ON file_packets(status, last_used_at);

-- Ordered deny-list of path/principal rules
CREATE TABLE IF NOT EXISTS access_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    position INTEGER NOT NULL DEFAULT 0,
    pattern TEXT NOT NULL,
    principal TEXT NOT NULL,
    is_template INTEGER NOT NULL DEFAULT 0,
    description TEXT
);

CREATE INDEX IF NOT EXISTS idx_access_rules_position ON access_rules(position, id);
"#;
