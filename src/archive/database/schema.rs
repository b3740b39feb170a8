//! Database schema management with versioning

use rusqlite::{Connection, OptionalExtension};
use tracing::{error, info};

use super::{StoreError, StoreResult};

/// Database schema version
const SCHEMA_VERSION: u32 = 1;

/// Initialize the schema or migrate an older one
pub fn initialize_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_initial_schema(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        info!("Database schema initialized to version {}", SCHEMA_VERSION);
    } else if current_version > SCHEMA_VERSION {
        error!(
            "Database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        );
        return Err(StoreError::Schema(format!(
            "schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    Ok(())
}

fn create_initial_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "BEGIN;

        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            filename TEXT NOT NULL UNIQUE,
            hash TEXT NOT NULL UNIQUE,
            size_bytes INTEGER NOT NULL,
            rating TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'inbox',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            category TEXT NOT NULL,
            UNIQUE(name, category)
        );

        CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL UNIQUE,
            site TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS file_tags (
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            PRIMARY KEY(file_id, tag_id)
        );

        CREATE TABLE IF NOT EXISTS file_sources (
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            PRIMARY KEY(file_id, source_id)
        );

        CREATE TABLE IF NOT EXISTS subscriptions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            site TEXT NOT NULL,
            tags TEXT NOT NULL,
            tag_key TEXT NOT NULL,
            blacklist TEXT NOT NULL DEFAULT '[]',
            item_limit INTEGER NOT NULL,
            interval TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'waiting',
            next_run_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(site, tag_key)
        );

        CREATE TABLE IF NOT EXISTS subscription_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            site TEXT NOT NULL,
            tags TEXT NOT NULL,
            tag_key TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'running',
            page_number INTEGER NOT NULL DEFAULT 0,
            downloaded_count INTEGER NOT NULL DEFAULT 0,
            skipped_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            finished INTEGER NOT NULL DEFAULT 0,
            finished_at TEXT,
            orphaned INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS run_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL REFERENCES subscription_runs(id) ON DELETE CASCADE,
            url TEXT NOT NULL,
            outcome TEXT NOT NULL,
            file_id INTEGER REFERENCES files(id) ON DELETE SET NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_files_status ON files(status, updated_at);
        CREATE INDEX IF NOT EXISTS idx_subscriptions_due ON subscriptions(status, next_run_at);
        CREATE INDEX IF NOT EXISTS idx_runs_identity ON subscription_runs(site, tag_key);
        CREATE INDEX IF NOT EXISTS idx_runs_status ON subscription_runs(status);
        CREATE INDEX IF NOT EXISTS idx_run_log_run ON run_log(run_id, id);

        COMMIT;",
    )?;
    Ok(())
}

fn get_schema_version(conn: &Connection) -> StoreResult<u32> {
    let version: Option<u32> = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: u32) -> StoreResult<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        set_schema_version(&conn, SCHEMA_VERSION + 1).unwrap();
        assert!(matches!(initialize_schema(&conn), Err(StoreError::Schema(_))));
    }
}
