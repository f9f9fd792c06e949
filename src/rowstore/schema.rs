//! SQLite schema and migrations for the reference row-store implementation.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema, idempotently.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    // Verification rows: primary key (verification_id, verification_at) per spec §6.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS verifications (
            verification_id TEXT NOT NULL,
            verification_at TEXT NOT NULL,
            reference_image_url TEXT NOT NULL,
            checking_image_url TEXT NOT NULL,
            vending_machine_id TEXT,
            context_json TEXT NOT NULL,
            current_status TEXT NOT NULL,
            verification_status TEXT,
            verification_summary_json TEXT,
            discrepancies_json TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (verification_id, verification_at)
        )",
        [],
    )?;

    // ReferenceImageIndex-gsi: resolve layout metadata by reference image URL.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_verifications_reference_image_url
         ON verifications(reference_image_url, created_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_verifications_vending_machine_id
         ON verifications(vending_machine_id)",
        [],
    )?;

    // Conversation rows: primary key (verification_id, conversation_at) per spec §6.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS conversations (
            verification_id TEXT NOT NULL,
            conversation_at TEXT NOT NULL,
            current_turn INTEGER NOT NULL,
            turn_status TEXT NOT NULL,
            PRIMARY KEY (verification_id, conversation_at)
        )",
        [],
    )?;

    // Per-turn artifact/usage entries (spec §3's ConversationTurn row).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS conversation_turns (
            verification_id TEXT NOT NULL,
            turn_id INTEGER NOT NULL,
            raw_response_bucket TEXT NOT NULL,
            raw_response_key TEXT NOT NULL,
            processed_bucket TEXT NOT NULL,
            processed_key TEXT NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            thinking_tokens INTEGER NOT NULL,
            total_tokens INTEGER NOT NULL,
            provider_request_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (verification_id, turn_id)
        )",
        [],
    )?;

    // Layout metadata, looked up by (layout_id, layout_prefix) or by image URL.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS layouts (
            layout_id INTEGER NOT NULL,
            layout_prefix TEXT NOT NULL,
            reference_image_url TEXT,
            machine_structure_json TEXT NOT NULL,
            PRIMARY KEY (layout_id, layout_prefix)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_layouts_reference_image_url ON layouts(reference_image_url)",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='verifications'",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_schema_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        assert!(is_initialized(&conn));
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn initialize_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }
}
