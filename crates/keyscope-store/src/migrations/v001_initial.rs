//! v001 -- Initial schema creation.
//!
//! Creates the `kv_entries` table that mirrors the fast cache.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Key/value mirror of the fast cache
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS kv_entries (
    key        TEXT PRIMARY KEY NOT NULL,   -- namespaced key, e.g. keyscope:subscriptions:<id>
    value      TEXT NOT NULL,               -- JSON document
    updated_at TEXT NOT NULL                -- ISO-8601 / RFC-3339
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
