//! Database schema.

use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    identity_id   TEXT PRIMARY KEY NOT NULL,
    display_name  TEXT NOT NULL,
    code          TEXT,
    is_active     INTEGER NOT NULL DEFAULT 1,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS face_embeddings (
    reference_id  TEXT PRIMARY KEY NOT NULL,
    identity_id   TEXT NOT NULL REFERENCES identities(identity_id) ON DELETE CASCADE,
    label         TEXT NOT NULL,
    dim           INTEGER NOT NULL,
    embedding     BLOB NOT NULL,
    model_version TEXT,
    created_at    TEXT NOT NULL,
    UNIQUE (identity_id, label)
);

CREATE TABLE IF NOT EXISTS cameras (
    camera_id     TEXT PRIMARY KEY NOT NULL,
    label         TEXT,
    location      TEXT,
    is_active     INTEGER NOT NULL DEFAULT 1,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance_logs (
    log_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    event_time    TEXT NOT NULL,
    event_type    TEXT NOT NULL CHECK (event_type IN ('CHECK_IN', 'CHECK_OUT')),
    camera_id     TEXT NOT NULL,
    identity_id   TEXT NOT NULL,
    display_name  TEXT,
    confidence    REAL NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attendance_logs_event_time ON attendance_logs(event_time);
";

/// Create tables if missing and set connection pragmas.
pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA)
}

/// Switch a file database to WAL so the async reader does not block the writer.
pub fn enable_wal(conn: &Connection) -> rusqlite::Result<String> {
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
}
