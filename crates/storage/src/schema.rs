use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

/// Applies connection pragmas and the fixed catalog DDL. Idempotent; runs on
/// every connection establishment.
pub fn init_core_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(CORE_SCHEMA_SQL)?;
    Ok(())
}

const CORE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS "user" (
    id INTEGER PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    session_key TEXT
);

CREATE TABLE IF NOT EXISTS campaign (
    id INTEGER PRIMARY KEY,
    owner_id INTEGER NOT NULL REFERENCES "user" (id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    start_ts TEXT NOT NULL,
    end_ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS data_source (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS "column" (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    column_type TEXT NOT NULL,
    is_categorical INTEGER NOT NULL,
    accept_values TEXT
);

CREATE TABLE IF NOT EXISTS data_source_column (
    data_source_id INTEGER NOT NULL REFERENCES data_source (id) ON DELETE CASCADE,
    column_id INTEGER NOT NULL REFERENCES "column" (id) ON DELETE CASCADE,
    column_order INTEGER NOT NULL,
    PRIMARY KEY (data_source_id, column_id)
);

CREATE TABLE IF NOT EXISTS campaign_data_source (
    campaign_id INTEGER NOT NULL REFERENCES campaign (id) ON DELETE CASCADE,
    data_source_id INTEGER NOT NULL REFERENCES data_source (id) ON DELETE CASCADE,
    PRIMARY KEY (campaign_id, data_source_id)
);

CREATE TABLE IF NOT EXISTS supervisor (
    campaign_id INTEGER NOT NULL REFERENCES campaign (id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES "user" (id) ON DELETE CASCADE,
    PRIMARY KEY (campaign_id, user_id)
);

CREATE TABLE IF NOT EXISTS participant (
    id INTEGER PRIMARY KEY,
    campaign_id INTEGER NOT NULL REFERENCES campaign (id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES "user" (id) ON DELETE CASCADE,
    join_ts TEXT NOT NULL,
    last_heartbeat_ts TEXT NOT NULL,
    UNIQUE (campaign_id, user_id)
);

CREATE TABLE IF NOT EXISTS hourly_stats (
    id INTEGER PRIMARY KEY,
    participant_id INTEGER NOT NULL REFERENCES participant (id) ON DELETE CASCADE,
    data_source_id INTEGER NOT NULL REFERENCES data_source (id) ON DELETE CASCADE,
    ts TEXT NOT NULL,
    amount TEXT NOT NULL,
    UNIQUE (participant_id, data_source_id, ts)
);
CREATE INDEX IF NOT EXISTS idx_hourly_stats_pd ON hourly_stats (participant_id, data_source_id);
CREATE INDEX IF NOT EXISTS idx_hourly_stats_ts ON hourly_stats (ts);
"#;
