//! Forward-only versioned schema (component C).
//!
//! Every mutation goes through the writer (`writer.rs`) inside a single
//! transaction; this module only owns opening the file and getting its
//! schema to `SCHEMA_VERSION`.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Highest schema version this binary knows how to run against.
pub const SCHEMA_VERSION: i64 = 1;

/// Ordered migrations, 1-indexed: `MIGRATIONS[0]` takes the database from
/// version 0 to version 1, and so on. Each runs inside its own transaction
/// with the version bump.
const MIGRATIONS: &[&str] = &[
    // v0 -> v1
    "
    CREATE TABLE sessions (
        session_id            TEXT PRIMARY KEY,
        pid                   INTEGER,
        terminal              TEXT,
        working_dir           TEXT,
        model                 TEXT,
        organization_id       TEXT,
        user_account_uuid     TEXT,
        total_cost            REAL NOT NULL DEFAULT 0,
        total_tokens          INTEGER NOT NULL DEFAULT 0,
        cache_read_tokens     INTEGER NOT NULL DEFAULT 0,
        cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
        active_time_secs      REAL NOT NULL DEFAULT 0,
        started_at            TEXT,
        last_event_at         TEXT,
        exited                INTEGER NOT NULL DEFAULT 0,
        fast_mode             INTEGER NOT NULL DEFAULT 0,
        service_version       TEXT,
        os_type               TEXT,
        os_version            TEXT,
        host_arch             TEXT
    );

    CREATE TABLE metrics (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        name       TEXT NOT NULL,
        value      REAL NOT NULL,
        timestamp  TEXT NOT NULL,
        attributes TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX idx_metrics_session_id ON metrics(session_id);
    CREATE INDEX idx_metrics_name ON metrics(name);
    CREATE INDEX idx_metrics_timestamp ON metrics(timestamp);

    CREATE TABLE events (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        name       TEXT NOT NULL,
        timestamp  TEXT NOT NULL,
        sequence   INTEGER NOT NULL DEFAULT 0,
        attributes TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX idx_events_session_id ON events(session_id);
    CREATE INDEX idx_events_name ON events(name);
    CREATE INDEX idx_events_timestamp ON events(timestamp);

    CREATE TABLE counter_state (
        session_id TEXT NOT NULL,
        metric_key TEXT NOT NULL,
        value      REAL NOT NULL,
        PRIMARY KEY (session_id, metric_key)
    );

    CREATE TABLE daily_summaries (
        session_id    TEXT NOT NULL,
        date          TEXT NOT NULL,
        total_cost    REAL NOT NULL DEFAULT 0,
        total_tokens  INTEGER NOT NULL DEFAULT 0,
        api_requests  INTEGER NOT NULL DEFAULT 0,
        api_errors    INTEGER NOT NULL DEFAULT 0,
        active_secs   REAL NOT NULL DEFAULT 0,
        PRIMARY KEY (session_id, date)
    );
    CREATE INDEX idx_daily_summaries_date ON daily_summaries(date);

    CREATE TABLE daily_stats (
        date                TEXT PRIMARY KEY,
        total_sessions      INTEGER NOT NULL DEFAULT 0,
        total_cost          REAL NOT NULL DEFAULT 0,
        total_tokens        INTEGER NOT NULL DEFAULT 0,
        lines_added         INTEGER NOT NULL DEFAULT 0,
        lines_removed       INTEGER NOT NULL DEFAULT 0,
        commits             INTEGER NOT NULL DEFAULT 0,
        pull_requests       INTEGER NOT NULL DEFAULT 0,
        cache_efficiency    REAL NOT NULL DEFAULT 0,
        avg_api_latency_s   REAL NOT NULL DEFAULT 0,
        error_rate          REAL NOT NULL DEFAULT 0,
        retry_rate          REAL NOT NULL DEFAULT 0,
        p50_latency_s       REAL NOT NULL DEFAULT 0,
        p95_latency_s       REAL NOT NULL DEFAULT 0,
        p99_latency_s       REAL NOT NULL DEFAULT 0,
        model_breakdown     TEXT NOT NULL DEFAULT '{}',
        top_tools           TEXT NOT NULL DEFAULT '{}',
        error_categories    TEXT NOT NULL DEFAULT '{}',
        language_breakdown  TEXT NOT NULL DEFAULT '{}',
        decision_sources    TEXT NOT NULL DEFAULT '{}',
        mcp_tool_usage      TEXT NOT NULL DEFAULT '{}'
    );

    CREATE TABLE burn_rate_snapshots (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp    TEXT NOT NULL,
        hourly_rate  REAL NOT NULL,
        by_model     TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX idx_burn_rate_snapshots_timestamp ON burn_rate_snapshots(timestamp);

    CREATE TABLE alert_history (
        id       INTEGER PRIMARY KEY AUTOINCREMENT,
        rule     TEXT NOT NULL,
        fired_at TEXT NOT NULL,
        message  TEXT NOT NULL,
        value    REAL NOT NULL,
        threshold REAL NOT NULL
    );
    CREATE INDEX idx_alert_history_fired_at ON alert_history(fired_at);
    CREATE INDEX idx_alert_history_rule ON alert_history(rule);

    CREATE TABLE schema_version (version INTEGER NOT NULL);
    INSERT INTO schema_version (version) VALUES (0);
    ",
];

/// Open (creating if absent) the database at `path`, apply pragmas, and
/// bring the schema up to `SCHEMA_VERSION`.
pub fn open(path: &std::path::Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
    )?;

    migrate(&mut conn, &path.display().to_string())?;
    Ok(conn)
}

fn current_version(conn: &Connection) -> rusqlite::Result<i64> {
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if !exists {
        return Ok(0);
    }
    conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
        row.get(0)
    })
}

fn migrate(conn: &mut Connection, path: &str) -> Result<()> {
    let found = current_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchemaVersion {
            path: path.to_string(),
            found,
            supported: SCHEMA_VERSION,
        });
    }

    for version in (found + 1)..=SCHEMA_VERSION {
        let migration = MIGRATIONS[(version - 1) as usize];
        let tx = conn.transaction()?;
        tx.execute_batch(migration)?;
        tx.execute("UPDATE schema_version SET version = ?1", [version])?;
        tx.commit()?;
        tracing::info!(version, "applied schema migration");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_database_lands_on_current_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ccpulse.db");
        let conn = open(&path).unwrap();
        let version = current_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn reopening_an_up_to_date_database_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ccpulse.db");
        {
            let conn = open(&path).unwrap();
            conn.execute(
                "INSERT INTO sessions (session_id) VALUES ('s1')",
                [],
            )
            .unwrap();
        }
        let conn = open(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn future_schema_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ccpulse.db");
        {
            let conn = open(&path).unwrap();
            conn.execute("UPDATE schema_version SET version = ?1", [SCHEMA_VERSION + 1])
                .unwrap();
        }
        let err = open(&path).unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedSchemaVersion { .. }));
    }

    #[test]
    fn parent_directory_is_created() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dir").join("ccpulse.db");
        open(&path).unwrap();
        assert!(path.parent().unwrap().is_dir());
    }
}
