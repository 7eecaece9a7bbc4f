//! Startup recovery (component E). Runs synchronously inside the durable
//! store's open sequence, before the writer or maintenance loop starts —
//! `counter_state` must be back in memory before the first post-restart
//! metric arrives, or it would double-count a cumulative value.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::store::MemoryStore;
use crate::types::{Attributes, Event, Metric, Session};

/// Reload sessions active in the last 24 hours into `store`. Per-session
/// failures are counted and logged but never abort the overall recovery.
pub fn recover(conn: &Connection, store: &MemoryStore) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT session_id, pid, terminal, working_dir, model, organization_id, user_account_uuid,
                total_cost, total_tokens, cache_read_tokens, cache_creation_tokens, active_time_secs,
                started_at, last_event_at, exited, fast_mode,
                service_version, os_type, os_version, host_arch
         FROM sessions
         WHERE last_event_at IS NOT NULL AND datetime(last_event_at) > datetime('now', '-24 hours')",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok(Session {
            session_id: row.get(0)?,
            pid: row.get::<_, Option<i64>>(1)?.map(|v| v as u32),
            terminal: non_empty(row.get(2)?),
            working_dir: non_empty(row.get(3)?),
            model: non_empty(row.get(4)?),
            organization_id: non_empty(row.get(5)?),
            user_account_uuid: non_empty(row.get(6)?),
            total_cost: row.get(7)?,
            total_tokens: row.get(8)?,
            cache_read_tokens: row.get(9)?,
            cache_creation_tokens: row.get(10)?,
            active_time_secs: row.get(11)?,
            started_at: parse_timestamp(row.get(12)?),
            last_event_at: parse_timestamp(row.get(13)?),
            exited: row.get::<_, i64>(14)? != 0,
            fast_mode: row.get::<_, i64>(15)? != 0,
            service_version: non_empty(row.get(16)?),
            os_type: non_empty(row.get(17)?),
            os_version: non_empty(row.get(18)?),
            host_arch: non_empty(row.get(19)?),
            metrics: Vec::new(),
            events: Vec::new(),
            previous_values: HashMap::new(),
        })
    })?;

    let mut recovered = 0usize;
    let mut failed = 0usize;

    for row in rows {
        let mut session = match row {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable session row during recovery");
                failed += 1;
                continue;
            }
        };

        match recover_session(conn, &mut session) {
            Ok(()) => {
                store.restore_session(session);
                recovered += 1;
            }
            Err(e) => {
                tracing::warn!(session_id = %session.session_id, error = %e, "failed to fully recover session");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        tracing::warn!(failed, recovered, "recovery completed with per-session failures");
    } else {
        tracing::info!(recovered, "recovery complete");
    }

    Ok(recovered)
}

fn recover_session(conn: &Connection, session: &mut Session) -> rusqlite::Result<()> {
    let mut counter_stmt =
        conn.prepare("SELECT metric_key, value FROM counter_state WHERE session_id = ?1")?;
    let counters = counter_stmt.query_map(params![session.session_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    })?;
    for c in counters {
        let (key, value) = c?;
        session.previous_values.insert(key, value);
    }

    let mut metrics_stmt = conn.prepare(
        "SELECT name, value, timestamp, attributes FROM metrics WHERE session_id = ?1 ORDER BY timestamp ASC",
    )?;
    let metrics = metrics_stmt.query_map(params![session.session_id], |row| {
        Ok(Metric {
            name: row.get(0)?,
            value: row.get(1)?,
            timestamp: parse_timestamp(row.get(2)?).unwrap_or_default(),
            attributes: decode_attrs(row.get(3)?),
        })
    })?;
    for m in metrics {
        session.metrics.push(m?);
    }

    let mut events_stmt = conn.prepare(
        "SELECT name, timestamp, sequence, attributes FROM events WHERE session_id = ?1 ORDER BY sequence ASC",
    )?;
    let events = events_stmt.query_map(params![session.session_id], |row| {
        Ok(Event {
            name: row.get(0)?,
            timestamp: parse_timestamp(row.get(1)?).unwrap_or_default(),
            sequence: row.get(2)?,
            attributes: decode_attrs(row.get(3)?),
        })
    })?;
    for e in events {
        session.events.push(e?);
    }

    Ok(())
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|t| t.with_timezone(&Utc)))
}

fn decode_attrs(value: String) -> Attributes {
    serde_json::from_str(&value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::TempDir;

    fn seed(conn: &Connection, session_id: &str, last_event_at: &str) {
        conn.execute(
            "INSERT INTO sessions (session_id, total_cost, last_event_at) VALUES (?1, 12.5, ?2)",
            params![session_id, last_event_at],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO counter_state (session_id, metric_key, value) VALUES (?1, 'claude_code.cost.usage', 12.5)",
            params![session_id],
        )
        .unwrap();
    }

    #[test]
    fn recovers_sessions_active_in_last_24_hours() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        seed(&conn, "recent", &Utc::now().to_rfc3339());

        let store = MemoryStore::new();
        let recovered = recover(&conn, &store).unwrap();
        assert_eq!(recovered, 1);

        let session = store.get_session("recent").unwrap();
        assert_eq!(session.total_cost, 12.5);
        assert_eq!(
            session.previous_values.get("claude_code.cost.usage"),
            Some(&12.5)
        );
    }

    #[test]
    fn sessions_older_than_24_hours_are_left_on_disk() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        let old = (Utc::now() - chrono::Duration::hours(48)).to_rfc3339();
        seed(&conn, "stale", &old);

        let store = MemoryStore::new();
        let recovered = recover(&conn, &store).unwrap();
        assert_eq!(recovered, 0);
        assert!(store.get_session("stale").is_none());
    }
}
