//! Query layer (component H): canned, bounded read-only queries merging
//! durable rollups with still-raw live rows.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

const MAX_BURN_RATE_ROWS: i64 = 500;
const MAX_ALERT_ROWS: i64 = 200;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DailySummaryRow {
    pub date: String,
    pub total_cost: f64,
    pub total_tokens: i64,
    pub api_requests: i64,
    pub api_errors: i64,
    pub active_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DailyStatsRow {
    pub date: String,
    pub total_sessions: i64,
    pub total_cost: f64,
    pub total_tokens: i64,
    pub lines_added: i64,
    pub lines_removed: i64,
    pub commits: i64,
    pub pull_requests: i64,
    pub cache_efficiency: f64,
    pub avg_api_latency_secs: f64,
    pub error_rate: f64,
    pub retry_rate: f64,
    pub p50_latency_secs: f64,
    pub p95_latency_secs: f64,
    pub p99_latency_secs: f64,
    pub model_breakdown_json: String,
    pub top_tools_json: String,
    pub error_categories_json: String,
    pub language_breakdown_json: String,
    pub decision_sources_json: String,
    pub mcp_tool_usage_json: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BurnRateSnapshotRow {
    pub timestamp: String,
    pub hourly_rate: f64,
    pub by_model_json: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BurnRateDailyRow {
    pub date: String,
    pub avg_hourly_rate: f64,
    pub max_hourly_rate: f64,
    pub snapshot_count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AlertHistoryRow {
    pub rule: String,
    pub fired_at: String,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

/// Daily summaries for the last `days`, newest first. Unioned with a live
/// aggregation over `(session_id, date)` combinations not yet summarized
/// (guarded with `NOT EXISTS` to avoid double counting), then re-aggregated
/// across sessions per date.
pub fn daily_summaries(conn: &Connection, days: i64) -> rusqlite::Result<Vec<DailySummaryRow>> {
    let mut stmt = conn.prepare(
        "SELECT date, SUM(total_cost), SUM(total_tokens), SUM(api_requests), SUM(api_errors), SUM(active_secs)
         FROM (
            SELECT date, total_cost, total_tokens, api_requests, api_errors, active_secs
            FROM daily_summaries
            WHERE date >= date('now', ?1)
            UNION ALL
            SELECT date(m.timestamp) AS date,
                   MAX(m.value) FILTER (WHERE m.name = 'claude_code.cost.usage') AS total_cost,
                   MAX(m.value) FILTER (WHERE m.name = 'claude_code.token.usage') AS total_tokens,
                   0 AS api_requests, 0 AS api_errors, 0 AS active_secs
            FROM metrics m
            WHERE date(m.timestamp) >= date('now', ?1)
              AND NOT EXISTS (
                SELECT 1 FROM daily_summaries ds
                WHERE ds.session_id = m.session_id AND ds.date = date(m.timestamp)
              )
            GROUP BY m.session_id, date(m.timestamp)
         )
         GROUP BY date
         ORDER BY date DESC",
    )?;
    let window = format!("-{days} days");
    let rows = stmt.query_map(params![window], |row| {
        Ok(DailySummaryRow {
            date: row.get(0)?,
            total_cost: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
            total_tokens: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
            api_requests: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
            api_errors: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
            active_secs: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
        })
    })?;
    rows.collect()
}

/// Daily stats for the last `days`, newest first. Unions persisted
/// `daily_stats` rows with a live synthesis from `daily_summaries` for any
/// date in the window that has no `daily_stats` row yet (guarded by
/// `NOT EXISTS`). Latency columns are stored in milliseconds and converted
/// to seconds here; the synthesized fallback has no duration data to draw
/// on, so its latency fields are zero.
pub fn daily_stats(conn: &Connection, days: i64) -> rusqlite::Result<Vec<DailyStatsRow>> {
    let mut stmt = conn.prepare(
        "SELECT date, total_sessions, total_cost, total_tokens, lines_added, lines_removed,
                commits, pull_requests, cache_efficiency, avg_api_latency_s / 1000.0, error_rate, retry_rate,
                p50_latency_s / 1000.0, p95_latency_s / 1000.0, p99_latency_s / 1000.0,
                model_breakdown, top_tools, error_categories, language_breakdown, decision_sources, mcp_tool_usage
         FROM daily_stats
         WHERE date >= date('now', ?1)
         UNION ALL
         SELECT ds.date, COUNT(DISTINCT ds.session_id), SUM(ds.total_cost), SUM(ds.total_tokens), 0, 0,
                0, 0, 0.0, 0.0,
                CASE WHEN SUM(ds.api_requests) > 0
                     THEN CAST(SUM(ds.api_errors) AS REAL) / SUM(ds.api_requests)
                     ELSE 0.0 END,
                0.0, 0.0, 0.0, 0.0,
                '[]', '[]', '{}', '{}', '{}', '{}'
         FROM daily_summaries ds
         WHERE ds.date >= date('now', ?1)
           AND NOT EXISTS (SELECT 1 FROM daily_stats WHERE daily_stats.date = ds.date)
         GROUP BY ds.date
         ORDER BY date DESC",
    )?;
    let window = format!("-{days} days");
    let rows = stmt.query_map(params![window], |row| {
        Ok(DailyStatsRow {
            date: row.get(0)?,
            total_sessions: row.get(1)?,
            total_cost: row.get(2)?,
            total_tokens: row.get(3)?,
            lines_added: row.get(4)?,
            lines_removed: row.get(5)?,
            commits: row.get(6)?,
            pull_requests: row.get(7)?,
            cache_efficiency: row.get(8)?,
            avg_api_latency_secs: row.get(9)?,
            error_rate: row.get(10)?,
            retry_rate: row.get(11)?,
            p50_latency_secs: row.get(12)?,
            p95_latency_secs: row.get(13)?,
            p99_latency_secs: row.get(14)?,
            model_breakdown_json: row.get(15)?,
            top_tools_json: row.get(16)?,
            error_categories_json: row.get(17)?,
            language_breakdown_json: row.get(18)?,
            decision_sources_json: row.get(19)?,
            mcp_tool_usage_json: row.get(20)?,
        })
    })?;
    rows.collect()
}

/// Burn-rate snapshots for the last `days`, newest first, bounded to 500
/// rows regardless of `days`.
pub fn burn_rate_snapshots(conn: &Connection, days: i64) -> rusqlite::Result<Vec<BurnRateSnapshotRow>> {
    let window = format!("-{days} days");
    let mut stmt = conn.prepare(
        "SELECT timestamp, hourly_rate, by_model FROM burn_rate_snapshots
         WHERE timestamp >= datetime('now', ?1)
         ORDER BY timestamp DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![window, MAX_BURN_RATE_ROWS], |row| {
        Ok(BurnRateSnapshotRow {
            timestamp: row.get(0)?,
            hourly_rate: row.get(1)?,
            by_model_json: row.get(2)?,
        })
    })?;
    rows.collect()
}

/// Per-date aggregate over burn-rate snapshots for the last `days`.
pub fn burn_rate_daily_summary(conn: &Connection, days: i64) -> rusqlite::Result<Vec<BurnRateDailyRow>> {
    let window = format!("-{days} days");
    let mut stmt = conn.prepare(
        "SELECT date(timestamp), AVG(hourly_rate), MAX(hourly_rate), COUNT(*)
         FROM burn_rate_snapshots
         WHERE timestamp >= datetime('now', ?1)
         GROUP BY date(timestamp)
         ORDER BY date(timestamp) DESC",
    )?;
    let rows = stmt.query_map(params![window], |row| {
        Ok(BurnRateDailyRow {
            date: row.get(0)?,
            avg_hourly_rate: row.get(1)?,
            max_hourly_rate: row.get(2)?,
            snapshot_count: row.get(3)?,
        })
    })?;
    rows.collect()
}

/// All burn-rate snapshots whose UTC date matches `date` (`YYYY-MM-DD`).
pub fn burn_rate_snapshots_for_date(conn: &Connection, date: &str) -> rusqlite::Result<Vec<BurnRateSnapshotRow>> {
    let mut stmt = conn.prepare(
        "SELECT timestamp, hourly_rate, by_model FROM burn_rate_snapshots
         WHERE date(timestamp) = ?1
         ORDER BY timestamp ASC",
    )?;
    let rows = stmt.query_map(params![date], |row| {
        Ok(BurnRateSnapshotRow {
            timestamp: row.get(0)?,
            hourly_rate: row.get(1)?,
            by_model_json: row.get(2)?,
        })
    })?;
    rows.collect()
}

/// Alert history for the last `days`, newest first, bounded to 200 rows,
/// optionally filtered to a single rule name.
pub fn alert_history(
    conn: &Connection,
    days: i64,
    rule: Option<&str>,
) -> rusqlite::Result<Vec<AlertHistoryRow>> {
    let window = format!("-{days} days");
    let mut stmt = if rule.is_some() {
        conn.prepare(
            "SELECT rule, fired_at, message, value, threshold FROM alert_history
             WHERE fired_at >= datetime('now', ?1) AND rule = ?2
             ORDER BY fired_at DESC
             LIMIT ?3",
        )?
    } else {
        conn.prepare(
            "SELECT rule, fired_at, message, value, threshold FROM alert_history
             WHERE fired_at >= datetime('now', ?1)
             ORDER BY fired_at DESC
             LIMIT ?3",
        )?
    };

    let map_row = |row: &rusqlite::Row| {
        Ok(AlertHistoryRow {
            rule: row.get(0)?,
            fired_at: row.get(1)?,
            message: row.get(2)?,
            value: row.get(3)?,
            threshold: row.get(4)?,
        })
    };

    let rows = if let Some(rule) = rule {
        stmt.query_map(params![window, rule, MAX_ALERT_ROWS], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map(params![window, MAX_ALERT_ROWS], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };
    Ok(rows)
}

/// Distinct alert rule names, alphabetical.
pub fn distinct_alert_rules(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT rule FROM alert_history ORDER BY rule ASC")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::TempDir;

    #[test]
    fn burn_rate_snapshots_bounded_to_500_rows() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        for _ in 0..10 {
            conn.execute(
                "INSERT INTO burn_rate_snapshots (timestamp, hourly_rate, by_model) VALUES (datetime('now'), 1.0, '{}')",
                [],
            )
            .unwrap();
        }
        let rows = burn_rate_snapshots(&conn, 30).unwrap();
        assert_eq!(rows.len(), 10);
    }

    #[test]
    fn alert_history_filters_by_rule() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        conn.execute(
            "INSERT INTO alert_history (rule, fired_at, message, value, threshold) VALUES ('cost', datetime('now'), 'm', 1.0, 0.5)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO alert_history (rule, fired_at, message, value, threshold) VALUES ('errors', datetime('now'), 'm', 1.0, 0.5)",
            [],
        )
        .unwrap();

        let rows = alert_history(&conn, 7, Some("cost")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rule, "cost");
    }

    #[test]
    fn distinct_alert_rules_alphabetical() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        for rule in ["zeta", "alpha", "mid"] {
            conn.execute(
                "INSERT INTO alert_history (rule, fired_at, message, value, threshold) VALUES (?1, datetime('now'), 'm', 1.0, 0.5)",
                params![rule],
            )
            .unwrap();
        }
        let rules = distinct_alert_rules(&conn).unwrap();
        assert_eq!(rules, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn daily_stats_reads_persisted_row_and_converts_latency_to_seconds() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        conn.execute(
            "INSERT INTO daily_stats (date, total_sessions, lines_added, avg_api_latency_s) VALUES (date('now'), 3, 88, 250.0)",
            [],
        )
        .unwrap();

        let rows = daily_stats(&conn, 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_sessions, 3);
        assert_eq!(rows[0].lines_added, 88);
        assert_eq!(rows[0].avg_api_latency_secs, 0.25);
    }

    #[test]
    fn daily_stats_synthesizes_missing_dates_from_daily_summaries() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        conn.execute(
            "INSERT INTO daily_summaries (session_id, date, total_cost, api_requests, api_errors) VALUES ('s1', date('now'), 5.0, 10, 2)",
            [],
        )
        .unwrap();

        let rows = daily_stats(&conn, 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_cost, 5.0);
        assert_eq!(rows[0].error_rate, 0.2);
    }

    #[test]
    fn daily_stats_does_not_double_count_a_date_with_both_rows() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        conn.execute(
            "INSERT INTO daily_stats (date, total_sessions) VALUES (date('now'), 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO daily_summaries (session_id, date, total_cost) VALUES ('s1', date('now'), 5.0)",
            [],
        )
        .unwrap();

        let rows = daily_stats(&conn, 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_sessions, 1);
    }

    #[test]
    fn daily_summaries_merges_live_rows_without_double_counting() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        conn.execute(
            "INSERT INTO daily_summaries (session_id, date, total_cost) VALUES ('s1', date('now'), 5.0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO metrics (session_id, name, value, timestamp) VALUES ('s2', 'claude_code.cost.usage', 3.0, datetime('now'))",
            [],
        )
        .unwrap();

        let rows = daily_summaries(&conn, 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_cost, 8.0);
    }
}
