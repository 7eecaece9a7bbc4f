//! The maintenance loop (component F): hourly aggregation into
//! `daily_summaries`, retention pruning, periodic file compaction.
//! Grounded on the teacher's `retention_enforcer.rs` interval-loop shape.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::watch;

use crate::stats::DailyStatsRow;

const TICK_INTERVAL: Duration = Duration::from_secs(3600);
const COMPACT_EVERY: u32 = 7 * 24;

pub type StatsSnapshotFn = Arc<dyn Fn() -> DailyStatsRow + Send + Sync>;

pub struct MaintenanceConfig {
    pub raw_retention_days: i64,
    pub summary_retention_days: i64,
}

/// Spawn the maintenance task against its own connection to `db_path`
/// (sqlite's WAL mode allows this alongside the writer's connection).
/// Returns a `watch::Sender<()>` used as the cancellation signal and the
/// task's `JoinHandle`.
pub fn spawn(
    db_path: PathBuf,
    config: MaintenanceConfig,
    stats_snapshot_fn: Option<StatsSnapshotFn>,
) -> (watch::Sender<()>, tokio::task::JoinHandle<()>) {
    let (stop_tx, mut stop_rx) = watch::channel(());
    let handle = tokio::spawn(async move {
        let conn = match Connection::open(&db_path) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(error = %e, "maintenance: failed to open its own connection, loop will not run");
                return;
            }
        };
        let _ = conn.execute_batch("PRAGMA busy_timeout=5000;");

        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.tick().await; // first tick fires immediately; skip it
        let mut cycles: u32 = 0;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    cycles += 1;
                    run_cycle(&conn, &config, stats_snapshot_fn.as_ref(), cycles).await;
                }
                _ = stop_rx.changed() => {
                    tracing::info!("maintenance loop stopping");
                    break;
                }
            }
        }
    });
    (stop_tx, handle)
}

async fn run_cycle(
    conn: &Connection,
    config: &MaintenanceConfig,
    stats_snapshot_fn: Option<&StatsSnapshotFn>,
    cycles: u32,
) {

    if let Some(snapshot_fn) = stats_snapshot_fn {
        let row = snapshot_fn();
        if let Err(e) = upsert_daily_stats(&conn, &row) {
            tracing::warn!(error = %e, "maintenance: failed to write daily stats snapshot");
        }
    }

    if let Err(e) = aggregate_into_daily_summaries(&conn, config.raw_retention_days) {
        tracing::warn!(error = %e, "maintenance: failed to aggregate daily summaries");
    }
    if let Err(e) = prune_raw_tables(&conn, config.raw_retention_days) {
        tracing::warn!(error = %e, "maintenance: failed to prune raw tables");
    }
    if let Err(e) = prune_rollup_tables(&conn, config.summary_retention_days) {
        tracing::warn!(error = %e, "maintenance: failed to prune rollup tables");
    }
    if let Err(e) = prune_burn_rate(&conn, config.raw_retention_days) {
        tracing::warn!(error = %e, "maintenance: failed to prune burn rate snapshots");
    }

    if cycles % COMPACT_EVERY == 0 {
        if let Err(e) = conn.execute_batch("VACUUM;") {
            tracing::warn!(error = %e, "maintenance: vacuum failed");
        } else {
            tracing::info!("maintenance: ran periodic compaction");
        }
    }
}

pub(crate) fn upsert_daily_stats(conn: &Connection, row: &DailyStatsRow) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO daily_stats (
            date, total_sessions, total_cost, total_tokens, lines_added, lines_removed,
            commits, pull_requests, cache_efficiency, avg_api_latency_s, error_rate, retry_rate,
            p50_latency_s, p95_latency_s, p99_latency_s, model_breakdown, top_tools,
            error_categories, language_breakdown, decision_sources, mcp_tool_usage
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)
         ON CONFLICT(date) DO UPDATE SET
            total_sessions = excluded.total_sessions,
            total_cost = excluded.total_cost,
            total_tokens = excluded.total_tokens,
            lines_added = excluded.lines_added,
            lines_removed = excluded.lines_removed,
            commits = excluded.commits,
            pull_requests = excluded.pull_requests,
            cache_efficiency = excluded.cache_efficiency,
            avg_api_latency_s = excluded.avg_api_latency_s,
            error_rate = excluded.error_rate,
            retry_rate = excluded.retry_rate,
            p50_latency_s = excluded.p50_latency_s,
            p95_latency_s = excluded.p95_latency_s,
            p99_latency_s = excluded.p99_latency_s,
            model_breakdown = excluded.model_breakdown,
            top_tools = excluded.top_tools,
            error_categories = excluded.error_categories,
            language_breakdown = excluded.language_breakdown,
            decision_sources = excluded.decision_sources,
            mcp_tool_usage = excluded.mcp_tool_usage",
        rusqlite::params![
            row.date,
            row.total_sessions,
            row.total_cost,
            row.total_tokens,
            row.lines_added,
            row.lines_removed,
            row.commits,
            row.pull_requests,
            row.cache_efficiency,
            row.avg_api_latency_ms,
            row.error_rate,
            row.retry_rate,
            row.p50_latency_ms,
            row.p95_latency_ms,
            row.p99_latency_ms,
            row.model_breakdown_json,
            row.top_tools_json,
            row.error_categories_json,
            row.language_breakdown_json,
            row.decision_sources_json,
            row.mcp_tool_usage_json,
        ],
    )
    .map(|_| ())
}

/// Per `(session_id, date)`: MAX of cumulative metrics (monotonically
/// increasing, so the newest raw row already holds the final value), plus
/// counts of api_request / error-attributed events, for raw rows matching
/// `metrics_clause`/`events_clause`.
fn aggregate_matching(conn: &Connection, metrics_clause: &str, events_clause: &str) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO daily_summaries (session_id, date, total_cost, total_tokens, active_secs)
             SELECT session_id, date(timestamp),
                    MAX(CASE WHEN name = 'claude_code.cost.usage' THEN value ELSE 0 END),
                    MAX(CASE WHEN name = 'claude_code.token.usage' THEN value ELSE 0 END),
                    MAX(CASE WHEN name = 'claude_code.active_time.total' THEN value ELSE 0 END)
             FROM metrics
             WHERE {metrics_clause}
             GROUP BY session_id, date(timestamp)
             ON CONFLICT(session_id, date) DO UPDATE SET
                total_cost = MAX(total_cost, excluded.total_cost),
                total_tokens = MAX(total_tokens, excluded.total_tokens),
                active_secs = MAX(active_secs, excluded.active_secs)"
        ),
        [],
    )?;

    conn.execute(
        &format!(
            "INSERT INTO daily_summaries (session_id, date, api_requests)
             SELECT session_id, date(timestamp), COUNT(*)
             FROM events
             WHERE name = 'claude_code.api_request' AND {events_clause}
             GROUP BY session_id, date(timestamp)
             ON CONFLICT(session_id, date) DO UPDATE SET api_requests = excluded.api_requests"
        ),
        [],
    )?;

    conn.execute(
        &format!(
            "INSERT INTO daily_summaries (session_id, date, api_errors)
             SELECT session_id, date(timestamp), COUNT(*)
             FROM events
             WHERE name = 'claude_code.api_error' AND {events_clause}
               AND (attributes LIKE '%error%' OR attributes LIKE '%\"status\":\"error\"%')
             GROUP BY session_id, date(timestamp)
             ON CONFLICT(session_id, date) DO UPDATE SET api_errors = excluded.api_errors"
        ),
        [],
    )?;

    Ok(())
}

/// Rows older than the raw retention window — the normal hourly path.
fn aggregate_into_daily_summaries(conn: &Connection, raw_retention_days: i64) -> rusqlite::Result<()> {
    let cutoff = format!("timestamp < datetime('now', '-{raw_retention_days} days')");
    aggregate_matching(conn, &cutoff, &cutoff)
}

/// Synthesizes today's rollup unconditionally, ignoring the retention
/// cutoff — used at shutdown so the current day gets a `daily_summaries`
/// row even though its raw rows haven't aged out yet.
pub(crate) fn aggregate_today_into_daily_summaries(conn: &Connection) -> rusqlite::Result<()> {
    let today = "date(timestamp) = date('now')";
    aggregate_matching(conn, today, today)
}

fn prune_raw_tables(conn: &Connection, raw_retention_days: i64) -> rusqlite::Result<()> {
    conn.execute(
        &format!("DELETE FROM metrics WHERE timestamp < datetime('now', '-{raw_retention_days} days')"),
        [],
    )?;
    conn.execute(
        &format!("DELETE FROM events WHERE timestamp < datetime('now', '-{raw_retention_days} days')"),
        [],
    )?;
    Ok(())
}

fn prune_rollup_tables(conn: &Connection, summary_retention_days: i64) -> rusqlite::Result<()> {
    conn.execute(
        &format!("DELETE FROM daily_summaries WHERE date < date('now', '-{summary_retention_days} days')"),
        [],
    )?;
    conn.execute(
        &format!("DELETE FROM daily_stats WHERE date < date('now', '-{summary_retention_days} days')"),
        [],
    )?;
    conn.execute(
        &format!("DELETE FROM alert_history WHERE fired_at < datetime('now', '-{summary_retention_days} days')"),
        [],
    )?;
    Ok(())
}

fn prune_burn_rate(conn: &Connection, raw_retention_days: i64) -> rusqlite::Result<()> {
    conn.execute(
        &format!("DELETE FROM burn_rate_snapshots WHERE timestamp < datetime('now', '-{raw_retention_days} days')"),
        [],
    )
    .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::TempDir;

    #[test]
    fn prune_raw_tables_removes_old_rows_only() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        conn.execute(
            "INSERT INTO metrics (session_id, name, value, timestamp) VALUES ('s', 'm', 1, datetime('now', '-10 days'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO metrics (session_id, name, value, timestamp) VALUES ('s', 'm', 1, datetime('now'))",
            [],
        )
        .unwrap();

        prune_raw_tables(&conn, 7).unwrap();

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM metrics", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn aggregate_today_ignores_retention_cutoff() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        conn.execute(
            "INSERT INTO metrics (session_id, name, value, timestamp) VALUES ('s', 'claude_code.cost.usage', 5.0, datetime('now'))",
            [],
        )
        .unwrap();

        aggregate_today_into_daily_summaries(&conn).unwrap();

        let total_cost: f64 = conn
            .query_row("SELECT total_cost FROM daily_summaries WHERE session_id = 's'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(total_cost, 5.0);
    }

    #[test]
    fn upsert_daily_stats_writes_individual_columns() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        let row = DailyStatsRow {
            date: "2026-07-28".to_string(),
            total_sessions: 3,
            total_cost: 12.5,
            lines_added: 88,
            avg_api_latency_ms: 250.0,
            ..Default::default()
        };
        upsert_daily_stats(&conn, &row).unwrap();

        let (sessions, cost, lines, latency): (i64, f64, i64, f64) = conn
            .query_row(
                "SELECT total_sessions, total_cost, lines_added, avg_api_latency_s FROM daily_stats WHERE date = '2026-07-28'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!(sessions, 3);
        assert_eq!(cost, 12.5);
        assert_eq!(lines, 88);
        assert_eq!(latency, 250.0);
    }

    #[test]
    fn aggregate_picks_max_not_sum_for_cumulative_metrics() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        for value in [10.0, 25.0] {
            conn.execute(
                "INSERT INTO metrics (session_id, name, value, timestamp) VALUES ('s', 'claude_code.cost.usage', ?1, datetime('now', '-10 days'))",
                rusqlite::params![value],
            )
            .unwrap();
        }

        aggregate_into_daily_summaries(&conn, 7).unwrap();

        let total_cost: f64 = conn
            .query_row("SELECT total_cost FROM daily_summaries WHERE session_id = 's'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(total_cost, 25.0);
    }
}
