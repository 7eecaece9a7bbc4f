//! The bounded write queue and its single background writer (component D
//! write path). Grounded on the teacher's `usage_tracker.rs` batching
//! loop (`tokio::select!` between `rx.recv()` and an interval tick), widened
//! from an unbounded fire-and-forget channel to a bounded, drop-counted one
//! since durability here is load-bearing rather than best-effort analytics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::mpsc;

use crate::stats::DailyStatsRow;
use crate::types::{Attributes, Event, Metric, Session};

const QUEUE_CAPACITY: usize = 1000;
const FLUSH_BATCH_SIZE: usize = 50;
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// One unit of durable work, applied to sqlite inside a batched
/// transaction. Mirrors every mutating public `DurableStore` operation.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Metric {
        session_id: String,
        metric: Metric,
    },
    Event {
        session_id: String,
        event: Event,
    },
    Counter {
        session_id: String,
        metric_key: String,
        value: f64,
    },
    Snapshot {
        session: Box<Session>,
    },
    UpdatePid {
        session_id: String,
        pid: u32,
    },
    UpdateMetadata {
        session_id: String,
        working_dir: Option<String>,
        service_version: Option<String>,
        os_type: Option<String>,
        os_version: Option<String>,
        host_arch: Option<String>,
    },
    MarkExited {
        session_id: String,
    },
    DailyStats {
        row: Box<DailyStatsRow>,
    },
    BurnRateSnapshot {
        timestamp: DateTime<Utc>,
        hourly_rate: f64,
        by_model_json: String,
    },
    AlertHistory {
        rule: String,
        fired_at: DateTime<Utc>,
        message: String,
        value: f64,
        threshold: f64,
    },
}

/// Handle shared by every caller that needs to enqueue write ops. Cloning
/// is cheap (just an `mpsc::Sender` and an `Arc<AtomicU64>`).
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<WriteOp>,
    dropped: Arc<AtomicU64>,
}

impl WriteQueue {
    /// Enqueue an op without blocking. A full queue drops the op, bumps the
    /// drop counter, and logs a warning — it never waits.
    pub fn enqueue(&self, op: WriteOp) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(op) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("write queue full, dropping op");
        }
    }

    /// Blocking send with a timeout, used only for the handful of
    /// shutdown-time final writes that must not be silently dropped.
    pub async fn enqueue_blocking(&self, op: WriteOp, timeout: Duration) {
        if tokio::time::timeout(timeout, self.tx.send(op)).await.is_err() {
            tracing::warn!("timed out enqueueing final write during shutdown");
        }
    }

    pub fn dropped_writes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Spawn the writer task and return the queue handle plus its `JoinHandle`.
pub fn spawn(conn: Connection) -> (WriteQueue, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let dropped = Arc::new(AtomicU64::new(0));
    let queue = WriteQueue {
        tx,
        dropped: dropped.clone(),
    };
    let handle = tokio::spawn(run(conn, rx));
    (queue, handle)
}

async fn run(conn: Connection, mut rx: mpsc::Receiver<WriteOp>) {
    let mut batch = Vec::with_capacity(FLUSH_BATCH_SIZE);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_op = rx.recv() => {
                match maybe_op {
                    Some(op) => {
                        batch.push(op);
                        if batch.len() >= FLUSH_BATCH_SIZE {
                            flush(&conn, std::mem::take(&mut batch));
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            flush(&conn, std::mem::take(&mut batch));
                        }
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                if !batch.is_empty() {
                    flush(&conn, std::mem::take(&mut batch));
                }
            }
        }
    }
}

fn flush(conn: &Connection, ops: Vec<WriteOp>) {
    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(e) => {
            tracing::error!(error = %e, "failed to open write transaction, dropping batch");
            return;
        }
    };

    for op in ops {
        if let Err(e) = apply(&tx, &op) {
            tracing::warn!(error = %e, "write op failed, continuing batch");
        }
    }

    if let Err(e) = tx.commit() {
        tracing::error!(error = %e, "batch commit failed, dropping batch");
    }
}

fn attrs_json(attrs: &Attributes) -> String {
    serde_json::to_string(attrs).unwrap_or_else(|_| "{}".to_string())
}

fn apply(tx: &rusqlite::Transaction<'_>, op: &WriteOp) -> rusqlite::Result<()> {
    match op {
        WriteOp::Metric { session_id, metric } => {
            tx.execute(
                "INSERT INTO metrics (session_id, name, value, timestamp, attributes) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session_id,
                    metric.name,
                    metric.value,
                    metric.timestamp.to_rfc3339(),
                    attrs_json(&metric.attributes)
                ],
            )?;
            tx.execute(
                "UPDATE sessions SET last_event_at = ?1 WHERE session_id = ?2",
                params![metric.timestamp.to_rfc3339(), session_id],
            )?;
            Ok(())
        }
        WriteOp::Event { session_id, event } => {
            tx.execute(
                "INSERT INTO events (session_id, name, timestamp, sequence, attributes) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session_id,
                    event.name,
                    event.timestamp.to_rfc3339(),
                    event.sequence,
                    attrs_json(&event.attributes)
                ],
            )?;
            tx.execute(
                "UPDATE sessions SET last_event_at = ?1 WHERE session_id = ?2",
                params![event.timestamp.to_rfc3339(), session_id],
            )?;
            Ok(())
        }
        WriteOp::Counter {
            session_id,
            metric_key,
            value,
        } => tx.execute(
            "INSERT INTO counter_state (session_id, metric_key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id, metric_key) DO UPDATE SET value = excluded.value",
            params![session_id, metric_key, value],
        )
        .map(|_| ()),
        WriteOp::Snapshot { session } => {
            tx.execute(
                "INSERT INTO sessions (
                    session_id, pid, terminal, working_dir, model, organization_id, user_account_uuid,
                    total_cost, total_tokens, cache_read_tokens, cache_creation_tokens, active_time_secs,
                    started_at, last_event_at, exited, fast_mode,
                    service_version, os_type, os_version, host_arch
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)
                 ON CONFLICT(session_id) DO UPDATE SET
                    pid = excluded.pid,
                    terminal = COALESCE(NULLIF(excluded.terminal, ''), terminal),
                    working_dir = COALESCE(NULLIF(excluded.working_dir, ''), working_dir),
                    model = COALESCE(NULLIF(excluded.model, ''), model),
                    organization_id = COALESCE(NULLIF(excluded.organization_id, ''), organization_id),
                    user_account_uuid = COALESCE(NULLIF(excluded.user_account_uuid, ''), user_account_uuid),
                    total_cost = excluded.total_cost,
                    total_tokens = excluded.total_tokens,
                    cache_read_tokens = excluded.cache_read_tokens,
                    cache_creation_tokens = excluded.cache_creation_tokens,
                    active_time_secs = excluded.active_time_secs,
                    started_at = COALESCE(started_at, excluded.started_at),
                    last_event_at = excluded.last_event_at,
                    exited = excluded.exited,
                    fast_mode = excluded.fast_mode,
                    service_version = COALESCE(NULLIF(excluded.service_version, ''), service_version),
                    os_type = COALESCE(NULLIF(excluded.os_type, ''), os_type),
                    os_version = COALESCE(NULLIF(excluded.os_version, ''), os_version),
                    host_arch = COALESCE(NULLIF(excluded.host_arch, ''), host_arch)
                ",
                params![
                    session.session_id,
                    session.pid,
                    session.terminal.clone().unwrap_or_default(),
                    session.working_dir.clone().unwrap_or_default(),
                    session.model.clone().unwrap_or_default(),
                    session.organization_id.clone().unwrap_or_default(),
                    session.user_account_uuid.clone().unwrap_or_default(),
                    session.total_cost,
                    session.total_tokens,
                    session.cache_read_tokens,
                    session.cache_creation_tokens,
                    session.active_time_secs,
                    session.started_at.map(|t| t.to_rfc3339()),
                    session.last_event_at.map(|t| t.to_rfc3339()),
                    session.exited as i64,
                    session.fast_mode as i64,
                    session.service_version.clone().unwrap_or_default(),
                    session.os_type.clone().unwrap_or_default(),
                    session.os_version.clone().unwrap_or_default(),
                    session.host_arch.clone().unwrap_or_default(),
                ],
            )
            .map(|_| ())
        }
        WriteOp::UpdatePid { session_id, pid } => {
            tx.execute(
                "INSERT INTO sessions (session_id, pid) VALUES (?1, ?2)
                 ON CONFLICT(session_id) DO UPDATE SET pid = excluded.pid",
                params![session_id, pid],
            )
            .map(|_| ())
        }
        WriteOp::UpdateMetadata {
            session_id,
            working_dir,
            service_version,
            os_type,
            os_version,
            host_arch,
        } => {
            tx.execute(
                "INSERT INTO sessions (session_id, working_dir, service_version, os_type, os_version, host_arch)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(session_id) DO UPDATE SET
                    working_dir = COALESCE(NULLIF(excluded.working_dir, ''), working_dir),
                    service_version = COALESCE(NULLIF(excluded.service_version, ''), service_version),
                    os_type = COALESCE(NULLIF(excluded.os_type, ''), os_type),
                    os_version = COALESCE(NULLIF(excluded.os_version, ''), os_version),
                    host_arch = COALESCE(NULLIF(excluded.host_arch, ''), host_arch)
                ",
                params![
                    session_id,
                    working_dir.clone().unwrap_or_default(),
                    service_version.clone().unwrap_or_default(),
                    os_type.clone().unwrap_or_default(),
                    os_version.clone().unwrap_or_default(),
                    host_arch.clone().unwrap_or_default(),
                ],
            )
            .map(|_| ())
        }
        WriteOp::MarkExited { session_id } => tx
            .execute(
                "INSERT INTO sessions (session_id, exited) VALUES (?1, 1)
                 ON CONFLICT(session_id) DO UPDATE SET exited = 1",
                params![session_id],
            )
            .map(|_| ()),
        WriteOp::DailyStats { row } => tx
            .execute(
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
                params![
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
            .map(|_| ()),
        WriteOp::BurnRateSnapshot {
            timestamp,
            hourly_rate,
            by_model_json,
        } => tx
            .execute(
                "INSERT INTO burn_rate_snapshots (timestamp, hourly_rate, by_model) VALUES (?1, ?2, ?3)",
                params![timestamp.to_rfc3339(), hourly_rate, by_model_json],
            )
            .map(|_| ()),
        WriteOp::AlertHistory {
            rule,
            fired_at,
            message,
            value,
            threshold,
        } => tx
            .execute(
                "INSERT INTO alert_history (rule, fired_at, message, value, threshold) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![rule, fired_at.to_rfc3339(), message, value, threshold],
            )
            .map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::TempDir;

    #[tokio::test]
    async fn flush_triggers_on_interval_even_under_batch_size() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        let (queue, _handle) = spawn(conn);

        queue.enqueue(WriteOp::UpdatePid {
            session_id: "s1".to_string(),
            pid: 42,
        });

        tokio::time::sleep(Duration::from_millis(250)).await;

        let conn2 = Connection::open(dir.path().join("db.sqlite")).unwrap();
        let pid: Option<i64> = conn2
            .query_row("SELECT pid FROM sessions WHERE session_id = 's1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pid, Some(42));
    }

    #[tokio::test]
    async fn daily_stats_writes_primitive_columns_not_just_model_breakdown() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        let (queue, _handle) = spawn(conn);

        queue.enqueue(WriteOp::DailyStats {
            row: Box::new(DailyStatsRow {
                date: "2026-07-28".to_string(),
                total_sessions: 2,
                lines_added: 88,
                ..Default::default()
            }),
        });

        tokio::time::sleep(Duration::from_millis(250)).await;

        let conn2 = Connection::open(dir.path().join("db.sqlite")).unwrap();
        let (sessions, lines): (i64, i64) = conn2
            .query_row(
                "SELECT total_sessions, lines_added FROM daily_stats WHERE date = '2026-07-28'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(sessions, 2);
        assert_eq!(lines, 88);
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let dir = TempDir::new().unwrap();
        let conn = schema::open(&dir.path().join("db.sqlite")).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let dropped = Arc::new(AtomicU64::new(0));
        let queue = WriteQueue { tx, dropped: dropped.clone() };
        drop(conn);

        for _ in 0..5 {
            queue.enqueue(WriteOp::MarkExited { session_id: "s1".to_string() });
        }
        assert!(queue.dropped_writes() >= 1);
    }
}
