//! Durable store (component D): composes the in-memory store with schema
//! setup, recovery, the background writer, the maintenance loop, and an
//! optional burn-rate ticker, behind the deterministic open/close sequence.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::db::{maintenance, recovery, schema, writer};
use crate::db::maintenance::{MaintenanceConfig, StatsSnapshotFn};
use crate::db::writer::{WriteOp, WriteQueue};
use crate::error::Result;
use crate::store::{MemoryStore, MetadataUpdate};
use crate::types::{Attributes, Event, Metric, Session};

const BURN_RATE_TICK: Duration = Duration::from_secs(5 * 60);

/// `() -> (hourly_rate, by_model_json)` — registered by the burn-rate
/// estimator (component M).
pub type BurnRateSnapshotFn = Arc<dyn Fn() -> (f64, String) + Send + Sync>;

pub struct DurableStore {
    memory: MemoryStore,
    queue: Mutex<Option<WriteQueue>>,
    writer_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    maintenance_stop: tokio::sync::watch::Sender<()>,
    maintenance_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    burn_rate_stop: Mutex<Option<tokio::sync::watch::Sender<()>>>,
    burn_rate_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stats_snapshot_fn: Mutex<Option<StatsSnapshotFn>>,
    burn_rate_snapshot_fn: Mutex<Option<BurnRateSnapshotFn>>,
    db_path: PathBuf,
    closed: AtomicBool,
}

pub struct DurableStoreConfig {
    pub database_path: PathBuf,
    pub raw_retention_days: i64,
    pub summary_retention_days: i64,
}

impl DurableStore {
    /// Open sequence: open db -> migrate -> recover synchronously -> start
    /// writer -> start maintenance -> (burn-rate ticker starts lazily once
    /// a callback is registered, via `set_burn_rate_snapshot_fn`).
    pub async fn open(config: DurableStoreConfig) -> Result<Arc<Self>> {
        let conn = schema::open(&config.database_path)?;
        let memory = MemoryStore::new();

        let recovered = recovery::recover(&conn, &memory)?;
        tracing::info!(recovered, "durable store opened");

        let (queue, writer_handle) = writer::spawn(conn);

        let (maintenance_stop, maintenance_handle) = maintenance::spawn(
            config.database_path.clone(),
            MaintenanceConfig {
                raw_retention_days: config.raw_retention_days,
                summary_retention_days: config.summary_retention_days,
            },
            None,
        );

        Ok(Arc::new(Self {
            memory,
            queue: Mutex::new(Some(queue)),
            writer_handle: Mutex::new(Some(writer_handle)),
            maintenance_stop,
            maintenance_handle: Mutex::new(Some(maintenance_handle)),
            burn_rate_stop: Mutex::new(None),
            burn_rate_handle: Mutex::new(None),
            stats_snapshot_fn: Mutex::new(None),
            burn_rate_snapshot_fn: Mutex::new(None),
            db_path: config.database_path,
            closed: AtomicBool::new(false),
        }))
    }

    /// No-op once `close()` has taken the queue — matches the spec's
    /// `closed` flag gating `sendWrite`.
    fn enqueue(&self, op: WriteOp) {
        if let Some(queue) = self.queue.lock().unwrap().as_ref() {
            queue.enqueue(op);
        }
    }

    async fn enqueue_blocking(&self, op: WriteOp, timeout: Duration) {
        let queue = self.queue.lock().unwrap().clone();
        if let Some(queue) = queue {
            queue.enqueue_blocking(op, timeout).await;
        }
    }

    fn snapshot_op(&self, session_id: &str) -> Option<WriteOp> {
        self.memory
            .get_session(session_id)
            .map(|session| WriteOp::Snapshot { session: Box::new(session) })
    }

    pub fn add_metric(&self, session_id: &str, metric: Metric) {
        self.memory.add_metric(session_id, metric.clone());
        let key = crate::types::metric_key(&metric.name, &metric.attributes);
        self.enqueue(WriteOp::Metric {
            session_id: session_id.to_string(),
            metric: metric.clone(),
        });
        if let Some(value) = self
            .memory
            .get_session(session_id)
            .and_then(|s| s.previous_values.get(&key).copied())
        {
            self.enqueue(WriteOp::Counter {
                session_id: session_id.to_string(),
                metric_key: key,
                value,
            });
        }
        if let Some(op) = self.snapshot_op(session_id) {
            self.enqueue(op);
        }
    }

    pub fn add_event(&self, session_id: &str, event: Event) {
        self.memory.add_event(session_id, event.clone());
        self.enqueue(WriteOp::Event {
            session_id: session_id.to_string(),
            event,
        });
        if let Some(op) = self.snapshot_op(session_id) {
            self.enqueue(op);
        }
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.memory.get_session(session_id)
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.memory.list_sessions()
    }

    pub fn get_aggregated_cost(&self) -> f64 {
        self.memory.get_aggregated_cost()
    }

    pub fn update_pid(&self, session_id: &str, pid: u32) {
        self.memory.update_pid(session_id, pid);
        self.enqueue(WriteOp::UpdatePid {
            session_id: session_id.to_string(),
            pid,
        });
    }

    pub fn mark_exited(&self, session_id: &str, pid: u32) {
        self.memory.mark_exited(session_id, pid);
        if pid == 0 {
            return;
        }
        self.enqueue(WriteOp::MarkExited {
            session_id: session_id.to_string(),
        });
    }

    pub fn update_metadata(&self, session_id: &str, update: MetadataUpdate) {
        self.memory.update_metadata(session_id, update.clone());
        self.enqueue(WriteOp::UpdateMetadata {
            session_id: session_id.to_string(),
            working_dir: non_empty(update.working_dir),
            service_version: non_empty(update.service_version),
            os_type: non_empty(update.os_type),
            os_version: non_empty(update.os_version),
            host_arch: non_empty(update.host_arch),
        });
    }

    pub fn on_event(&self, listener: crate::store::Listener) {
        self.memory.on_event(listener);
    }

    pub fn write_daily_stats(&self, row: crate::stats::DailyStatsRow) {
        self.enqueue(WriteOp::DailyStats { row: Box::new(row) });
    }

    pub fn write_burn_rate_snapshot(&self, hourly_rate: f64, by_model_json: String) {
        self.enqueue(WriteOp::BurnRateSnapshot {
            timestamp: Utc::now(),
            hourly_rate,
            by_model_json,
        });
    }

    /// The `persist(alert)` contract consumed by the alert engine.
    pub fn persist_alert(&self, rule: &str, message: &str, value: f64, threshold: f64) {
        self.enqueue(WriteOp::AlertHistory {
            rule: rule.to_string(),
            fired_at: Utc::now(),
            message: message.to_string(),
            value,
            threshold,
        });
    }

    pub fn dropped_writes(&self) -> u64 {
        self.queue
            .lock()
            .unwrap()
            .as_ref()
            .map(|q| q.dropped_writes())
            .unwrap_or(0)
    }

    pub fn set_stats_snapshot_fn(&self, f: StatsSnapshotFn) {
        *self.stats_snapshot_fn.lock().unwrap() = Some(f);
    }

    /// Registering a burn-rate callback starts the 5-minute ticker if it
    /// isn't already running.
    pub fn set_burn_rate_snapshot_fn(self: &Arc<Self>, f: BurnRateSnapshotFn) {
        *self.burn_rate_snapshot_fn.lock().unwrap() = Some(f.clone());
        let mut stop_guard = self.burn_rate_stop.lock().unwrap();
        if stop_guard.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(());
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(BURN_RATE_TICK);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Some(f) = this.burn_rate_snapshot_fn.lock().unwrap().clone() {
                            let (rate, by_model) = f();
                            this.write_burn_rate_snapshot(rate, by_model);
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });
        *stop_guard = Some(stop_tx);
        *self.burn_rate_handle.lock().unwrap() = Some(handle);
    }

    /// Close sequence, deterministic and in order — see component D.
    pub async fn close(&self) {
        // 1. stop burn-rate ticker (5s join timeout)
        if let Some(stop) = self.burn_rate_stop.lock().unwrap().take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.burn_rate_handle.lock().unwrap().take() {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                tracing::warn!("burn-rate ticker did not stop within 5s");
            }
        }

        // 2. final burn-rate snapshot, blocking send, 1s timeout
        if let Some(f) = self.burn_rate_snapshot_fn.lock().unwrap().clone() {
            let (rate, by_model) = f();
            self.enqueue_blocking(
                WriteOp::BurnRateSnapshot {
                    timestamp: Utc::now(),
                    hourly_rate: rate,
                    by_model_json: by_model,
                },
                Duration::from_secs(1),
            )
            .await;
        }

        // 3. final daily stats snapshot, blocking send, 1s timeout, dated today
        if let Some(f) = self.stats_snapshot_fn.lock().unwrap().clone() {
            let row = f();
            self.enqueue_blocking(WriteOp::DailyStats { row: Box::new(row) }, Duration::from_secs(1))
                .await;
        }

        // 4. closed flag — subsequent sendWrite calls become no-ops.
        self.closed.store(true, Ordering::SeqCst);
        self.queue.lock().unwrap().take();

        // 5. cancel maintenance, wait (30s timeout)
        let _ = self.maintenance_stop.send(());
        if let Some(handle) = self.maintenance_handle.lock().unwrap().take() {
            if tokio::time::timeout(Duration::from_secs(30), handle).await.is_err() {
                tracing::warn!("maintenance loop did not stop within 30s");
            }
        }

        // 6 & 7. the queue sender was already dropped in step 4, closing
        // the channel; wait for the writer to drain (10s timeout).
        if let Some(handle) = self.writer_handle.lock().unwrap().take() {
            if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
                tracing::warn!("writer did not drain within 10s, data may be lost");
            }
        }

        // 8. final today's rollup: aggregate today's raw metrics/events into
        // daily_summaries directly (writer already stopped, so this fresh
        // connection doesn't race it), ignoring the retention cutoff that
        // would otherwise exclude rows from today.
        if let Ok(conn) = rusqlite::Connection::open(&self.db_path) {
            if let Err(e) = maintenance::aggregate_today_into_daily_summaries(&conn) {
                tracing::warn!(error = %e, "final rollup failed during close");
            }
            // 9. connection drops at end of scope, closing the handle.
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn open_then_add_metric_is_visible_immediately() {
        let dir = TempDir::new().unwrap();
        let store = DurableStore::open(DurableStoreConfig {
            database_path: dir.path().join("db.sqlite"),
            raw_retention_days: 7,
            summary_retention_days: 90,
        })
        .await
        .unwrap();

        store.add_metric(
            "s1",
            Metric {
                name: crate::types::METRIC_COST_USAGE.to_string(),
                value: 1.5,
                attributes: Attributes::new(),
                timestamp: Utc::now(),
            },
        );

        let session = store.get_session("s1").unwrap();
        assert_eq!(session.total_cost, 1.5);

        store.close().await;
    }

    #[tokio::test]
    async fn mark_exited_zero_pid_does_not_queue_a_write() {
        let dir = TempDir::new().unwrap();
        let store = DurableStore::open(DurableStoreConfig {
            database_path: dir.path().join("db.sqlite"),
            raw_retention_days: 7,
            summary_retention_days: 90,
        })
        .await
        .unwrap();

        store.mark_exited("nope", 0);
        assert!(store.get_session("nope").is_none());
        store.close().await;
    }
}
