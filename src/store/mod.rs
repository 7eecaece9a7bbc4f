//! The in-memory session store — the authoritative live view (component B).
//!
//! One `RwLock` guards the whole session map: readers (GetSession,
//! ListSessions, stats snapshots) take a read lock, the handful of mutating
//! operations take a write lock just long enough to update the map, then
//! release it before fanning out to listeners. See `DESIGN.md` for why
//! listener dispatch must happen outside the lock.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::types::{
    Attributes, Event, Metric, Session, UNKNOWN_SESSION, metric_key, EVENT_API_REQUEST,
    METRIC_ACTIVE_TIME_TOTAL, METRIC_COST_USAGE, METRIC_SESSION_COUNT, METRIC_TOKEN_USAGE,
};

/// A post-commit event listener. Invoked synchronously, outside the store
/// lock, after every successful `add_event`. Must not take write paths back
/// into the store — see the concurrency note in `DESIGN.md`.
pub type Listener = Arc<dyn Fn(&str, &Event) + Send + Sync>;

/// Platform/identity fields updated out-of-band from metric/event ingestion
/// (e.g. from process supervision). Empty-string fields are no-ops.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    pub working_dir: String,
    pub service_version: String,
    pub os_type: String,
    pub os_version: String,
    pub host_arch: String,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    listeners: RwLock<Vec<Listener>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Route a metric into its session, tracking cumulative-counter deltas
    /// and the derived fields every metric can carry.
    pub fn add_metric(&self, session_id: &str, metric: Metric) {
        let session_id = normalize_session_id(session_id);
        let now = Utc::now();
        let mut inner = self.inner.write().unwrap();
        let is_new = !inner.sessions.contains_key(&session_id);
        let session = inner
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Session::new(session_id.clone()));

        if metric.name == METRIC_SESSION_COUNT && is_new {
            session.started_at = Some(effective_timestamp(metric.timestamp, now));
        }

        let key = metric_key(&metric.name, &metric.attributes);
        let delta = match session.previous_values.get(&key).copied() {
            None => metric.value,
            Some(previous) => {
                let delta = metric.value - previous;
                if delta < 0.0 { metric.value } else { delta }
            }
        };
        session.previous_values.insert(key, metric.value);

        match metric.name.as_str() {
            METRIC_COST_USAGE => session.total_cost += delta,
            METRIC_TOKEN_USAGE => session.total_tokens += delta as i64,
            METRIC_ACTIVE_TIME_TOTAL => session.active_time_secs += delta,
            _ => {}
        }

        apply_identity_fields(session, &metric.attributes);
        if let Some(speed) = metric.attributes.get("speed") {
            if !speed.is_empty() {
                session.fast_mode = true;
            }
        }

        session.last_event_at = Some(effective_timestamp(metric.timestamp, now));
        session.metrics.push(metric);
    }

    /// Route an event into its session, re-sorting the event list and
    /// accumulating cache token counts for `api_request` events.
    pub fn add_event(&self, session_id: &str, event: Event) {
        let session_id = normalize_session_id(session_id);
        let now = Utc::now();

        let dispatch = {
            let mut inner = self.inner.write().unwrap();
            let session = inner
                .sessions
                .entry(session_id.clone())
                .or_insert_with(|| Session::new(session_id.clone()));

            apply_identity_fields(session, &event.attributes);
            session.fast_mode = event
                .attributes
                .get("speed")
                .map(|s| !s.is_empty())
                .unwrap_or(false);

            if event.name == EVENT_API_REQUEST {
                if let Some(v) = parse_i64(&event.attributes, "cache_read_tokens") {
                    session.cache_read_tokens += v;
                }
                if let Some(v) = parse_i64(&event.attributes, "cache_creation_tokens") {
                    session.cache_creation_tokens += v;
                }
            }

            session.last_event_at = Some(effective_timestamp(event.timestamp, now));
            session.events.push(event.clone());
            sort_events(&mut session.events);

            (session_id.clone(), event)
        };

        let listeners = self.listeners.read().unwrap().clone();
        for listener in &listeners {
            listener(&dispatch.0, &dispatch.1);
        }
    }

    /// Deep copy of one session, or `None` if it has never been mentioned.
    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.inner.read().unwrap().sessions.get(session_id).cloned()
    }

    /// Deep copies of every session, ordered by `(started_at, session_id)`.
    pub fn list_sessions(&self) -> Vec<Session> {
        let inner = self.inner.read().unwrap();
        let mut sessions: Vec<Session> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    pub fn get_aggregated_cost(&self) -> f64 {
        self.inner
            .read()
            .unwrap()
            .sessions
            .values()
            .map(|s| s.total_cost)
            .sum()
    }

    pub fn update_pid(&self, session_id: &str, pid: u32) {
        let session_id = normalize_session_id(session_id);
        let mut inner = self.inner.write().unwrap();
        let session = inner
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Session::new(session_id));
        session.pid = Some(pid);
    }

    /// No-op for `pid == 0` — never creates a session in that case.
    pub fn mark_exited(&self, session_id: &str, pid: u32) {
        if pid == 0 {
            return;
        }
        let session_id = normalize_session_id(session_id);
        let mut inner = self.inner.write().unwrap();
        let session = inner
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Session::new(session_id));
        session.exited = true;
    }

    /// Empty-string fields in `update` are no-ops for the matching session
    /// field.
    pub fn update_metadata(&self, session_id: &str, update: MetadataUpdate) {
        let session_id = normalize_session_id(session_id);
        let mut inner = self.inner.write().unwrap();
        let session = inner
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Session::new(session_id));

        if !update.working_dir.is_empty() {
            session.working_dir = Some(update.working_dir);
        }
        if !update.service_version.is_empty() {
            session.service_version = Some(update.service_version);
        }
        if !update.os_type.is_empty() {
            session.os_type = Some(update.os_type);
        }
        if !update.os_version.is_empty() {
            session.os_version = Some(update.os_version);
        }
        if !update.host_arch.is_empty() {
            session.host_arch = Some(update.host_arch);
        }
    }

    /// Register a post-commit listener. Never called while holding the
    /// write lock.
    pub fn on_event(&self, listener: Listener) {
        self.listeners.write().unwrap().push(listener);
    }

    /// Install a fully-formed session (used by recovery), bypassing the
    /// `last_event_at` advancement logic that `add_metric`/`add_event`
    /// apply — the restored value is authoritative.
    pub fn restore_session(&self, session: Session) {
        let mut inner = self.inner.write().unwrap();
        inner.sessions.insert(session.session_id.clone(), session);
    }
}

fn normalize_session_id(session_id: &str) -> String {
    if session_id.is_empty() {
        tracing::warn!("telemetry arrived without a session.id; bucketing under \"unknown\"");
        UNKNOWN_SESSION.to_string()
    } else {
        session_id.to_string()
    }
}

/// OTLP timestamps that decode to the zero value (unix epoch) are treated
/// as "not provided" and replaced with `now`.
fn effective_timestamp(ts: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if ts.timestamp() == 0 && ts.timestamp_subsec_nanos() == 0 {
        now
    } else {
        ts
    }
}

fn apply_identity_fields(session: &mut Session, attrs: &Attributes) {
    if let Some(model) = attrs.get("model") {
        if !model.is_empty() {
            session.model = Some(model.clone());
        }
    }
    if let Some(terminal) = attrs.get("terminal.type") {
        if !terminal.is_empty() {
            session.terminal = Some(terminal.clone());
        }
    }
    if let Some(org) = attrs.get("organization.id") {
        if !org.is_empty() {
            session.organization_id = Some(org.clone());
        }
    }
    if let Some(uuid) = attrs.get("user.account_uuid") {
        if !uuid.is_empty() {
            session.user_account_uuid = Some(uuid.clone());
        }
    }
}

fn parse_i64(attrs: &Attributes, key: &str) -> Option<i64> {
    attrs.get(key).and_then(|v| v.parse::<i64>().ok())
}

fn event_order(a: &Event, b: &Event) -> Ordering {
    match (a.sequence != 0, b.sequence != 0) {
        (true, true) => a.sequence.cmp(&b.sequence),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.timestamp.cmp(&b.timestamp),
    }
}

fn sort_events(events: &mut [Event]) {
    events.sort_by(event_order);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn metric(name: &str, value: f64, attrs: &[(&str, &str)], ts: DateTime<Utc>) -> Metric {
        Metric {
            name: name.to_string(),
            value,
            attributes: attrs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            timestamp: ts,
        }
    }

    fn event(name: &str, attrs: &[(&str, &str)], ts: DateTime<Utc>) -> Event {
        Event::new(
            name,
            attrs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ts,
        )
    }

    #[test]
    fn counter_reset_adds_new_value_in_full() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.add_metric("S", metric(crate::types::METRIC_COST_USAGE, 10.0, &[], t0));
        store.add_metric("S", metric(crate::types::METRIC_COST_USAGE, 15.0, &[], t0 + Duration::seconds(1)));
        store.add_metric("S", metric(crate::types::METRIC_COST_USAGE, 3.0, &[], t0 + Duration::seconds(2)));
        let session = store.get_session("S").unwrap();
        assert_eq!(session.total_cost, 18.0);
    }

    #[test]
    fn event_cost_attribute_never_affects_total_cost() {
        let store = MemoryStore::new();
        store.add_event(
            "S",
            event(EVENT_API_REQUEST, &[("cost_usd", "0.05")], Utc::now()),
        );
        let session = store.get_session("S").unwrap();
        assert_eq!(session.total_cost, 0.0);
        assert_eq!(session.model, None);
    }

    #[test]
    fn hybrid_event_ordering_sorts_by_sequence_when_present() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.add_event("S", event("e", &[("event.sequence", "3")], t0));
        store.add_event("S", event("e", &[("event.sequence", "1")], t0 + Duration::seconds(1)));
        store.add_event("S", event("e", &[("event.sequence", "2")], t0 + Duration::seconds(2)));
        let session = store.get_session("S").unwrap();
        let seqs: Vec<i64> = session.events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn get_session_returns_a_deep_copy() {
        let store = MemoryStore::new();
        store.add_metric("S", metric(crate::types::METRIC_COST_USAGE, 5.0, &[], Utc::now()));
        let mut copy = store.get_session("S").unwrap();
        copy.total_cost = 999.0;
        copy.metrics.clear();
        let fresh = store.get_session("S").unwrap();
        assert_eq!(fresh.total_cost, 5.0);
        assert_eq!(fresh.metrics.len(), 1);
    }

    #[test]
    fn list_sessions_sorted_by_started_at_then_id() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.add_metric("B", metric(crate::types::METRIC_SESSION_COUNT, 1.0, &[], t0 + Duration::seconds(5)));
        store.add_metric("A", metric(crate::types::METRIC_SESSION_COUNT, 1.0, &[], t0));
        let sessions = store.list_sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "A");
        assert_eq!(sessions[1].session_id, "B");
    }

    #[test]
    fn mark_exited_with_pid_zero_is_a_no_op() {
        let store = MemoryStore::new();
        store.mark_exited("S", 0);
        assert!(store.get_session("S").is_none());
    }

    #[test]
    fn update_metadata_ignores_empty_fields() {
        let store = MemoryStore::new();
        store.update_pid("S", 123);
        store.update_metadata(
            "S",
            MetadataUpdate {
                working_dir: "/tmp".to_string(),
                ..Default::default()
            },
        );
        store.update_metadata("S", MetadataUpdate::default());
        let session = store.get_session("S").unwrap();
        assert_eq!(session.working_dir.as_deref(), Some("/tmp"));
    }

    #[test]
    fn empty_session_id_buckets_under_unknown() {
        let store = MemoryStore::new();
        store.add_metric("", metric(crate::types::METRIC_COST_USAGE, 1.0, &[], Utc::now()));
        assert!(store.get_session(UNKNOWN_SESSION).is_some());
    }

    #[test]
    fn previous_values_track_last_observed_value() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.add_metric("S", metric("custom.counter", 7.0, &[("k", "v")], t0));
        store.add_metric("S", metric("custom.counter", 12.0, &[("k", "v")], t0 + Duration::seconds(1)));
        let session = store.get_session("S").unwrap();
        let key = metric_key("custom.counter", &[("k", "v")].iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        assert_eq!(session.previous_values.get(&key), Some(&12.0));
    }

    #[test]
    fn listener_is_invoked_after_the_write_lock_is_released() {
        use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
        let store = Arc::new(MemoryStore::new());
        let reentered = Arc::new(AtomicBool::new(false));
        let store_for_listener = store.clone();
        let reentered_for_listener = reentered.clone();
        store.on_event(Arc::new(move |session_id, _event| {
            // Re-entrant read must not deadlock if dispatch happens outside the lock.
            if store_for_listener.get_session(session_id).is_some() {
                reentered_for_listener.store(true, AtomicOrdering::SeqCst);
            }
        }));
        store.add_event("S", event("e", &[], Utc::now()));
        assert!(reentered.load(AtomicOrdering::SeqCst));
    }
}
