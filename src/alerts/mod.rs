//! Alert rule engine (ambient component K). Grounded on the teacher's
//! `alert_engine.rs` interval loop shape — a fixed small set of built-in
//! rule kinds evaluated against the query layer instead of a general rule
//! language, persisting state transitions via `DurableStore::persist_alert`
//! and dispatching through the registered `Notifier`s.

pub mod notify;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::db::DurableStore;
use crate::stats;
use notify::{Alert, Notifier};

const EVAL_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleState {
    Ok,
    Firing,
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub name: String,
    pub kind: RuleKind,
    pub threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Aggregate hourly cost burn rate across all live sessions, USD/hour.
    CostBurnRate,
    /// Dashboard-wide error rate (api_error / api_request).
    ErrorRate,
}

pub struct AlertEngine {
    store: Arc<DurableStore>,
    notifiers: Vec<Arc<dyn Notifier>>,
    rules: Vec<AlertRule>,
    state: Mutex<HashMap<String, RuleState>>,
}

impl AlertEngine {
    pub fn new(store: Arc<DurableStore>, notifiers: Vec<Arc<dyn Notifier>>, rules: Vec<AlertRule>) -> Arc<Self> {
        Arc::new(Self {
            store,
            notifiers,
            rules,
            state: Mutex::new(HashMap::new()),
        })
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVAL_INTERVAL);
            loop {
                interval.tick().await;
                self.eval_once().await;
            }
        })
    }

    async fn eval_once(&self) {
        let sessions = self.store.list_sessions();
        let computed = stats::compute(&sessions, None);
        let hourly_cost: f64 = sessions.iter().map(|s| s.total_cost).sum();

        for rule in &self.rules {
            let value = match rule.kind {
                RuleKind::CostBurnRate => hourly_cost,
                RuleKind::ErrorRate => computed.error_rate,
            };
            let triggered = value > rule.threshold;
            self.transition(rule, value, triggered).await;
        }
    }

    async fn transition(&self, rule: &AlertRule, value: f64, triggered: bool) {
        let mut state = self.state.lock().unwrap();
        let previous = state.get(&rule.name).copied().unwrap_or(RuleState::Ok);
        let next = if triggered { RuleState::Firing } else { RuleState::Ok };
        if previous == next {
            return;
        }
        state.insert(rule.name.clone(), next);
        drop(state);

        if next == RuleState::Firing {
            let message = format!("{} exceeded threshold: {value:.2} > {:.2}", rule.name, rule.threshold);
            self.store.persist_alert(&rule.name, &message, value, rule.threshold);
            let alert = Alert {
                rule: rule.name.clone(),
                message,
                value,
                threshold: rule.threshold,
            };
            for notifier in &self.notifiers {
                notifier.notify(&alert).await;
            }
        } else {
            tracing::info!(rule = %rule.name, value, "alert resolved");
        }
    }
}
