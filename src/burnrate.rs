//! Burn-rate estimator (ambient component M). Reads live sessions' events and
//! produces a smoothed USD/hour spend rate, broken down by model, for the
//! `burn_rate_snapshots` table and the cost-burn-rate alert rule. Grounded on
//! the teacher's `ewma_eval` in `anomaly_engine.rs` — same exponential
//! smoothing shape, applied to a per-model cost rate instead of a latency
//! series.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use crate::types::{Session, EVENT_API_REQUEST};

const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);
const DEFAULT_ALPHA: f64 = 0.3;

fn attr_f64(attrs: &crate::types::Attributes, key: &str) -> Option<f64> {
    attrs.get(key).and_then(|v| v.parse::<f64>().ok())
}

/// Exponentially-smoothed per-model spend rate, recomputed on demand from a
/// snapshot of live sessions. Smoothing state persists across calls so a
/// single noisy window doesn't spike the reported rate.
pub struct BurnRateEstimator {
    window: Duration,
    alpha: f64,
    smoothed: Mutex<HashMap<String, f64>>,
}

impl Default for BurnRateEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_ALPHA)
    }
}

impl BurnRateEstimator {
    pub fn new(window: Duration, alpha: f64) -> Self {
        Self {
            window,
            alpha,
            smoothed: Mutex::new(HashMap::new()),
        }
    }

    /// Sum `api_request` cost within the trailing window, per model.
    fn window_cost(&self, sessions: &[Session]) -> HashMap<String, f64> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
        let mut cost: HashMap<String, f64> = HashMap::new();

        for session in sessions {
            for event in &session.events {
                if event.name != EVENT_API_REQUEST || event.timestamp < cutoff {
                    continue;
                }
                let Some(model) = event.attributes.get("model") else { continue };
                let usd = attr_f64(&event.attributes, "cost_usd").unwrap_or(0.0);
                *cost.entry(model.clone()).or_insert(0.0) += usd;
            }
        }
        cost
    }

    /// Compute the current smoothed rate, updating internal state, and
    /// return `(hourly_rate_usd, by_model_json)` for `WriteOp::BurnRateSnapshot`.
    pub fn snapshot(&self, sessions: &[Session]) -> (f64, String) {
        let window_hours = self.window.as_secs_f64() / 3600.0;
        let raw = self.window_cost(sessions);

        let mut state = self.smoothed.lock().unwrap();
        let models: std::collections::HashSet<String> =
            state.keys().cloned().chain(raw.keys().cloned()).collect();

        for model in &models {
            let observed_rate = raw.get(model).copied().unwrap_or(0.0) / window_hours;
            let previous = state.get(model).copied().unwrap_or(0.0);
            let next = self.alpha * observed_rate + (1.0 - self.alpha) * previous;
            if next < 1e-9 {
                state.remove(model);
            } else {
                state.insert(model.clone(), next);
            }
        }

        let by_model: HashMap<String, f64> = state.clone();
        let hourly_rate: f64 = by_model.values().sum();
        let by_model_json = serde_json::to_string(&by_model).unwrap_or_else(|_| "{}".to_string());
        (hourly_rate, by_model_json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Attributes, Event, Session};

    fn session_with_request(model: &str, cost: f64) -> Session {
        let mut session = Session::new("s1");
        let mut attrs = Attributes::new();
        attrs.insert("model".to_string(), model.to_string());
        attrs.insert("cost_usd".to_string(), cost.to_string());
        session.events.push(Event::new(EVENT_API_REQUEST, attrs, Utc::now()));
        session
    }

    #[test]
    fn events_outside_window_are_excluded() {
        let estimator = BurnRateEstimator::new(Duration::from_secs(60), 1.0);
        let mut session = Session::new("s1");
        let mut attrs = Attributes::new();
        attrs.insert("model".to_string(), "claude-3".to_string());
        attrs.insert("cost_usd".to_string(), "5.0".to_string());
        session.events.push(Event::new(
            EVENT_API_REQUEST,
            attrs,
            Utc::now() - chrono::Duration::hours(1),
        ));
        let (rate, _) = estimator.snapshot(&[session]);
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn alpha_one_tracks_observed_rate_exactly() {
        let estimator = BurnRateEstimator::new(Duration::from_secs(3600), 1.0);
        let sessions = vec![session_with_request("claude-3", 2.0)];
        let (rate, by_model) = estimator.snapshot(&sessions);
        assert!((rate - 2.0).abs() < 1e-9);
        assert!(by_model.contains("claude-3"));
    }

    #[test]
    fn partial_alpha_damps_a_fresh_spike() {
        let estimator = BurnRateEstimator::new(Duration::from_secs(3600), 0.3);
        let sessions = vec![session_with_request("claude-3", 10.0)];
        let (first, _) = estimator.snapshot(&sessions);
        assert!(first < 10.0);
        let (second, _) = estimator.snapshot(&sessions);
        assert!(second > first);
    }

    #[test]
    fn model_dropping_out_decays_toward_zero() {
        let estimator = BurnRateEstimator::new(Duration::from_secs(3600), 0.5);
        let sessions = vec![session_with_request("claude-3", 4.0)];
        let (first, _) = estimator.snapshot(&sessions);
        assert!(first > 0.0);
        let (second, _) = estimator.snapshot(&[]);
        assert!(second < first);
    }
}
