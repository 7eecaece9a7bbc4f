//! Notifier backends (ambient component L). `Notifier` is object-safe via
//! `async-trait` so `alerts::mod` can hold a `Vec<Box<dyn Notifier>>` built
//! from config. `notify` must return quickly — slow work (the webhook POST)
//! runs inside its own async call, never blocking the alert loop's tick.

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct Alert {
    pub rule: String,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert);
}

/// Always-on fallback notifier — matches the teacher's `tracing::warn!`
/// fallback when no richer channel is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &Alert) {
        tracing::warn!(
            rule = %alert.rule,
            value = alert.value,
            threshold = alert.threshold,
            "{}",
            alert.message
        );
    }
}

/// Posts the alert as JSON to a configured webhook URL. Modeled on the
/// teacher's `"webhook"` branch in `alert_engine.rs`.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self { client: reqwest::Client::new(), url }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) {
        let payload = serde_json::json!({
            "rule": alert.rule,
            "message": alert.message,
            "value": alert.value,
            "threshold": alert.threshold,
        });
        // reqwest::Client is Arc-backed internally, so cloning it to move
        // into the spawned task is cheap. The POST runs on its own task so
        // a slow or hanging endpoint never stalls the caller's tick loop.
        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&payload).send().await {
                tracing::warn!(error = %e, url = %url, "webhook notification failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn webhook_notify_returns_without_waiting_for_the_response() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:1/webhook".to_string());
        let alert = Alert {
            rule: "cost_burn_rate".to_string(),
            message: "burn rate exceeded".to_string(),
            value: 12.0,
            threshold: 10.0,
        };
        let elapsed = tokio::time::Instant::now();
        notifier.notify(&alert).await;
        assert!(elapsed.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn log_notifier_never_panics_on_notify() {
        let notifier = LogNotifier;
        notifier
            .notify(&Alert {
                rule: "cost_burn_rate".to_string(),
                message: "burn rate exceeded".to_string(),
                value: 12.0,
                threshold: 10.0,
            })
            .await;
    }
}
