use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ccpulse::alerts::notify::{LogNotifier, Notifier, WebhookNotifier};
use ccpulse::alerts::{AlertEngine, AlertRule, RuleKind};
use ccpulse::burnrate::BurnRateEstimator;
use ccpulse::db::{DurableStore, DurableStoreConfig};
use ccpulse::ingest::grpc::{LogsReceiver, MetricsReceiver};
use ccpulse::ingest::http;
use ccpulse::stats;
use ccpulse::Config;
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_server::LogsServiceServer;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::MetricsServiceServer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ccpulse=info,tower_http=info")))
        .init();

    let config_path = std::env::var("CCPULSE_CONFIG").unwrap_or_else(|_| "ccpulse.toml".to_string());
    let config = Config::load(&config_path)?;
    tracing::info!(path = %config_path, "ccpulse starting");

    let store = DurableStore::open(DurableStoreConfig {
        database_path: config.resolved_database_path(),
        raw_retention_days: config.storage.raw_retention_days,
        summary_retention_days: config.storage.summary_retention_days,
    })
    .await?;

    let pricing = config.models.pricing.clone();
    let stats_store = store.clone();
    store.set_stats_snapshot_fn(Arc::new(move || {
        let sessions = stats_store.list_sessions();
        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        stats::daily_stats_row(&sessions, Some(&pricing), date)
    }));

    let burn_rate_estimator = Arc::new(BurnRateEstimator::default());
    let burn_rate_store = store.clone();
    store.set_burn_rate_snapshot_fn(Arc::new(move || {
        let sessions = burn_rate_store.list_sessions();
        burn_rate_estimator.snapshot(&sessions)
    }));

    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(url) = config.alerts.notifications.webhook_url.clone() {
        notifiers.push(Arc::new(WebhookNotifier::new(url)));
    }
    let mut rules = Vec::new();
    if let Some(threshold) = config.alerts.thresholds.get("cost_burn_rate") {
        rules.push(AlertRule { name: "cost_burn_rate".to_string(), kind: RuleKind::CostBurnRate, threshold: *threshold });
    }
    if let Some(threshold) = config.alerts.thresholds.get("error_rate") {
        rules.push(AlertRule { name: "error_rate".to_string(), kind: RuleKind::ErrorRate, threshold: *threshold });
    }
    let alert_engine = AlertEngine::new(store.clone(), notifiers, rules);
    let _alert_handle = alert_engine.spawn();

    let grpc_store = store.clone();
    let grpc_addr: SocketAddr = format!("{}:{}", config.receiver.bind_address, config.receiver.grpc_port).parse()?;
    let grpc_task = tokio::spawn(async move {
        let result = tonic::transport::Server::builder()
            .add_service(MetricsServiceServer::new(MetricsReceiver::new(grpc_store.clone())))
            .add_service(LogsServiceServer::new(LogsReceiver::new(grpc_store)))
            .serve(grpc_addr)
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "gRPC receiver exited");
        }
    });

    let http_addr: SocketAddr = format!("{}:{}", config.receiver.bind_address, config.receiver.http_port).parse()?;
    let http_app = http::router(store.clone()).layer(CorsLayer::permissive()).layer(TraceLayer::new_for_http());
    let http_task = tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(http_addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = %e, "HTTP receiver failed to bind");
                return;
            }
        };
        tracing::info!(addr = %http_addr, "HTTP OTLP receiver listening");
        if let Err(e) = axum::serve(listener, http_app).await {
            tracing::error!(error = %e, "HTTP receiver exited");
        }
    });
    tracing::info!(addr = %grpc_addr, "gRPC OTLP receiver listening");

    let headless = std::env::var("CCPULSE_HEADLESS").map(|v| v == "1").unwrap_or(false);
    if headless {
        tokio::signal::ctrl_c().await?;
    } else {
        ccpulse::tui::run(store.clone(), config.display.clone()).await?;
    }

    grpc_task.abort();
    http_task.abort();
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.close().await;

    Ok(())
}
