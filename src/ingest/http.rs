//! HTTP OTLP receiver: `POST /v1/logs` and `POST /v1/metrics`, accepting
//! either protobuf or JSON OTLP bodies. Malformed bodies return 400 and are
//! logged; the server keeps running. Grounded on the teacher's axum
//! `Router`/handler conventions (`src/main.rs`, `src/handlers/`).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use opentelemetry_proto::tonic::collector::logs::v1::{ExportLogsServiceRequest, ExportLogsServiceResponse};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use prost::Message;

use crate::db::DurableStore;
use crate::ingest::decode;

pub fn router(store: Arc<DurableStore>) -> Router {
    Router::new()
        .route("/v1/metrics", post(handle_metrics))
        .route("/v1/logs", post(handle_logs))
        .with_state(store)
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("json"))
        .unwrap_or(false)
}

async fn handle_metrics(
    State(store): State<Arc<DurableStore>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let req: ExportMetricsServiceRequest = if is_json(&headers) {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(error = %e, "malformed OTLP/JSON metrics body");
                return (StatusCode::BAD_REQUEST, "malformed request body").into_response();
            }
        }
    } else {
        match ExportMetricsServiceRequest::decode(body) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(error = %e, "malformed OTLP/protobuf metrics body");
                return (StatusCode::BAD_REQUEST, "malformed request body").into_response();
            }
        }
    };

    for rm in &req.resource_metrics {
        for (session_id, metric) in decode::decode_resource_metrics(rm) {
            store.add_metric(&session_id, metric);
        }
    }

    axum::Json(ExportMetricsServiceResponse::default()).into_response()
}

async fn handle_logs(
    State(store): State<Arc<DurableStore>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let req: ExportLogsServiceRequest = if is_json(&headers) {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(error = %e, "malformed OTLP/JSON logs body");
                return (StatusCode::BAD_REQUEST, "malformed request body").into_response();
            }
        }
    } else {
        match ExportLogsServiceRequest::decode(body) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(error = %e, "malformed OTLP/protobuf logs body");
                return (StatusCode::BAD_REQUEST, "malformed request body").into_response();
            }
        }
    };

    for rl in &req.resource_logs {
        for (session_id, event) in decode::decode_resource_logs(rl) {
            store.add_event(&session_id, event);
        }
    }

    axum::Json(ExportLogsServiceResponse::default()).into_response()
}
