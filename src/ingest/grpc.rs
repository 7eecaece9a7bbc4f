//! gRPC OTLP receiver: implements the official `MetricsService` and
//! `LogsService` traits from `opentelemetry-proto` against the durable
//! store. Grounded on the teacher-adjacent `groblegark-coop` service-struct
//! shape (`Arc<AppState>` wrapped in a tonic service impl), but against the
//! real OTLP collector service rather than a hand-rolled `.proto`.

use std::sync::Arc;

use opentelemetry_proto::tonic::collector::logs::v1::logs_service_server::LogsService;
use opentelemetry_proto::tonic::collector::logs::v1::{ExportLogsServiceRequest, ExportLogsServiceResponse};
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::MetricsService;
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use tonic::{Request, Response, Status};

use crate::db::DurableStore;
use crate::ingest::decode;

pub struct MetricsReceiver {
    store: Arc<DurableStore>,
}

impl MetricsReceiver {
    pub fn new(store: Arc<DurableStore>) -> Self {
        Self { store }
    }
}

#[tonic::async_trait]
impl MetricsService for MetricsReceiver {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        let req = request.into_inner();
        for rm in &req.resource_metrics {
            for (session_id, metric) in decode::decode_resource_metrics(rm) {
                self.store.add_metric(&session_id, metric);
            }
        }
        Ok(Response::new(ExportMetricsServiceResponse::default()))
    }
}

pub struct LogsReceiver {
    store: Arc<DurableStore>,
}

impl LogsReceiver {
    pub fn new(store: Arc<DurableStore>) -> Self {
        Self { store }
    }
}

#[tonic::async_trait]
impl LogsService for LogsReceiver {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        let req = request.into_inner();
        for rl in &req.resource_logs {
            for (session_id, event) in decode::decode_resource_logs(rl) {
                self.store.add_event(&session_id, event);
            }
        }
        Ok(Response::new(ExportLogsServiceResponse::default()))
    }
}
