//! OTLP ingestion transport (ambient component J): gRPC via `tonic` and
//! HTTP via `axum`, both decoding into `DurableStore::add_metric`/`add_event`
//! calls through the shared helpers in `decode`.

pub mod decode;
pub mod grpc;
pub mod http;
