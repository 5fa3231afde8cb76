//! Observability infrastructure.
//!
//! Provides:
//! - Structured tracing via tracing-subscriber
//! - OpenTelemetry metrics for data operations, locks and audit writes

pub mod metrics;
pub mod tracing;
