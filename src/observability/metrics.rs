//! OpenTelemetry metrics.
//!
//! Key metrics:
//! - datagate_operations_total: Counter for data operations by kind and outcome
//! - datagate_operation_latency_seconds: Histogram for operation latency
//! - datagate_lock_conflicts_total: Counter for rejected lock acquisitions
//! - datagate_active_locks: Gauge for currently held row locks
//! - datagate_audit_entries_total: Counter for committed audit entries

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

use crate::TableId;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Datagate metrics registry.
#[derive(Debug)]
pub struct Metrics {
    /// Total number of data operations.
    pub operations_total: Counter<u64>,
    /// Histogram of operation latency in seconds.
    pub operation_latency: Histogram<f64>,
    /// Lock acquisitions rejected because another actor holds the row.
    pub lock_conflicts: Counter<u64>,
    /// Currently active row locks, as of the last sweep.
    pub active_locks: Gauge<u64>,
    /// Audit entries committed.
    pub audit_entries: Counter<u64>,
}

impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            operations_total: meter
                .u64_counter("datagate_operations_total")
                .with_description("Total number of data operations")
                .with_unit("1")
                .init(),
            operation_latency: meter
                .f64_histogram("datagate_operation_latency_seconds")
                .with_description("Data operation latency, including audit commit")
                .with_unit("s")
                .init(),
            lock_conflicts: meter
                .u64_counter("datagate_lock_conflicts_total")
                .with_description("Lock acquisitions rejected by an active holder")
                .with_unit("1")
                .init(),
            active_locks: meter
                .u64_gauge("datagate_active_locks")
                .with_description("Row locks currently held")
                .with_unit("1")
                .init(),
            audit_entries: meter
                .u64_counter("datagate_audit_entries_total")
                .with_description("Audit entries committed")
                .with_unit("1")
                .init(),
        }
    }
}

fn manual_provider() -> SdkMeterProvider {
    let reader = ManualReader::builder().build();
    SdkMeterProvider::builder().with_reader(reader).build()
}

/// Initialize the metrics system.
///
/// This should be called once at startup. Subsequent calls are ignored.
///
/// # Arguments
///
/// * `otel_endpoint` - Optional OTLP endpoint for metrics export
pub fn init_metrics_with_endpoint(otel_endpoint: Option<&str>) {
    METRICS.get_or_init(|| {
        if let Some(endpoint) = otel_endpoint {
            use opentelemetry_otlp::{Protocol, WithExportConfig};

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc);

            match opentelemetry_otlp::new_pipeline()
                .metrics(opentelemetry_sdk::runtime::Tokio)
                .with_exporter(exporter)
                .with_period(std::time::Duration::from_secs(10))
                .build()
            {
                Ok(provider) => {
                    global::set_meter_provider(provider);
                    tracing::info!(endpoint, "OTLP metrics exporter configured");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create OTLP exporter, using no-op metrics");
                    global::set_meter_provider(manual_provider());
                }
            }
        } else {
            // Recorded but not exported
            global::set_meter_provider(manual_provider());
        }

        let meter = global::meter("datagate");
        Metrics::new(&meter)
    });
}

/// Initialize the metrics system without OTLP export.
pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

/// Get the global metrics instance, if initialized.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Record a finished data operation.
///
/// # Arguments
///
/// * `operation` - Operation name (read, insert, update, delete, ...)
/// * `backend` - Backend kind the operation ran against
/// * `ok` - Whether the operation succeeded
/// * `latency_seconds` - Wall time of the operation
pub fn record_operation(operation: &'static str, backend: &str, ok: bool, latency_seconds: f64) {
    if let Some(m) = METRICS.get() {
        let attrs = [
            KeyValue::new("operation", operation),
            KeyValue::new("backend", backend.to_string()),
            KeyValue::new("outcome", if ok { "ok" } else { "error" }),
        ];
        m.operations_total.add(1, &attrs);
        m.operation_latency.record(latency_seconds, &attrs);
    }
}

/// Record a rejected lock acquisition.
pub fn record_lock_conflict(table_id: TableId) {
    if let Some(m) = METRICS.get() {
        m.lock_conflicts
            .add(1, &[KeyValue::new("table_id", table_id)]);
    }
}

/// Record the number of active row locks.
pub fn record_active_locks(count: usize) {
    if let Some(m) = METRICS.get() {
        m.active_locks.record(count as u64, &[]);
    }
}

/// Record committed audit entries.
pub fn record_audit_entries(table_id: TableId, count: usize) {
    if let Some(m) = METRICS.get() {
        m.audit_entries
            .add(count as u64, &[KeyValue::new("table_id", table_id)]);
    }
}
