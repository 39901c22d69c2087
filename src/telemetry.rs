//! OpenTelemetry tracing export
//!
//! Enabled when `OTEL_EXPORTER_OTLP_ENDPOINT` is set; the exporter reads the
//! endpoint and headers from the standard OTLP environment variables.

use opentelemetry::trace::TraceError;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self as sdktrace, Tracer};
use opentelemetry_sdk::Resource;
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

pub const SERVICE_NAME: &str = "cloud-lb-controller";

/// Environment variable that switches tracing export on
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

pub fn otlp_endpoint() -> Option<String> {
    std::env::var(OTLP_ENDPOINT_ENV).ok().filter(|e| !e.is_empty())
}

/// Build a tracing layer exporting spans over OTLP/gRPC in batches
pub fn init_telemetry<S>(endpoint: &str) -> Result<OpenTelemetryLayer<S, Tracer>, TraceError>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Flush pending spans
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
