//! Logging and distributed tracing setup.
//!
//! Every binary logs through `tracing` with an `EnvFilter` (default `info`,
//! overridable through `RUST_LOG`). Given an OTLP endpoint, spans are also
//! exported over gRPC so one client write can be followed from the client
//! through the leader into every follower's AppendEntries handler.
//!
//! Trace context crosses process boundaries in [`Envelope::trace`]: the
//! caller injects the current span's context, the server adopts it as the
//! parent of its handler span.
//!
//! [`Envelope::trace`]: crate::rpc::Envelope

use anyhow::{Context, Result};
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{Resource, runtime};
use tracing::{Span, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::rpc::TraceHeaders;

const TRACER_NAME: &str = "raft-kv";

/// Keeps the trace exporter alive. Call [`shutdown`](Self::shutdown) before
/// exiting so buffered spans are flushed.
pub struct Telemetry {
    provider: Option<TracerProvider>,
}

/// Installs the global subscriber and propagator. With `otlp_endpoint` set,
/// spans are batched to that collector under `service_name`.
///
/// Must be called from within a tokio runtime.
pub fn init(service_name: &str, otlp_endpoint: Option<&str>) -> Result<Telemetry> {
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    let provider = otlp_endpoint
        .map(|endpoint| otlp_provider(service_name, endpoint))
        .transpose()?;
    let otel_layer = provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer(TRACER_NAME)));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(otel_layer)
        .try_init();

    if let Some(provider) = &provider {
        global::set_tracer_provider(provider.clone());
    }
    Ok(Telemetry { provider })
}

fn otlp_provider(service_name: &str, endpoint: &str) -> Result<TracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .with_context(|| format!("failed to build OTLP exporter for {endpoint}"))?;
    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(Resource::new([KeyValue::new(
            "service.name",
            service_name.to_string(),
        )]))
        .build())
}

impl Telemetry {
    pub async fn shutdown(self) {
        let Some(provider) = self.provider else {
            return;
        };
        match tokio::task::spawn_blocking(move || provider.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "failed to flush trace exporter"),
            Err(err) => warn!(error = %err, "trace exporter shutdown panicked"),
        }
    }
}

/// Trace context of the current span, ready to travel in an envelope. Empty
/// when no propagator or no tracing layer is installed.
pub fn current_trace_headers() -> TraceHeaders {
    let mut headers = TraceHeaders::new();
    let context = Span::current().context();
    global::get_text_map_propagator(|propagator| propagator.inject_context(&context, &mut headers));
    headers
}

/// Makes the remote caller's span the parent of `span`.
pub fn adopt_remote_parent(span: &Span, headers: &TraceHeaders) {
    if headers.is_empty() {
        return;
    }
    let parent = global::get_text_map_propagator(|propagator| propagator.extract(headers));
    span.set_parent(parent);
}
