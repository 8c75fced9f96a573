use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber: compact fmt output plus an
/// OpenTelemetry span layer with W3C trace-context propagation. Spans export
/// to stdout; wire an OTLP exporter here if a collector is available.
pub fn init_telemetry(service_name: &'static str) {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .build();

    let tracer = provider.tracer(service_name);

    let otel = OpenTelemetryLayer::new(tracer);
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("director=info".parse().unwrap()))
        .with(tracing_subscriber::fmt::layer().compact())
        .with(otel)
        .init();
}
