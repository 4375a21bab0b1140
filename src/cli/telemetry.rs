//! Tracing setup: console logging always, OTLP span export when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use anyhow::{Context, Result};
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{SpanExporter, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    propagation::{BaggagePropagator, TraceContextPropagator},
    runtime,
    trace::{Tracer, TracerProvider},
    Resource,
};
use std::time::Duration;
use tonic::{
    metadata::{MetadataKey, MetadataMap, MetadataValue},
    transport::ClientTlsConfig,
};
use tracing::{Level, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, registry::LookupSpan, EnvFilter, Registry,
};
use url::Url;

/// Install the global tracing subscriber.
///
/// `verbosity_level` is the console default; `RUST_LOG` still overrides it.
///
/// # Errors
/// Returns an error when the OTLP exporter cannot be built or a subscriber
/// is already installed.
pub fn init(verbosity_level: Option<Level>) -> Result<()> {
    let env_filter = build_env_filter(verbosity_level)?;

    let fmt_layer = fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_target(false);

    let otel_layer = match otlp_endpoint() {
        Some(endpoint) => Some(build_otel_layer(&endpoint)?),
        None => None,
    };

    let subscriber = Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}

/// Flush and shut down the OTLP pipeline. A no-op when export is disabled.
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

fn build_env_filter(verbosity_level: Option<Level>) -> Result<EnvFilter> {
    let default_level = verbosity_level.map_or(LevelFilter::ERROR, LevelFilter::from_level);

    let mut env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    for directive in [
        "h2=error",
        "hyper=error",
        "tonic=error",
        "tower=error",
        "opentelemetry_sdk=warn",
    ] {
        env_filter = env_filter.add_directive(
            directive
                .parse()
                .with_context(|| format!("invalid log directive: {directive}"))?,
        );
    }

    Ok(env_filter)
}

fn otlp_endpoint() -> Option<String> {
    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .map(|endpoint| endpoint.trim().to_string())
        .filter(|endpoint| !endpoint.is_empty())
}

fn build_otel_layer<S>(endpoint: &str) -> Result<OpenTelemetryLayer<S, Tracer>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let endpoint = normalize_endpoint(endpoint);

    let metadata = headers_to_metadata(&parse_otlp_headers_from_env());

    let mut builder = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .with_metadata(metadata)
        .with_timeout(Duration::from_secs(3));

    if endpoint.starts_with("https://") {
        let tls_config = match Url::parse(&endpoint)
            .ok()
            .and_then(|url| url.host_str().map(String::from))
        {
            Some(host) => ClientTlsConfig::new().with_native_roots().domain_name(host),
            None => ClientTlsConfig::new().with_native_roots(),
        };

        builder = builder.with_tls_config(tls_config);
    }

    let exporter = builder.build().context("failed to build OTLP span exporter")?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .build();

    let tracer = provider.tracer(env!("CARGO_PKG_NAME"));

    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    global::set_tracer_provider(provider);

    Ok(OpenTelemetryLayer::new(tracer))
}

/// Ensure the endpoint carries a scheme and no trailing slash, tonic
/// rejects bare host:port pairs.
fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');

    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Parse `OTEL_EXPORTER_OTLP_HEADERS` as comma separated `key=value` pairs.
fn parse_otlp_headers_from_env() -> Vec<(String, String)> {
    std::env::var("OTEL_EXPORTER_OTLP_HEADERS")
        .ok()
        .map_or_else(Vec::new, |raw| {
            raw.split(',')
                .filter_map(|entry| {
                    let (key, value) = entry.split_once('=')?;
                    let key = key.trim().to_ascii_lowercase();
                    let value = value.trim().to_string();

                    if key.is_empty() || value.is_empty() {
                        return None;
                    }

                    Some((key, value))
                })
                .collect()
        })
}

fn headers_to_metadata(headers: &[(String, String)]) -> MetadataMap {
    let mut metadata = MetadataMap::new();

    for (key, value) in headers {
        // Binary metadata keys carry base64 payloads, ASCII only here.
        if key.ends_with("-bin") {
            continue;
        }

        let Ok(key) = MetadataKey::from_bytes(key.as_bytes()) else {
            continue;
        };

        let Ok(value) = MetadataValue::try_from(value.as_str()) else {
            continue;
        };

        metadata.insert(key, value);
    }

    metadata
}
