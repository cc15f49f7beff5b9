// Telemetry module for structured logging, metrics, and tracing

use crate::errors::ResolutionFailure;
use crate::reconciler::ReconcileSummary;
use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging with JSON formatting and trace context
///
/// This function sets up the tracing subscriber with:
/// - JSON formatting for structured logs
/// - Log level from configuration, overridden by `RUST_LOG`
/// - Optional OpenTelemetry export when an endpoint is given
///
/// Logs go to stderr so the audit report on stdout stays clean.
#[tracing::instrument(skip_all)]
pub fn init_logging(
    service_name: &'static str,
    log_level: &str,
    tracing_endpoint: Option<&str>,
) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(service_name, endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        service = service_name,
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

#[tracing::instrument(skip_all)]
fn init_tracer(service_name: &'static str, endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(service_name);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized with OTLP exporter");

    Ok(tracer)
}

/// Flush remaining spans; call on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter and describe the scheduler metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_gauge!("schedule_projects_total", "Projects with at least one schedule");
    describe_gauge!("schedule_entries_total", "Schedule entries across all projects");
    describe_counter!("reconcile_added_total", "Projects whose schedule was added");
    describe_counter!("reconcile_removed_total", "Projects whose schedule was removed");
    describe_counter!("reconcile_changed_total", "Projects whose schedule was rewritten");
    describe_counter!("resolution_skipped_total", "Projects excluded from a pass");
    describe_counter!("refresh_pass_failed_total", "Refresh passes that did not complete");
    describe_histogram!("refresh_pass_duration_seconds", "Duration of refresh passes in seconds");
    describe_counter!("scan_gate_outcome_total", "Scan gate decisions by outcome");

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_snapshot_size(projects: usize, entries: usize) {
    gauge!("schedule_projects_total").set(projects as f64);
    gauge!("schedule_entries_total").set(entries as f64);
}

#[inline]
pub fn record_reconcile(summary: &ReconcileSummary) {
    counter!("reconcile_added_total").increment(summary.added as u64);
    counter!("reconcile_removed_total").increment(summary.removed as u64);
    counter!("reconcile_changed_total").increment(summary.changed as u64);
}

/// Label values stay low-cardinality: the failure kind, never the project
#[inline]
pub fn record_resolution_skipped(failure: &ResolutionFailure) {
    let reason = match failure {
        ResolutionFailure::BadScheduleTag => "bad_tag",
        ResolutionFailure::BranchUndetermined => "branch",
        ResolutionFailure::EnginesUndetermined => "engines",
        ResolutionFailure::RepoUrlMissing => "repo_url",
        ResolutionFailure::RepoMisconfigured => "misconfigured",
        ResolutionFailure::Lookup(_) => "lookup",
    };
    counter!("resolution_skipped_total", "reason" => reason).increment(1);
}

#[inline]
pub fn record_pass_duration(duration_seconds: f64) {
    histogram!("refresh_pass_duration_seconds").record(duration_seconds);
}

#[inline]
pub fn record_pass_failure(kind: &'static str) {
    counter!("refresh_pass_failed_total", "kind" => kind).increment(1);
}

#[inline]
pub fn record_gate_outcome(outcome: &'static str) {
    counter!("scan_gate_outcome_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_with_valid_level() {
        // Fails if a subscriber is already installed in this process
        let result = init_logging("scheduler-test", "info", None);
        assert!(result.is_ok() || result.is_err());
    }

    #[test]
    fn test_metrics_recording() {
        // No recorder installed: recording must be a no-op, not a panic
        record_snapshot_size(3, 5);
        record_reconcile(&ReconcileSummary {
            added: 1,
            removed: 0,
            changed: 2,
            unchanged: 0,
        });
        record_resolution_skipped(&ResolutionFailure::BadScheduleTag);
        record_resolution_skipped(&ResolutionFailure::Lookup("x".to_string()));
        record_pass_duration(0.25);
        record_pass_failure("transient");
        record_gate_outcome("busy");
    }
}
