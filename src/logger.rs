use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt as tfmt};

const SERVICE_NAME: &str = "leadflow";

/// Handle to whatever telemetry `init_tracing` installed. Call
/// [`Telemetry::shutdown`] before exit so batched exports are flushed.
pub struct Telemetry {
    providers: Option<OtelProviders>,
}

struct OtelProviders {
    logger: SdkLoggerProvider,
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
}

impl Telemetry {
    pub fn shutdown(self) {
        if let Some(p) = self.providers {
            if let Err(err) = p.tracer.shutdown() {
                warn!(error = %err, "tracer provider shutdown failed");
            }
            if let Err(err) = p.meter.shutdown() {
                warn!(error = %err, "meter provider shutdown failed");
            }
            if let Err(err) = p.logger.shutdown() {
                eprintln!("logger provider shutdown failed: {err}");
            }
        }
    }
}

/// Installs the global subscriber.
///
/// - `log_level` is an `EnvFilter` directive such as `info` or `leadflow=debug`.
/// - With `log_dir`, logs go to a daily rolling text file and per-run reports
///   (target `report`) to a rolling JSON file; otherwise to stdout.
/// - With `otel_endpoint`, logs, traces and metrics are also exported over
///   OTLP/HTTP and the global meter provider is set.
pub fn init_tracing(log_level: &str, log_dir: Option<&Path>, otel_endpoint: Option<&str>) -> Result<Telemetry> {
    let providers = otel_endpoint.map(init_providers).transpose()?;

    let otel_layer = match &providers {
        Some(p) => {
            let filter = quiet_transport(EnvFilter::try_new(log_level)?)?;
            Some(OpenTelemetryTracingBridge::new(&p.logger).with_filter(filter))
        }
        None => None,
    };

    let (text_layer, report_layer) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("could not create log directory {}", dir.display()))?;
            let text = tfmt::layer()
                .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, "leadflow.log"))
                .with_ansi(false);
            let report = tfmt::layer()
                .json()
                .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, "leadflow-report.json"))
                .with_target(true)
                .with_filter(EnvFilter::try_new("report=info")?);
            (Some(text), Some(report))
        }
        None => (None, None),
    };
    let stdout_layer = log_dir.is_none().then(|| tfmt::layer().with_thread_names(true));

    Registry::default()
        .with(EnvFilter::try_new(log_level).with_context(|| format!("invalid log level `{log_level}`"))?)
        .with(otel_layer)
        .with(text_layer)
        .with(report_layer)
        .with(stdout_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    if let Some(p) = &providers {
        global::set_tracer_provider(p.tracer.clone());
        global::set_meter_provider(p.meter.clone());
        info!(endpoint = otel_endpoint.unwrap_or_default(), "OpenTelemetry export enabled");
    }
    Ok(Telemetry { providers })
}

fn quiet_transport(filter: EnvFilter) -> Result<EnvFilter> {
    Ok(filter
        .add_directive("hyper=off".parse()?)
        .add_directive("tonic=off".parse()?)
        .add_directive("h2=off".parse()?)
        .add_directive("reqwest=off".parse()?))
}

fn init_providers(endpoint: &str) -> Result<OtelProviders> {
    let resource = Resource::builder().with_service_name(SERVICE_NAME).build();

    let logs = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("log exporter")?;
    let spans = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("span exporter")?;
    let metrics = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("metric exporter")?;

    Ok(OtelProviders {
        logger: SdkLoggerProvider::builder()
            .with_batch_exporter(logs)
            .with_resource(resource.clone())
            .build(),
        tracer: SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build(),
        meter: SdkMeterProvider::builder()
            .with_periodic_exporter(metrics)
            .with_resource(resource)
            .build(),
    })
}

/// Engine-level instruments. Built from the global meter, so they record
/// nothing until a meter provider is installed.
#[derive(Clone)]
pub struct EngineMetrics {
    pub flow_runs: Counter<u64>,
    pub flow_failures: Counter<u64>,
    pub actions_dispatched: Counter<u64>,
    pub updates_coalesced: Counter<u64>,
    pub coalescer_flushes: Counter<u64>,
    pub batches_released: Counter<u64>,
    pub batch_failures: Counter<u64>,
    pub batch_latency_ms: Histogram<f64>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            flow_runs: meter
                .u64_counter("flow_runs")
                .with_description("Flow executions started")
                .build(),
            flow_failures: meter
                .u64_counter("flow_failures")
                .with_description("Flow executions aborted by an invalid graph or failed action")
                .build(),
            actions_dispatched: meter.u64_counter("actions_dispatched").build(),
            updates_coalesced: meter.u64_counter("updates_coalesced").build(),
            coalescer_flushes: meter.u64_counter("coalescer_flushes").build(),
            batches_released: meter
                .u64_counter("batches_released")
                .with_description("Batches admitted by the rate gate")
                .build(),
            batch_failures: meter.u64_counter("batch_failures").build(),
            batch_latency_ms: meter
                .f64_histogram("batch_latency_ms")
                .with_description("Platform call latency per batch")
                .with_unit("ms")
                .build(),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EngineMetrics")
    }
}
