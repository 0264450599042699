//! Telemetry hooks: OTLP metrics for activations and pool state.
//!
//! Emission is fire-and-forget through the OpenTelemetry SDK; a saturated
//! exporter drops samples and never blocks pool decisions.

use anyhow::Result;
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, UpDownCounter},
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
};

use crate::{config::TelemetryConfig, objects::ActivationStatus};

/// Install the global OTLP meter provider. Must run before any metric is
/// recorded; a no-op when metrics are disabled.
pub fn init_provider(config: &TelemetryConfig, invoker_id: &str) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.name", "invokerd"))
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .with_attribute(KeyValue::new("invoker.id", invoker_id.to_string()))
        .build();

    let mut exporter_builder = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = &config.endpoint {
        exporter_builder = exporter_builder.with_endpoint(endpoint.clone());
    }
    let exporter = exporter_builder.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(config.metrics_interval())
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);

    tracing::info!(
        invoker_id,
        endpoint = ?config.endpoint,
        interval_s = config.metrics_interval_s,
        "metrics provider initialized"
    );

    Ok(())
}

#[derive(Clone)]
pub struct Counters {
    pub activations: Counter<u64>,
    pub cold_starts: Counter<u64>,
    pub containers_created: Counter<u64>,
    pub containers_destroyed: Counter<u64>,
    pub prewarm_refills: Counter<u64>,
    pub concurrent_limit_hits: Counter<u64>,
    pub timed_limit_hits: Counter<u64>,
    pub feed_rejections: Counter<u64>,
}

#[derive(Clone)]
pub struct Histograms {
    pub wait_time_ms: Histogram<f64>,
    pub init_time_ms: Histogram<f64>,
    pub run_duration_ms: Histogram<f64>,
    pub response_size_bytes: Histogram<f64>,
}

#[derive(Clone)]
pub struct Gauges {
    pub memory_used_mb: UpDownCounter<i64>,
    pub containers_free: UpDownCounter<i64>,
    pub containers_busy: UpDownCounter<i64>,
}

pub struct InvokerMetrics {
    pub counters: Counters,
    pub histograms: Histograms,
    pub gauges: Gauges,
}

impl InvokerMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("invokerd");

        let counters = Counters {
            activations: meter
                .u64_counter("invokerd.activations")
                .with_description("Activations completed, by status")
                .build(),
            cold_starts: meter
                .u64_counter("invokerd.cold_starts")
                .with_description("Activations that required container init")
                .build(),
            containers_created: meter
                .u64_counter("invokerd.containers.created")
                .with_description("Containers created")
                .build(),
            containers_destroyed: meter
                .u64_counter("invokerd.containers.destroyed")
                .with_description("Containers destroyed")
                .build(),
            prewarm_refills: meter
                .u64_counter("invokerd.prewarm.refills")
                .with_description("Prewarm containers created to refill pools")
                .build(),
            concurrent_limit_hits: meter
                .u64_counter("invokerd.concurrent_limit_hits")
                .with_description("Warm containers skipped because in-flight was at the limit")
                .build(),
            timed_limit_hits: meter
                .u64_counter("invokerd.timed_limit_hits")
                .with_description("Activations terminated at the action time limit")
                .build(),
            feed_rejections: meter
                .u64_counter("invokerd.feed.rejections")
                .with_description("Pool rejections observed by the feed")
                .build(),
        };

        let histograms = Histograms {
            wait_time_ms: meter
                .f64_histogram("invokerd.wait_time_ms")
                .with_description("Time from message arrival to run start")
                .build(),
            init_time_ms: meter
                .f64_histogram("invokerd.init_time_ms")
                .with_description("Container init duration")
                .build(),
            run_duration_ms: meter
                .f64_histogram("invokerd.run_duration_ms")
                .with_description("User code run duration")
                .build(),
            response_size_bytes: meter
                .f64_histogram("invokerd.response_size_bytes")
                .with_description("Activation response size")
                .build(),
        };

        let gauges = Gauges {
            memory_used_mb: meter
                .i64_up_down_counter("invokerd.memory_used_mb")
                .with_description("Aggregate memory reserved by containers")
                .build(),
            containers_free: meter
                .i64_up_down_counter("invokerd.containers.free")
                .with_description("Idle warm or prewarmed containers")
                .build(),
            containers_busy: meter
                .i64_up_down_counter("invokerd.containers.busy")
                .with_description("Containers with at least one in-flight activation")
                .build(),
        };

        Self {
            counters,
            histograms,
            gauges,
        }
    }

    pub fn record_activation(&self, status: ActivationStatus) {
        self.counters
            .activations
            .add(1, &[KeyValue::new("status", status.as_str())]);
    }
}

impl Default for InvokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
