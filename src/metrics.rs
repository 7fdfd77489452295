//! Prometheus counters for engine activity.
//!
//! The registry is rendered in text exposition format on request; nothing
//! here opens a socket.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::error::ErrorKind;

pub struct Metrics {
    registry: Registry,
    pub model_loads: IntCounter,
    pub model_releases: IntCounter,
    pub load_failures: IntCounter,
    pub generations: IntCounterVec,
    pub generation_seconds: Histogram,
    pub queue_wait_seconds: Histogram,
    pub catalog_models: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("airlock".to_string()), None)?;

        let model_loads = IntCounter::new("model_loads_total", "Models loaded from disk")?;
        let model_releases =
            IntCounter::new("model_releases_total", "Resident models released on swap")?;
        let load_failures = IntCounter::new("model_load_failures_total", "Failed model loads")?;
        let generations = IntCounterVec::new(
            Opts::new("generations_total", "Generate requests by outcome"),
            &["outcome"],
        )?;
        let generation_seconds = Histogram::with_opts(
            HistogramOpts::new("generation_seconds", "Time spent in native generation")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )?;
        let queue_wait_seconds = Histogram::with_opts(
            HistogramOpts::new("queue_wait_seconds", "Time spent waiting for the engine")
                .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        )?;
        let catalog_models = IntGauge::new("catalog_models", "Models in the latest scan")?;

        registry.register(Box::new(model_loads.clone()))?;
        registry.register(Box::new(model_releases.clone()))?;
        registry.register(Box::new(load_failures.clone()))?;
        registry.register(Box::new(generations.clone()))?;
        registry.register(Box::new(generation_seconds.clone()))?;
        registry.register(Box::new(queue_wait_seconds.clone()))?;
        registry.register(Box::new(catalog_models.clone()))?;

        Ok(Self {
            registry,
            model_loads,
            model_releases,
            load_failures,
            generations,
            generation_seconds,
            queue_wait_seconds,
            catalog_models,
        })
    }

    pub fn record_success(&self) {
        self.generations.with_label_values(&["ok"]).inc();
    }

    pub fn record_failure(&self, kind: ErrorKind) {
        self.generations.with_label_values(&[kind.as_str()]).inc();
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
