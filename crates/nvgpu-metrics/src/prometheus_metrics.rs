//! Prometheus-backed observation sink

use crate::common::{MetricFamilies, MetricFamily};
use crate::{MetricsError, Result};
use nvgpu_telemetry::throttle::{LogDecision, LogThrottle};
use nvgpu_telemetry::ObservationSink;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Observation sink writing into a Prometheus registry.
///
/// Every telemetry metric is declared up front with a fixed label set.
/// Samples for unknown names or with a mismatched label set are dropped.
pub struct PrometheusSink {
    registry: Registry,
    families: MetricFamilies,
    dropped: AtomicU64,
    throttle: LogThrottle,
}

impl PrometheusSink {
    /// Create a sink with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create a sink registering its families into `registry`
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let families = MetricFamilies::new()?;
        families.register(&registry)?;
        debug!(families = families.len(), "Registered telemetry metric families");

        Ok(Self {
            registry,
            families,
            dropped: AtomicU64::new(0),
            throttle: LogThrottle::new(Duration::from_secs(300)),
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of samples dropped because of an unknown name or bad labels
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Export metrics as Prometheus text format
    pub fn export_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }

    /// Content type of [`export_text`](Self::export_text)
    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }

    fn drop_sample(&self, name: &str, labels: &[(&str, &str)], reason: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        if let LogDecision::Emit { suppressed } = self.throttle.check(&format!("{}/{}", name, reason)) {
            let keys: Vec<&str> = labels.iter().map(|(key, _)| *key).collect();
            warn!(
                metric = name,
                labels = ?keys,
                suppressed = suppressed,
                reason = reason,
                "Dropping telemetry sample"
            );
        }
    }
}

impl ObservationSink for PrometheusSink {
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let Some(declared) = self.families.get(name) else {
            self.drop_sample(name, labels, "unknown metric");
            return;
        };
        let MetricFamily::Gauge(vec) = &declared.family else {
            self.drop_sample(name, labels, "not a gauge");
            return;
        };
        let Some(values) = declared.label_values(labels) else {
            self.drop_sample(name, labels, "label mismatch");
            return;
        };
        match vec.get_metric_with_label_values(&values) {
            Ok(gauge) => gauge.set(value),
            Err(e) => self.drop_sample(name, labels, &e.to_string()),
        }
    }

    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let Some(declared) = self.families.get(name) else {
            self.drop_sample(name, labels, "unknown metric");
            return;
        };
        let MetricFamily::Counter(vec) = &declared.family else {
            self.drop_sample(name, labels, "not a counter");
            return;
        };
        let Some(values) = declared.label_values(labels) else {
            self.drop_sample(name, labels, "label mismatch");
            return;
        };
        match vec.get_metric_with_label_values(&values) {
            Ok(counter) => counter.inc(),
            Err(e) => self.drop_sample(name, labels, &e.to_string()),
        }
    }

    fn reset(&self, name: &str) {
        match self.families.get(name) {
            Some(declared) => declared.family.reset(),
            None => self.drop_sample(name, &[], "unknown metric"),
        }
    }
}
