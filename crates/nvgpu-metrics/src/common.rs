//! Predeclared metric families for every telemetry metric name

use nvgpu_telemetry::names::{MetricSpec, METRICS, NAMESPACE};
use prometheus::{CounterVec, GaugeVec, Opts, Registry};
use std::collections::HashMap;

/// One Prometheus vector with its fixed label order
#[derive(Clone)]
pub enum MetricFamily {
    Gauge(GaugeVec),
    Counter(CounterVec),
}

impl MetricFamily {
    fn new(spec: &MetricSpec) -> prometheus::Result<Self> {
        let opts = Opts::new(spec.name, spec.help).namespace(NAMESPACE);
        if spec.counter {
            Ok(MetricFamily::Counter(CounterVec::new(opts, spec.labels)?))
        } else {
            Ok(MetricFamily::Gauge(GaugeVec::new(opts, spec.labels)?))
        }
    }

    fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        match self {
            MetricFamily::Gauge(vec) => registry.register(Box::new(vec.clone())),
            MetricFamily::Counter(vec) => registry.register(Box::new(vec.clone())),
        }
    }

    /// Drop every series of this family
    pub fn reset(&self) {
        match self {
            MetricFamily::Gauge(vec) => vec.reset(),
            MetricFamily::Counter(vec) => vec.reset(),
        }
    }
}

/// A declared family together with the label names it expects
#[derive(Clone)]
pub struct Declared {
    pub family: MetricFamily,
    pub labels: &'static [&'static str],
}

impl Declared {
    /// Reorder `labels` into declaration order.
    ///
    /// Returns `None` when a declared label is missing or an undeclared one
    /// is present.
    pub fn label_values<'a>(&self, labels: &[(&str, &'a str)]) -> Option<Vec<&'a str>> {
        if labels.len() != self.labels.len() {
            return None;
        }
        self.labels
            .iter()
            .map(|name| labels.iter().find(|(key, _)| key == name).map(|(_, value)| *value))
            .collect()
    }
}

/// Every telemetry metric, keyed by its unprefixed name
#[derive(Clone)]
pub struct MetricFamilies {
    families: HashMap<&'static str, Declared>,
}

impl MetricFamilies {
    pub fn new() -> prometheus::Result<Self> {
        let mut families = HashMap::with_capacity(METRICS.len());
        for spec in METRICS {
            families.insert(
                spec.name,
                Declared {
                    family: MetricFamily::new(spec)?,
                    labels: spec.labels,
                },
            );
        }
        Ok(Self { families })
    }

    /// Register all families with the given registry
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        for declared in self.families.values() {
            declared.family.register(registry)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Declared> {
        self.families.get(name)
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}
