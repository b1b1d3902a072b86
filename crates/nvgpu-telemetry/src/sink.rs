//! Observation sink
//!
//! Collectors never touch a global registry. They write through an
//! `ObservationSink` handed to them at construction.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Destination for collected samples. Must tolerate concurrent writers.
pub trait ObservationSink: Send + Sync {
    /// Set a gauge; the last write for a label set wins
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);

    /// Increment a counter by one
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]);

    /// Drop every series recorded under `name`
    fn reset(&self, name: &str);
}

/// Sorted, owned label set
pub type LabelSet = BTreeMap<String, String>;

fn label_set(labels: &[(&str, &str)]) -> LabelSet {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// In-memory recorder
#[derive(Default)]
pub struct InMemorySink {
    gauges: RwLock<HashMap<String, HashMap<LabelSet, f64>>>,
    counters: RwLock<HashMap<String, HashMap<LabelSet, u64>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges
            .read()
            .get(name)
            .and_then(|series| series.get(&label_set(labels)).copied())
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        self.counters
            .read()
            .get(name)
            .and_then(|series| series.get(&label_set(labels)).copied())
    }

    /// All gauge series recorded under `name`
    pub fn gauges(&self, name: &str) -> Vec<(LabelSet, f64)> {
        let mut series: Vec<_> = self
            .gauges
            .read()
            .get(name)
            .map(|s| s.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        series.sort_by(|a, b| a.0.cmp(&b.0));
        series
    }

    /// All counter series recorded under `name`
    pub fn counters(&self, name: &str) -> Vec<(LabelSet, u64)> {
        let mut series: Vec<_> = self
            .counters
            .read()
            .get(name)
            .map(|s| s.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        series.sort_by(|a, b| a.0.cmp(&b.0));
        series
    }

    pub fn series_count(&self, name: &str) -> usize {
        let gauges = self.gauges.read().get(name).map_or(0, |s| s.len());
        let counters = self.counters.read().get(name).map_or(0, |s| s.len());
        gauges + counters
    }

    pub fn clear(&self) {
        self.gauges.write().clear();
        self.counters.write().clear();
    }
}

impl ObservationSink for InMemorySink {
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges
            .write()
            .entry(name.to_string())
            .or_default()
            .insert(label_set(labels), value);
    }

    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        *self
            .counters
            .write()
            .entry(name.to_string())
            .or_default()
            .entry(label_set(labels))
            .or_insert(0) += 1;
    }

    fn reset(&self, name: &str) {
        self.gauges.write().remove(name);
        self.counters.write().remove(name);
    }
}
