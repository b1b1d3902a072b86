//! # nvgpu-metrics
//!
//! Prometheus exposition for nvgpu-telemetry.
//!
//! [`PrometheusSink`] implements [`nvgpu_telemetry::ObservationSink`] on top
//! of a `prometheus::Registry` with one predeclared family per telemetry
//! metric, all under the `nvgpu_` namespace. Serving the text exposition over
//! HTTP is left to the embedding process.
//!
//! ```rust,no_run
//! use nvgpu_metrics::PrometheusSink;
//! use nvgpu_telemetry::{CollectorConfig, Device, TelemetryEngine};
//! use std::sync::Arc;
//!
//! async fn run(devices: Vec<Arc<dyn Device>>) -> Result<String, Box<dyn std::error::Error>> {
//!     let sink = Arc::new(PrometheusSink::new()?);
//!     let mut engine = TelemetryEngine::new(CollectorConfig::default(), devices, sink.clone())?;
//!     engine.start(None).await?;
//!     Ok(sink.export_text()?)
//! }
//! ```

pub mod common;
pub mod prometheus_metrics;

pub use common::{MetricFamilies, MetricFamily};
pub use prometheus_metrics::PrometheusSink;

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Registry error: {0}")]
    Registry(#[from] prometheus::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
