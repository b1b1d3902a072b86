//! # nvgpu-telemetry
//!
//! GPU health and error telemetry acquisition for NVLink fabrics.
//!
//! This crate provides:
//! - Decoding of tagged field values, bit error rates and fabric health masks
//! - Batched per-link field requests
//! - NVLink error, fabric health, clock event and topology collectors
//! - A fixed-interval polling scheduler and a critical fault (Xid) event loop
//! - GPU and driver inventory published once at startup
//!
//! Devices are supplied by the caller through the [`Device`] trait and samples
//! are written to an [`ObservationSink`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use nvgpu_telemetry::{CollectorConfig, Device, FaultEventBus, InMemorySink, TelemetryEngine};
//! use std::sync::Arc;
//!
//! async fn run(
//!     devices: Vec<Arc<dyn Device>>,
//!     bus: Arc<dyn FaultEventBus>,
//! ) -> nvgpu_telemetry::Result<()> {
//!     let sink = Arc::new(InMemorySink::new());
//!     let mut engine = TelemetryEngine::new(CollectorConfig::default(), devices, sink)?;
//!     engine.start(Some(bus)).await?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub mod codec;
pub mod collectors;
pub mod config;
pub mod device;
pub mod engine;
pub mod events;
pub mod fields;
pub mod health_mask;
pub mod inventory;
pub mod names;
pub mod scheduler;
pub mod sink;
pub mod throttle;
pub mod topology;

// Mock implementation for testing
#[cfg(any(feature = "mock", test))]
pub mod mock;

pub use codec::DecodeError;
pub use collectors::Collector;
pub use config::{CollectorConfig, CollectorToggles, OverlapPolicy, TopologyMode};
pub use device::{
    Device, DeviceError, DeviceResult, EventSource, FaultEvent, FaultEventBus, GpuInfo, PciInfo, SystemInfo,
    SystemInfoSource,
};
pub use engine::TelemetryEngine;
pub use events::{EventCollector, FaultCounts, FaultRecord};
pub use health_mask::{FabricHealthMask, HealthSummary};
pub use inventory::{InventoryPublisher, InventoryReport};
pub use scheduler::{PassReport, PollingScheduler, SchedulerState};
pub use sink::{InMemorySink, ObservationSink};
pub use topology::{TopologyGraph, TopologyGraphBuilder};

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Errors that can occur while acquiring telemetry
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Transient query failure: {0}")]
    TransientQuery(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Initialization failed: {0}")]
    FatalInit(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TelemetryError {
    /// Check if the next scheduled tick may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, TelemetryError::TransientQuery(_))
    }

    /// Check if this error must stop startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TelemetryError::FatalInit(_) | TelemetryError::Configuration(_)
        )
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, TelemetryError::NotSupported(_))
    }
}

impl From<DeviceError> for TelemetryError {
    fn from(error: DeviceError) -> Self {
        match error {
            DeviceError::NotSupported => TelemetryError::NotSupported(error.to_string()),
            other => TelemetryError::TransientQuery(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_error_properties() {
        let transient = TelemetryError::TransientQuery("timeout".to_string());
        assert!(transient.is_retryable());
        assert!(!transient.is_fatal());
        assert!(!transient.is_not_supported());

        let fatal = TelemetryError::FatalInit("no devices".to_string());
        assert!(!fatal.is_retryable());
        assert!(fatal.is_fatal());

        let decode: TelemetryError = DecodeError::UnsupportedValueType(9).into();
        assert!(!decode.is_retryable());
        assert!(!decode.is_fatal());
    }

    #[test]
    fn test_from_device_error() {
        assert!(TelemetryError::from(DeviceError::NotSupported).is_not_supported());
        assert!(TelemetryError::from(DeviceError::GpuLost).is_retryable());
        assert!(TelemetryError::from(DeviceError::Unknown(999)).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let error = TelemetryError::FatalInit("event set".to_string());
        assert_eq!(error.to_string(), "Initialization failed: event set");

        let error: TelemetryError = DecodeError::TruncatedBuffer { needed: 8, available: 2 }.into();
        assert_eq!(
            error.to_string(),
            "Decode error: truncated buffer: need 8 bytes, have 2"
        );
    }
}
