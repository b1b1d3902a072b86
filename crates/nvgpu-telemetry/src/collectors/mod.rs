//! Built-in collectors
//!
//! Each collector reads one family of telemetry from every device and writes
//! samples to the sink. A failing device is logged and skipped; the rest of
//! the pass continues.

use crate::device::{Device, DeviceResult};
use crate::sink::ObservationSink;
use crate::Result;
use std::sync::Arc;

pub mod clock_events;
pub mod fabric;
pub mod nvlink;
pub mod topology;

pub use clock_events::ClockEventCollector;
pub use fabric::FabricHealthCollector;
pub use nvlink::NvLinkErrorCollector;
pub use topology::TopologyCollector;

/// One unit of work run by the polling scheduler on every pass
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Collect from all devices.
    ///
    /// Returns an error when at least one device could not be read; samples
    /// from the other devices are still written.
    fn collect(&self, devices: &[Arc<dyn Device>], sink: &dyn ObservationSink) -> Result<()>;
}

/// Labels every per-device sample carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub uuid: String,
    pub pci_bus_id: String,
}

impl DeviceIdentity {
    pub fn read(device: &dyn Device) -> DeviceResult<Self> {
        let uuid = device.uuid()?;
        let pci_bus_id = device.pci_info()?.bus_id();
        Ok(Self { uuid, pci_bus_id })
    }
}

/// Turn a per-device failure count into the collector result
pub(crate) fn pass_result(collector: &str, failed: usize, total: usize) -> Result<()> {
    if failed == 0 {
        Ok(())
    } else {
        Err(crate::TelemetryError::TransientQuery(format!(
            "{}: {} of {} devices failed",
            collector, failed, total
        )))
    }
}
