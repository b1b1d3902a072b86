//! Static inventory: per-GPU board metadata and host versions
//!
//! Published once when the engine starts. The values do not change while
//! the driver is loaded.

use crate::collectors::DeviceIdentity;
use crate::device::{Device, DeviceError, DeviceResult, SystemInfoSource};
use crate::names::{self, labels};
use crate::sink::ObservationSink;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Version reported in `exporter_info` when the embedder sets none
pub const DEFAULT_EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Outcome of one publication
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryReport {
    /// GPUs with a `gpu_info` series
    pub published: usize,
    /// GPUs whose metadata could not be read
    pub failed: Vec<usize>,
    /// Whether `exporter_info` was written
    pub exporter_info: bool,
}

pub struct InventoryPublisher {
    version: String,
    system: Option<Arc<dyn SystemInfoSource>>,
}

impl InventoryPublisher {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            system: None,
        }
    }

    /// Also publish host versions from `source`
    pub fn with_system_info(mut self, source: Arc<dyn SystemInfoSource>) -> Self {
        self.system = Some(source);
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Write `gpu_info` for every readable device and `exporter_info` when a
    /// system source is configured. Failures are logged and skipped.
    pub fn publish(&self, devices: &[Arc<dyn Device>], sink: &dyn ObservationSink) -> InventoryReport {
        let mut report = InventoryReport::default();

        for (index, device) in devices.iter().enumerate() {
            match Self::publish_gpu(device.as_ref(), sink) {
                Ok(()) => report.published += 1,
                Err(DeviceError::NotSupported) => {
                    debug!(gpu = index, "GPU metadata not supported");
                    report.failed.push(index);
                }
                Err(e) => {
                    warn!(gpu = index, error = %e, "Failed to get GPU info");
                    report.failed.push(index);
                }
            }
        }

        if let Some(system) = &self.system {
            match system.system_info() {
                Ok(host) => {
                    let cuda_version = host.cuda_version();
                    sink.set_gauge(
                        names::EXPORTER_INFO,
                        &[
                            (labels::VERSION, self.version.as_str()),
                            (labels::DRIVER_VERSION, host.driver_version.as_str()),
                            (labels::NVML_VERSION, host.library_version.as_str()),
                            (labels::CUDA_VERSION, cuda_version.as_str()),
                        ],
                        1.0,
                    );
                    report.exporter_info = true;
                    info!(
                        version = %self.version,
                        driver = %host.driver_version,
                        cuda = %cuda_version,
                        "Exporter info published"
                    );
                }
                Err(e) => warn!(error = %e, "Failed to get driver versions"),
            }
        }

        report
    }

    fn publish_gpu(device: &dyn Device, sink: &dyn ObservationSink) -> DeviceResult<()> {
        let identity = DeviceIdentity::read(device)?;
        let gpu = device.gpu_info()?;
        sink.set_gauge(
            names::GPU_INFO,
            &[
                (labels::UUID, identity.uuid.as_str()),
                (labels::PCI_BUS_ID, identity.pci_bus_id.as_str()),
                (labels::NAME, gpu.name.as_str()),
                (labels::BRAND, gpu.brand.as_str()),
                (labels::SERIAL, gpu.serial.as_str()),
                (labels::BOARD_ID, gpu.board_id.as_str()),
                (labels::VBIOS_VERSION, gpu.vbios_version.as_str()),
                (labels::OEM_INFOROM_VERSION, gpu.oem_inforom_version.as_str()),
                (labels::ECC_INFOROM_VERSION, gpu.ecc_inforom_version.as_str()),
                (labels::POWER_INFOROM_VERSION, gpu.power_inforom_version.as_str()),
                (labels::INFOROM_IMAGE_VERSION, gpu.inforom_image_version.as_str()),
            ],
            1.0,
        );
        debug!(uuid = %identity.uuid, name = %gpu.name, "GPU info published");
        Ok(())
    }
}

impl Default for InventoryPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EXPORTER_VERSION)
    }
}
