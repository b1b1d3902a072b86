//! Fabric state and health

use super::{pass_result, Collector, DeviceIdentity};
use crate::device::{uuid_bytes_to_string, Device, DeviceError};
use crate::health_mask::{FabricHealthMask, MaskValue};
use crate::names::{self, labels};
use crate::sink::ObservationSink;
use crate::throttle::{LogDecision, LogThrottle};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct FabricHealthCollector {
    throttle: Arc<LogThrottle>,
}

impl FabricHealthCollector {
    pub fn new(throttle: Arc<LogThrottle>) -> Self {
        Self { throttle }
    }

    fn collect_device(&self, device: &dyn Device, sink: &dyn ObservationSink) -> std::result::Result<(), DeviceError> {
        let identity = DeviceIdentity::read(device)?;
        let info = match device.fabric_info() {
            Ok(info) => info,
            Err(DeviceError::NotSupported) => {
                debug!(uuid = %identity.uuid, "Fabric info not supported");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let clique_id = info.clique_id.to_string();
        let cluster_uuid = uuid_bytes_to_string(&info.cluster_uuid);
        let base = [
            (labels::UUID, identity.uuid.as_str()),
            (labels::PCI_BUS_ID, identity.pci_bus_id.as_str()),
            (labels::CLIQUE_ID, clique_id.as_str()),
            (labels::CLUSTER_UUID, cluster_uuid.as_str()),
        ];

        sink.set_gauge(names::FABRIC_STATE, &base, f64::from(info.state));
        sink.set_gauge(names::FABRIC_STATUS, &base, f64::from(info.status));

        let mask = FabricHealthMask::decode(info.health_mask);
        for (field, value) in mask.flags() {
            let MaskValue::Flag(set) = value else {
                continue;
            };
            let mut flag_labels = base.to_vec();
            flag_labels.push((labels::HEALTH_FIELD, field));
            sink.set_gauge(names::FABRIC_HEALTH, &flag_labels, if set { 0.0 } else { 1.0 });
        }

        if let MaskValue::Code(code) = mask.incorrect_configuration {
            sink.set_gauge(names::FABRIC_INCORRECT_CONFIGURATION, &base, f64::from(code));
        }

        let summary = mask.summary();
        sink.set_gauge(names::FABRIC_HEALTH_SUMMARY, &base, f64::from(summary.code()));
        debug!(uuid = %identity.uuid, summary = %summary, "Fabric health collected");
        Ok(())
    }
}

impl Collector for FabricHealthCollector {
    fn name(&self) -> &'static str {
        "fabric_health"
    }

    fn collect(&self, devices: &[Arc<dyn Device>], sink: &dyn ObservationSink) -> Result<()> {
        let mut failed = 0;
        for (index, device) in devices.iter().enumerate() {
            if let Err(e) = self.collect_device(device.as_ref(), sink) {
                failed += 1;
                if let LogDecision::Emit { suppressed } = self.throttle.check(&format!("fabric/{}", index)) {
                    warn!(gpu = index, suppressed = suppressed, error = %e, "Failed to collect fabric health");
                }
            }
        }
        pass_result(self.name(), failed, devices.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FabricInfo;
    use crate::health_mask::{FLAG_FALSE, FLAG_TRUE};
    use crate::mock::{mock_pci, mock_uuid, MockDevice};
    use crate::sink::InMemorySink;
    use std::time::Duration;

    fn fabric(health_mask: u32) -> FabricInfo {
        FabricInfo {
            cluster_uuid: [0xab; 16],
            clique_id: 7,
            state: 3,
            status: 0,
            health_mask,
        }
    }

    fn collect(devices: Vec<Arc<dyn Device>>) -> (InMemorySink, Result<()>) {
        let sink = InMemorySink::new();
        let collector = FabricHealthCollector::new(Arc::new(LogThrottle::new(Duration::ZERO)));
        let result = collector.collect(&devices, &sink);
        (sink, result)
    }

    #[test]
    fn test_fabric_metrics() {
        // degraded bandwidth true, route recovery unsupported, others false, config none
        let mask = FLAG_TRUE | (FLAG_FALSE << 4) | (FLAG_FALSE << 6) | (1 << 8);
        let (sink, result) = collect(vec![Arc::new(MockDevice::new(0).with_fabric_info(fabric(mask)))]);
        result.unwrap();

        let uuid = mock_uuid(0);
        let bus = mock_pci(0).bus_id();
        let cluster = "abababab-abab-abab-abab-abababababab";
        let base = [
            (labels::UUID, uuid.as_str()),
            (labels::PCI_BUS_ID, bus.as_str()),
            (labels::CLIQUE_ID, "7"),
            (labels::CLUSTER_UUID, cluster),
        ];

        assert_eq!(sink.gauge(names::FABRIC_STATE, &base), Some(3.0));
        assert_eq!(sink.gauge(names::FABRIC_STATUS, &base), Some(0.0));
        assert_eq!(sink.gauge(names::FABRIC_HEALTH_SUMMARY, &base), Some(3.0));
        assert_eq!(sink.gauge(names::FABRIC_INCORRECT_CONFIGURATION, &base), Some(1.0));

        let flag = |field: &'static str| {
            let mut flag_labels = base.to_vec();
            flag_labels.push((labels::HEALTH_FIELD, field));
            sink.gauge(names::FABRIC_HEALTH, &flag_labels)
        };
        assert_eq!(flag("degraded_bandwidth"), Some(0.0));
        assert_eq!(flag("route_recovery"), None);
        assert_eq!(flag("route_unhealthy"), Some(1.0));
        assert_eq!(flag("access_timeout_recovery"), Some(1.0));
    }

    #[test]
    fn test_all_unsupported_mask() {
        let (sink, result) = collect(vec![Arc::new(MockDevice::new(0).with_fabric_info(fabric(0)))]);
        result.unwrap();

        assert_eq!(sink.series_count(names::FABRIC_HEALTH), 0);
        assert_eq!(sink.series_count(names::FABRIC_INCORRECT_CONFIGURATION), 0);
        let summaries = sink.gauges(names::FABRIC_HEALTH_SUMMARY);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].1, 0.0);
    }

    #[test]
    fn test_unsupported_fabric_is_skipped() {
        let (sink, result) = collect(vec![
            Arc::new(MockDevice::new(0)),
            Arc::new(MockDevice::new(1).with_fabric_error(DeviceError::GpuLost)),
            Arc::new(MockDevice::new(2).with_fabric_info(fabric(0))),
        ]);

        assert!(result.is_err());
        assert_eq!(sink.series_count(names::FABRIC_STATE), 1);
    }
}
