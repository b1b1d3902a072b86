//! NVLink error counters

use super::{pass_result, Collector, DeviceIdentity};
use crate::codec::{interpret, Sample};
use crate::device::{Device, DeviceError};
use crate::fields::{FieldBatch, NVLINK_FIELDS};
use crate::names::{self, labels};
use crate::sink::ObservationSink;
use crate::throttle::{LogDecision, LogThrottle};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, warn};

/// Reads every NVLink error, BER and FEC history counter of every active link
/// with one batched query per device
pub struct NvLinkErrorCollector {
    fallback_max_links: u32,
    throttle: Arc<LogThrottle>,
}

impl NvLinkErrorCollector {
    pub fn new(fallback_max_links: u32, throttle: Arc<LogThrottle>) -> Self {
        Self {
            fallback_max_links,
            throttle,
        }
    }

    fn collect_device(&self, device: &dyn Device, sink: &dyn ObservationSink) -> std::result::Result<(), DeviceError> {
        let identity = DeviceIdentity::read(device)?;
        let max_links = device.max_link_count().unwrap_or(self.fallback_max_links);

        let batch = FieldBatch::build(device, max_links, NVLINK_FIELDS);
        if batch.is_empty() {
            debug!(uuid = %identity.uuid, "No active NVLinks, skipping device");
            return Ok(());
        }

        let results = match batch.query(device) {
            Ok(results) => results,
            Err(DeviceError::NotSupported) => {
                debug!(uuid = %identity.uuid, "NVLink field values not supported");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = batch.check_response(&results) {
            let key = format!("{}/nvlink/response", identity.uuid);
            if let LogDecision::Emit { suppressed } = self.throttle.check(&key) {
                warn!(uuid = %identity.uuid, suppressed = suppressed, error = %e, "Incomplete NVLink field response");
            }
        }

        for &link in batch.active_links() {
            let link_label = link.to_string();
            for descriptor in NVLINK_FIELDS {
                let Some(result) = batch.result(&results, descriptor.field_id, link) else {
                    continue;
                };

                let problem = match interpret(result, descriptor.group.interpretation()) {
                    Ok(Sample::Value(value)) => {
                        sink.set_gauge(
                            names::NVLINK_ERRORS,
                            &[
                                (labels::UUID, identity.uuid.as_str()),
                                (labels::PCI_BUS_ID, identity.pci_bus_id.as_str()),
                                (labels::LINK, link_label.as_str()),
                                (labels::ERROR_TYPE, descriptor.name),
                            ],
                            value,
                        );
                        continue;
                    }
                    Ok(Sample::NotSupported) => continue,
                    Ok(Sample::Failed(e)) => e.to_string(),
                    Err(e) => e.to_string(),
                };

                let key = format!("{}/{}/{}", identity.uuid, link, descriptor.field_id);
                if let LogDecision::Emit { suppressed } = self.throttle.check(&key) {
                    warn!(
                        uuid = %identity.uuid,
                        link = link,
                        field = descriptor.name,
                        suppressed = suppressed,
                        error = %problem,
                        "Failed to read NVLink field"
                    );
                }
            }
        }

        Ok(())
    }
}

impl Collector for NvLinkErrorCollector {
    fn name(&self) -> &'static str {
        "nvlink_errors"
    }

    fn collect(&self, devices: &[Arc<dyn Device>], sink: &dyn ObservationSink) -> Result<()> {
        let mut failed = 0;
        for (index, device) in devices.iter().enumerate() {
            if let Err(e) = self.collect_device(device.as_ref(), sink) {
                failed += 1;
                if let LogDecision::Emit { suppressed } = self.throttle.check(&format!("nvlink/{}", index)) {
                    warn!(gpu = index, suppressed = suppressed, error = %e, "Failed to collect NVLink errors");
                }
            }
        }
        pass_result(self.name(), failed, devices.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ValueType;
    use crate::mock::{mock_pci, mock_uuid, MockDevice};
    use crate::sink::InMemorySink;
    use std::time::Duration;

    fn collector() -> NvLinkErrorCollector {
        NvLinkErrorCollector::new(4, Arc::new(LogThrottle::new(Duration::ZERO)))
    }

    fn labels_for<'a>(uuid: &'a str, bus: &'a str, link: &'a str, kind: &'a str) -> [(&'a str, &'a str); 4] {
        [
            (labels::UUID, uuid),
            (labels::PCI_BUS_ID, bus),
            (labels::LINK, link),
            (labels::ERROR_TYPE, kind),
        ]
    }

    #[test]
    fn test_collects_active_links_in_one_query() {
        let ber = ((5u64 << 8) | 3).to_le_bytes();
        let mock = Arc::new(
            MockDevice::new(0)
                .with_active_links(&[1, 2])
                .with_field_value(206, 1, 4.0)
                .with_field_value(250, 2, 9.0)
                .with_raw_field(220, 1, ValueType::UnsignedLongLong.tag(), ber),
        );
        let devices: Vec<Arc<dyn Device>> = vec![mock.clone()];
        let sink = InMemorySink::new();

        collector().collect(&devices, &sink).unwrap();

        let uuid = mock_uuid(0);
        let bus = mock_pci(0).bus_id();
        assert_eq!(mock.field_query_count(), 1);
        assert_eq!(
            sink.gauge(names::NVLINK_ERRORS, &labels_for(&uuid, &bus, "1", "malformed_packet_errors")),
            Some(4.0)
        );
        assert_eq!(
            sink.gauge(names::NVLINK_ERRORS, &labels_for(&uuid, &bus, "2", "fec_errors_15")),
            Some(9.0)
        );
        assert_eq!(
            sink.gauge(names::NVLINK_ERRORS, &labels_for(&uuid, &bus, "1", "effective_ber_errors")),
            Some(0.005)
        );
        // unsupported fields publish nothing
        assert_eq!(sink.series_count(names::NVLINK_ERRORS), 3);
    }

    #[test]
    fn test_device_without_links_is_not_queried() {
        let mock = Arc::new(MockDevice::new(0));
        let devices: Vec<Arc<dyn Device>> = vec![mock.clone()];
        let sink = InMemorySink::new();

        collector().collect(&devices, &sink).unwrap();
        assert_eq!(mock.field_query_count(), 0);
        assert_eq!(sink.series_count(names::NVLINK_ERRORS), 0);
    }

    #[test]
    fn test_failing_device_does_not_stop_others() {
        let devices: Vec<Arc<dyn Device>> = vec![
            Arc::new(
                MockDevice::new(0)
                    .with_active_links(&[0])
                    .with_field_query_error(DeviceError::GpuLost),
            ),
            Arc::new(MockDevice::new(1).with_uuid_error(DeviceError::Unknown(999))),
            Arc::new(MockDevice::new(2).with_active_links(&[0]).with_field_value(207, 0, 1.0)),
        ];
        let sink = InMemorySink::new();

        let result = collector().collect(&devices, &sink);
        assert!(result.unwrap_err().is_retryable());

        let uuid = mock_uuid(2);
        let bus = mock_pci(2).bus_id();
        assert_eq!(
            sink.gauge(names::NVLINK_ERRORS, &labels_for(&uuid, &bus, "0", "buffer_overrun_errors")),
            Some(1.0)
        );
        assert_eq!(sink.series_count(names::NVLINK_ERRORS), 1);
    }

    #[test]
    fn test_short_response_keeps_answered_fields() {
        let devices: Vec<Arc<dyn Device>> = vec![Arc::new(
            MockDevice::new(0)
                .with_active_links(&[0, 1])
                .with_field_value(206, 0, 1.0)
                .with_field_value(207, 0, 2.0)
                .with_field_value(206, 1, 3.0)
                .with_truncated_results(3),
        )];
        let sink = InMemorySink::new();
        let throttle = Arc::new(LogThrottle::default());

        NvLinkErrorCollector::new(2, Arc::clone(&throttle))
            .collect(&devices, &sink)
            .unwrap();

        let uuid = mock_uuid(0);
        let bus = mock_pci(0).bus_id();
        assert_eq!(sink.series_count(names::NVLINK_ERRORS), 2);
        assert_eq!(
            sink.gauge(names::NVLINK_ERRORS, &labels_for(&uuid, &bus, "1", "malformed_packet_errors")),
            None
        );
        // one throttled warning for the incomplete response
        assert_eq!(throttle.len(), 1);
        assert_eq!(throttle.check(&format!("{}/nvlink/response", uuid)), LogDecision::Suppress);
    }

    #[test]
    fn test_decode_failure_skips_sample() {
        let devices: Vec<Arc<dyn Device>> = vec![Arc::new(
            MockDevice::new(0)
                .with_active_links(&[0])
                .with_raw_field(206, 0, 42, [0; 8])
                .with_field_value(207, 0, 2.0),
        )];
        let sink = InMemorySink::new();

        collector().collect(&devices, &sink).unwrap();
        assert_eq!(sink.series_count(names::NVLINK_ERRORS), 1);
    }
}
