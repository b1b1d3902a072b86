//! Clock event (throttle reason) durations

use super::{pass_result, Collector, DeviceIdentity};
use crate::codec::{interpret, Sample};
use crate::device::{Device, DeviceError};
use crate::fields::{FieldBatch, CLOCK_EVENT_FIELDS};
use crate::names::{self, labels};
use crate::sink::ObservationSink;
use crate::throttle::{LogDecision, LogThrottle};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ClockEventCollector {
    batch: FieldBatch,
    throttle: Arc<LogThrottle>,
}

impl ClockEventCollector {
    pub fn new(throttle: Arc<LogThrottle>) -> Self {
        Self {
            batch: FieldBatch::device_scoped(CLOCK_EVENT_FIELDS),
            throttle,
        }
    }

    fn collect_device(&self, device: &dyn Device, sink: &dyn ObservationSink) -> std::result::Result<(), DeviceError> {
        let identity = DeviceIdentity::read(device)?;
        let results = match self.batch.query(device) {
            Ok(results) => results,
            Err(DeviceError::NotSupported) => {
                debug!(uuid = %identity.uuid, "Clock event fields not supported");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = self.batch.check_response(&results) {
            self.warn_field(&identity, "response", &e.to_string());
        }

        for descriptor in CLOCK_EVENT_FIELDS {
            let Some(result) = self.batch.result(&results, descriptor.field_id, 0) else {
                continue;
            };
            match interpret(result, descriptor.group.interpretation()) {
                Ok(Sample::Value(seconds)) => sink.set_gauge(
                    names::CLOCK_EVENT_DURATION,
                    &[
                        (labels::UUID, identity.uuid.as_str()),
                        (labels::PCI_BUS_ID, identity.pci_bus_id.as_str()),
                        (labels::REASON, descriptor.name),
                    ],
                    seconds,
                ),
                Ok(Sample::NotSupported) => {}
                Ok(Sample::Failed(e)) => self.warn_field(&identity, descriptor.name, &e.to_string()),
                Err(e) => self.warn_field(&identity, descriptor.name, &e.to_string()),
            }
        }
        Ok(())
    }

    fn warn_field(&self, identity: &DeviceIdentity, reason: &str, error: &str) {
        let key = format!("{}/clock/{}", identity.uuid, reason);
        if let LogDecision::Emit { suppressed } = self.throttle.check(&key) {
            warn!(
                uuid = %identity.uuid,
                reason = reason,
                suppressed = suppressed,
                error = error,
                "Failed to read clock event field"
            );
        }
    }
}

impl Collector for ClockEventCollector {
    fn name(&self) -> &'static str {
        "clock_events"
    }

    fn collect(&self, devices: &[Arc<dyn Device>], sink: &dyn ObservationSink) -> Result<()> {
        let mut failed = 0;
        for (index, device) in devices.iter().enumerate() {
            if let Err(e) = self.collect_device(device.as_ref(), sink) {
                failed += 1;
                if let LogDecision::Emit { suppressed } = self.throttle.check(&format!("clock/{}", index)) {
                    warn!(gpu = index, suppressed = suppressed, error = %e, "Failed to collect clock events");
                }
            }
        }
        pass_result(self.name(), failed, devices.len())
    }
}
