//! Batched field requests
//!
//! One device query covers every (active link, field) pair. The batch keeps
//! a `(field_id, scope) -> position` index so results can be looked up
//! without rescanning.

use crate::codec::{DecodeError, Interpretation};
use crate::device::{Device, DeviceError, FieldRequest, FieldResult, LinkState};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Logical group a field belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldGroup {
    ErrorCounter,
    Ber,
    FecHistory,
    ClockEvent,
}

impl FieldGroup {
    pub fn interpretation(&self) -> Interpretation {
        match self {
            FieldGroup::ErrorCounter | FieldGroup::FecHistory => Interpretation::Numeric,
            FieldGroup::Ber => Interpretation::BitErrorRate,
            FieldGroup::ClockEvent => Interpretation::NanosToSeconds,
        }
    }
}

/// A named telemetry field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub field_id: u32,
    pub name: &'static str,
    pub group: FieldGroup,
}

const fn field(field_id: u32, name: &'static str, group: FieldGroup) -> FieldDescriptor {
    FieldDescriptor { field_id, name, group }
}

/// Per-link NVLink counters
pub const NVLINK_FIELDS: &[FieldDescriptor] = &[
    field(206, "malformed_packet_errors", FieldGroup::ErrorCounter),
    field(207, "buffer_overrun_errors", FieldGroup::ErrorCounter),
    field(211, "local_link_integrity_errors", FieldGroup::ErrorCounter),
    field(213, "recovery_successful_events", FieldGroup::ErrorCounter),
    field(214, "recovery_failed_events", FieldGroup::ErrorCounter),
    field(215, "recovery_events", FieldGroup::ErrorCounter),
    field(219, "effective_errors", FieldGroup::ErrorCounter),
    field(220, "effective_ber_errors", FieldGroup::Ber),
    field(235, "fec_errors_0", FieldGroup::FecHistory),
    field(236, "fec_errors_1", FieldGroup::FecHistory),
    field(237, "fec_errors_2", FieldGroup::FecHistory),
    field(238, "fec_errors_3", FieldGroup::FecHistory),
    field(239, "fec_errors_4", FieldGroup::FecHistory),
    field(240, "fec_errors_5", FieldGroup::FecHistory),
    field(241, "fec_errors_6", FieldGroup::FecHistory),
    field(242, "fec_errors_7", FieldGroup::FecHistory),
    field(243, "fec_errors_8", FieldGroup::FecHistory),
    field(244, "fec_errors_9", FieldGroup::FecHistory),
    field(245, "fec_errors_10", FieldGroup::FecHistory),
    field(246, "fec_errors_11", FieldGroup::FecHistory),
    field(247, "fec_errors_12", FieldGroup::FecHistory),
    field(248, "fec_errors_13", FieldGroup::FecHistory),
    field(249, "fec_errors_14", FieldGroup::FecHistory),
    field(250, "fec_errors_15", FieldGroup::FecHistory),
];

/// Device-scoped clock event counters, in nanoseconds
pub const CLOCK_EVENT_FIELDS: &[FieldDescriptor] = &[
    field(119, "sw_power_capping", FieldGroup::ClockEvent),
    field(121, "sync_boost", FieldGroup::ClockEvent),
    field(251, "sw_thermal_slowdown", FieldGroup::ClockEvent),
    field(252, "hw_thermal_slowdown", FieldGroup::ClockEvent),
    field(253, "hw_power_braking", FieldGroup::ClockEvent),
];

/// An ordered request batch for one device plus its lookup index
#[derive(Debug, Clone, Default)]
pub struct FieldBatch {
    requests: Vec<FieldRequest>,
    index: HashMap<(u32, u32), usize>,
    scopes: Vec<u32>,
}

impl FieldBatch {
    /// Build a batch covering every active link of `device` below `max_links`.
    ///
    /// Links whose state query fails with `NotSupported` or `InvalidArgument`
    /// are skipped silently; other failures are logged and skipped.
    pub fn build(device: &dyn Device, max_links: u32, fields: &[FieldDescriptor]) -> Self {
        let mut active = Vec::new();
        for link in 0..max_links {
            match device.link_state(link) {
                Ok(LinkState::Enabled) => active.push(link),
                Ok(LinkState::Disabled) => {
                    debug!(link = link, "NVLink not enabled, skipping");
                }
                Err(e) if e.is_expected_link_failure() => {}
                Err(e) => {
                    warn!(link = link, error = %e, "Failed to query NVLink state");
                }
            }
        }
        Self::from_active_links(&active, fields)
    }

    /// Build a batch for an already known set of active links
    pub fn from_active_links(links: &[u32], fields: &[FieldDescriptor]) -> Self {
        let mut batch = FieldBatch {
            requests: Vec::with_capacity(links.len() * fields.len()),
            index: HashMap::with_capacity(links.len() * fields.len()),
            scopes: links.to_vec(),
        };
        for &link in links {
            for descriptor in fields {
                batch.push(descriptor.field_id, link);
            }
        }
        batch
    }

    /// Build a batch of device-scoped fields (scope 0)
    pub fn device_scoped(fields: &[FieldDescriptor]) -> Self {
        Self::from_active_links(&[0], fields)
    }

    fn push(&mut self, field_id: u32, scope_id: u32) {
        let previous = self.index.insert((field_id, scope_id), self.requests.len());
        debug_assert!(
            previous.is_none(),
            "field {} requested twice for scope {}",
            field_id,
            scope_id
        );
        self.requests.push(FieldRequest { field_id, scope_id });
    }

    pub fn requests(&self) -> &[FieldRequest] {
        &self.requests
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Links (or scopes) covered by this batch, ascending
    pub fn active_links(&self) -> &[u32] {
        &self.scopes
    }

    pub fn position(&self, field_id: u32, scope_id: u32) -> Option<usize> {
        self.index.get(&(field_id, scope_id)).copied()
    }

    /// Find the result for `(field_id, scope_id)` in a query response.
    ///
    /// Returns `None` when the pair was not requested or the response is
    /// shorter than the batch.
    pub fn result<'a>(
        &self,
        results: &'a [FieldResult],
        field_id: u32,
        scope_id: u32,
    ) -> Option<&'a FieldResult> {
        self.position(field_id, scope_id).and_then(|i| results.get(i))
    }

    /// Check that a response has one result per request
    pub fn check_response(&self, results: &[FieldResult]) -> Result<(), DecodeError> {
        if results.len() == self.len() {
            Ok(())
        } else {
            Err(DecodeError::ShortResponse {
                requested: self.len(),
                returned: results.len(),
            })
        }
    }

    /// Issue the batch as one query. An empty batch never reaches the device.
    pub fn query(&self, device: &dyn Device) -> Result<Vec<FieldResult>, DeviceError> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        device.field_values(&self.requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use std::collections::HashSet;

    #[test]
    fn test_batch_is_complete() {
        let links = [0, 1, 4, 7];
        let batch = FieldBatch::from_active_links(&links, NVLINK_FIELDS);

        assert_eq!(batch.len(), links.len() * NVLINK_FIELDS.len());
        let mut seen = HashSet::new();
        for &link in &links {
            for descriptor in NVLINK_FIELDS {
                let pos = batch.position(descriptor.field_id, link).unwrap();
                let request = batch.requests()[pos];
                assert_eq!(request.field_id, descriptor.field_id);
                assert_eq!(request.scope_id, link);
                assert!(seen.insert(pos));
            }
        }
        assert_eq!(seen.len(), batch.len());
    }

    #[test]
    fn test_zero_links_is_empty() {
        let batch = FieldBatch::from_active_links(&[], NVLINK_FIELDS);
        assert!(batch.is_empty());
        assert!(batch.active_links().is_empty());
        assert_eq!(batch.position(206, 0), None);
    }

    #[test]
    fn test_build_skips_inactive_links() {
        let device = MockDevice::new(0).with_active_links(&[1, 3]);
        let batch = FieldBatch::build(&device, 6, NVLINK_FIELDS);

        assert_eq!(batch.active_links(), &[1, 3]);
        assert_eq!(batch.len(), 2 * NVLINK_FIELDS.len());
        assert_eq!(batch.position(206, 0), None);
        assert!(batch.position(250, 3).is_some());
    }

    #[test]
    fn test_empty_batch_skips_query() {
        let device = MockDevice::new(0);
        let batch = FieldBatch::build(&device, 4, NVLINK_FIELDS);
        assert!(batch.is_empty());
        assert!(batch.query(&device).unwrap().is_empty());
        assert_eq!(device.field_query_count(), 0);
    }

    #[test]
    fn test_result_lookup() {
        let device = MockDevice::new(0)
            .with_active_links(&[2])
            .with_field_value(207, 2, 11.0);
        let batch = FieldBatch::build(&device, 4, NVLINK_FIELDS);
        let results = batch.query(&device).unwrap();

        let result = batch.result(&results, 207, 2).unwrap();
        assert_eq!(result.field_id, 207);
        assert_eq!(result.scope_id, 2);
        assert!(batch.result(&results, 207, 1).is_none());
        assert!(batch.result(&results[..1], 250, 2).is_none());
    }

    #[test]
    fn test_descriptor_ids_unique() {
        for table in [NVLINK_FIELDS, CLOCK_EVENT_FIELDS] {
            let ids: HashSet<u32> = table.iter().map(|d| d.field_id).collect();
            assert_eq!(ids.len(), table.len());
            let names: HashSet<&str> = table.iter().map(|d| d.name).collect();
            assert_eq!(names.len(), table.len());
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "requested twice")]
    fn test_duplicate_field_rejected() {
        let descriptor = NVLINK_FIELDS[0];
        FieldBatch::from_active_links(&[0], &[descriptor, descriptor]);
    }

    #[test]
    fn test_short_response_detected() {
        let device = MockDevice::new(0)
            .with_active_links(&[0, 1])
            .with_truncated_results(3);
        let batch = FieldBatch::build(&device, 2, NVLINK_FIELDS);
        let results = batch.query(&device).unwrap();

        assert_eq!(
            batch.check_response(&results),
            Err(DecodeError::ShortResponse {
                requested: 2 * NVLINK_FIELDS.len(),
                returned: 3,
            })
        );
        let full = batch.query(&MockDevice::new(0).with_active_links(&[0, 1])).unwrap();
        assert_eq!(batch.check_response(&full), Ok(()));
    }

    #[test]
    fn test_device_scoped() {
        let batch = FieldBatch::device_scoped(CLOCK_EVENT_FIELDS);
        assert_eq!(batch.len(), CLOCK_EVENT_FIELDS.len());
        assert!(batch.requests().iter().all(|r| r.scope_id == 0));
        assert_eq!(batch.position(253, 0), Some(4));
    }
}
