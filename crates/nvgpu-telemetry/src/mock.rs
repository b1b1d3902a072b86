//! Mock device backend for testing

use crate::codec::{encode, ValueType};
use crate::device::{
    Device, DeviceError, DeviceResult, EndpointKind, EventSource, FabricInfo, FaultEvent, FaultEventBus,
    FieldRequest, FieldResult, GpuInfo, LinkState, PciInfo, RemoteEndpoint, SystemInfo, SystemInfoSource,
    TopologyLevel,
    EVENT_TYPE_XID_CRITICAL_ERROR,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// PCI identity assigned to mock device `index`
pub fn mock_pci(index: usize) -> PciInfo {
    PciInfo::new(0, 0x10 + index as u32, 0)
}

/// UUID assigned to mock device `index`
pub fn mock_uuid(index: usize) -> String {
    format!("GPU-{:08x}-0000-0000-0000-000000000000", index)
}

/// Board metadata assigned to mock device `index`
pub fn mock_gpu_info(index: usize) -> GpuInfo {
    GpuInfo {
        name: "Mock H100".to_string(),
        brand: "15".to_string(),
        serial: format!("MOCK{:08}", index),
        board_id: (0x100 + index).to_string(),
        vbios_version: "96.00.74.00.01".to_string(),
        oem_inforom_version: "2.1".to_string(),
        ecc_inforom_version: "7.0".to_string(),
        power_inforom_version: "unknown".to_string(),
        inforom_image_version: "G520.0200.00.05".to_string(),
    }
}

/// Scriptable GPU handle
pub struct MockDevice {
    index: usize,
    uuid: DeviceResult<String>,
    pci: DeviceResult<PciInfo>,
    max_links: DeviceResult<u32>,
    active_links: BTreeSet<u32>,
    link_state_errors: HashMap<u32, DeviceError>,
    fields: RwLock<HashMap<(u32, u32), (u32, [u8; 8])>>,
    field_errors: HashMap<(u32, u32), DeviceError>,
    field_query_error: Option<DeviceError>,
    truncate_results: Option<usize>,
    query_delay: Duration,
    fabric: RwLock<DeviceResult<FabricInfo>>,
    remote: HashMap<u32, RemoteEndpoint>,
    ancestors: RwLock<HashMap<String, DeviceResult<TopologyLevel>>>,
    cpu_affinity: DeviceResult<Vec<u64>>,
    memory_affinity: DeviceResult<Vec<u64>>,
    info: DeviceResult<GpuInfo>,
    field_queries: AtomicUsize,
    ancestor_queries: AtomicUsize,
}

impl MockDevice {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            uuid: Ok(mock_uuid(index)),
            pci: Ok(mock_pci(index)),
            max_links: Err(DeviceError::NotSupported),
            active_links: BTreeSet::new(),
            link_state_errors: HashMap::new(),
            fields: RwLock::new(HashMap::new()),
            field_errors: HashMap::new(),
            field_query_error: None,
            truncate_results: None,
            query_delay: Duration::ZERO,
            fabric: RwLock::new(Err(DeviceError::NotSupported)),
            remote: HashMap::new(),
            ancestors: RwLock::new(HashMap::new()),
            cpu_affinity: Ok(vec![0xff]),
            memory_affinity: Ok(vec![0x1]),
            info: Ok(mock_gpu_info(index)),
            field_queries: AtomicUsize::new(0),
            ancestor_queries: AtomicUsize::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pci_info_value(&self) -> PciInfo {
        mock_pci(self.index)
    }

    pub fn with_uuid_error(mut self, error: DeviceError) -> Self {
        self.uuid = Err(error);
        self
    }

    pub fn with_pci_error(mut self, error: DeviceError) -> Self {
        self.pci = Err(error);
        self
    }

    pub fn with_max_link_count(mut self, links: u32) -> Self {
        self.max_links = Ok(links);
        self
    }

    pub fn with_active_links(mut self, links: &[u32]) -> Self {
        self.active_links.extend(links.iter().copied());
        self
    }

    pub fn with_link_state_error(mut self, link: u32, error: DeviceError) -> Self {
        self.link_state_errors.insert(link, error);
        self
    }

    /// Store an unsigned 64-bit value for `(field_id, scope_id)`
    pub fn with_field_value(self, field_id: u32, scope_id: u32, value: f64) -> Self {
        self.set_field_value(field_id, scope_id, value);
        self
    }

    pub fn with_raw_field(self, field_id: u32, scope_id: u32, value_type: u32, value: [u8; 8]) -> Self {
        self.fields.write().insert((field_id, scope_id), (value_type, value));
        self
    }

    pub fn with_field_error(mut self, field_id: u32, scope_id: u32, error: DeviceError) -> Self {
        self.field_errors.insert((field_id, scope_id), error);
        self
    }

    /// Fail every batched query as a whole
    pub fn with_field_query_error(mut self, error: DeviceError) -> Self {
        self.field_query_error = Some(error);
        self
    }

    /// Answer batched queries with at most `count` results
    pub fn with_truncated_results(mut self, count: usize) -> Self {
        self.truncate_results = Some(count);
        self
    }

    /// Block each batched query for `delay`
    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    pub fn with_fabric_info(self, info: FabricInfo) -> Self {
        *self.fabric.write() = Ok(info);
        self
    }

    pub fn with_fabric_error(self, error: DeviceError) -> Self {
        *self.fabric.write() = Err(error);
        self
    }

    pub fn with_remote_gpu(self, link: u32, pci: PciInfo) -> Self {
        self.with_remote_endpoint(link, EndpointKind::Gpu, pci)
    }

    pub fn with_remote_endpoint(mut self, link: u32, kind: EndpointKind, pci: PciInfo) -> Self {
        self.remote.insert(link, RemoteEndpoint { kind, pci });
        self
    }

    /// Common ancestor reported against mock device `peer`; unset pairs report `SYS`
    pub fn with_ancestor(self, peer: usize, level: TopologyLevel) -> Self {
        self.set_ancestor(peer, level);
        self
    }

    pub fn with_ancestor_error(self, peer: usize, error: DeviceError) -> Self {
        self.ancestors.write().insert(mock_pci(peer).bus_id(), Err(error));
        self
    }

    pub fn with_gpu_info(mut self, info: GpuInfo) -> Self {
        self.info = Ok(info);
        self
    }

    pub fn with_gpu_info_error(mut self, error: DeviceError) -> Self {
        self.info = Err(error);
        self
    }

    pub fn with_cpu_affinity(mut self, words: Vec<u64>) -> Self {
        self.cpu_affinity = Ok(words);
        self
    }

    pub fn with_memory_affinity(mut self, words: Vec<u64>) -> Self {
        self.memory_affinity = Ok(words);
        self
    }

    pub fn with_memory_affinity_error(mut self, error: DeviceError) -> Self {
        self.memory_affinity = Err(error);
        self
    }

    /// Update a field value between passes
    pub fn set_field_value(&self, field_id: u32, scope_id: u32, value: f64) {
        let value_type = ValueType::UnsignedLongLong;
        self.fields
            .write()
            .insert((field_id, scope_id), (value_type.tag(), encode(value_type, value)));
    }

    /// Change the common ancestor reported against `peer` between passes
    pub fn set_ancestor(&self, peer: usize, level: TopologyLevel) {
        self.ancestors.write().insert(mock_pci(peer).bus_id(), Ok(level));
    }

    pub fn set_fabric_info(&self, info: FabricInfo) {
        *self.fabric.write() = Ok(info);
    }

    pub fn field_query_count(&self) -> usize {
        self.field_queries.load(Ordering::SeqCst)
    }

    pub fn ancestor_query_count(&self) -> usize {
        self.ancestor_queries.load(Ordering::SeqCst)
    }
}

impl Device for MockDevice {
    fn uuid(&self) -> DeviceResult<String> {
        self.uuid.clone()
    }

    fn pci_info(&self) -> DeviceResult<PciInfo> {
        self.pci
    }

    fn max_link_count(&self) -> DeviceResult<u32> {
        self.max_links
    }

    fn link_state(&self, link: u32) -> DeviceResult<LinkState> {
        if let Some(error) = self.link_state_errors.get(&link) {
            return Err(*error);
        }
        if self.active_links.contains(&link) {
            Ok(LinkState::Enabled)
        } else {
            Ok(LinkState::Disabled)
        }
    }

    fn field_values(&self, requests: &[FieldRequest]) -> DeviceResult<Vec<FieldResult>> {
        self.field_queries.fetch_add(1, Ordering::SeqCst);
        if !self.query_delay.is_zero() {
            std::thread::sleep(self.query_delay);
        }
        if let Some(error) = self.field_query_error {
            return Err(error);
        }

        let fields = self.fields.read();
        let limit = self.truncate_results.unwrap_or(requests.len());
        let results = requests
            .iter()
            .take(limit)
            .map(|request| {
                let key = (request.field_id, request.scope_id);
                if let Some(error) = self.field_errors.get(&key) {
                    return FieldResult::failed(*request, *error);
                }
                match fields.get(&key) {
                    Some((value_type, value)) => FieldResult::ok(*request, *value_type, *value),
                    None => FieldResult::failed(*request, DeviceError::NotSupported),
                }
            })
            .collect();
        debug!(gpu = self.index, requests = requests.len(), "Mock field query");
        Ok(results)
    }

    fn common_ancestor(&self, other: &dyn Device) -> DeviceResult<TopologyLevel> {
        self.ancestor_queries.fetch_add(1, Ordering::SeqCst);
        let peer = other.pci_info()?.bus_id();
        self.ancestors
            .read()
            .get(&peer)
            .copied()
            .unwrap_or(Ok(TopologyLevel::System))
    }

    fn link_remote_endpoint(&self, link: u32) -> DeviceResult<RemoteEndpoint> {
        self.remote.get(&link).copied().ok_or(DeviceError::NotSupported)
    }

    fn fabric_info(&self) -> DeviceResult<FabricInfo> {
        self.fabric.read().clone()
    }

    fn cpu_affinity(&self, _words: usize) -> DeviceResult<Vec<u64>> {
        self.cpu_affinity.clone()
    }

    fn memory_affinity(&self, _words: usize) -> DeviceResult<Vec<u64>> {
        self.memory_affinity.clone()
    }

    fn gpu_info(&self) -> DeviceResult<GpuInfo> {
        self.info.clone()
    }
}

/// Fixed host version report
pub struct MockSystemInfo {
    info: DeviceResult<SystemInfo>,
}

impl MockSystemInfo {
    pub fn new() -> Self {
        Self {
            info: Ok(SystemInfo {
                driver_version: "560.35.03".to_string(),
                library_version: "12.560.35.03".to_string(),
                cuda_driver_version: 12060,
            }),
        }
    }

    pub fn with_error(error: DeviceError) -> Self {
        Self { info: Err(error) }
    }
}

impl Default for MockSystemInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemInfoSource for MockSystemInfo {
    fn system_info(&self) -> DeviceResult<SystemInfo> {
        self.info.clone()
    }
}

/// One scripted result of `EventSource::wait`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockWait {
    Event(FaultEvent),
    Timeout,
    Error(DeviceError),
}

#[derive(Default)]
struct EventScript {
    waits: Mutex<VecDeque<MockWait>>,
    registered: Mutex<Vec<usize>>,
    wait_calls: AtomicUsize,
}

/// Fault event bus replaying a script of wait results.
///
/// Once the script is exhausted every wait times out after a short pause.
#[derive(Default, Clone)]
pub struct MockEventBus {
    script: Arc<EventScript>,
    register_errors: HashMap<usize, DeviceError>,
    create_error: Option<DeviceError>,
}

impl MockEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_register_error(mut self, device_index: usize, error: DeviceError) -> Self {
        self.register_errors.insert(device_index, error);
        self
    }

    pub fn with_create_error(mut self, error: DeviceError) -> Self {
        self.create_error = Some(error);
        self
    }

    /// Queue a critical Xid event for device `device_index`
    pub fn push_xid(&self, device_index: usize, xid: u64) {
        self.push(MockWait::Event(FaultEvent {
            device_index,
            event_type: EVENT_TYPE_XID_CRITICAL_ERROR,
            data: xid,
        }));
    }

    pub fn push(&self, wait: MockWait) {
        self.script.waits.lock().push_back(wait);
    }

    pub fn pending(&self) -> usize {
        self.script.waits.lock().len()
    }

    pub fn registered_devices(&self) -> Vec<usize> {
        self.script.registered.lock().clone()
    }

    pub fn wait_calls(&self) -> usize {
        self.script.wait_calls.load(Ordering::SeqCst)
    }

    /// A standalone event source sharing this bus's script
    pub fn source(&self) -> MockEventSource {
        MockEventSource {
            script: Arc::clone(&self.script),
            register_errors: self.register_errors.clone(),
        }
    }
}

impl FaultEventBus for MockEventBus {
    fn create_event_source(&self) -> DeviceResult<Box<dyn EventSource>> {
        if let Some(error) = self.create_error {
            return Err(error);
        }
        Ok(Box::new(self.source()))
    }
}

pub struct MockEventSource {
    script: Arc<EventScript>,
    register_errors: HashMap<usize, DeviceError>,
}

impl EventSource for MockEventSource {
    fn register(&mut self, device_index: usize, _device: &dyn Device, _event_mask: u64) -> DeviceResult<()> {
        if let Some(error) = self.register_errors.get(&device_index) {
            return Err(*error);
        }
        self.script.registered.lock().push(device_index);
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> DeviceResult<Option<FaultEvent>> {
        self.script.wait_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.waits.lock().pop_front();
        match next {
            Some(MockWait::Event(event)) => Ok(Some(event)),
            Some(MockWait::Timeout) => Ok(None),
            Some(MockWait::Error(error)) => Err(error),
            None => {
                std::thread::sleep(timeout.min(Duration::from_millis(5)));
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_fields() {
        let device = MockDevice::new(1)
            .with_field_value(206, 0, 3.0)
            .with_field_error(207, 0, DeviceError::GpuLost);

        let requests = [
            FieldRequest { field_id: 206, scope_id: 0 },
            FieldRequest { field_id: 207, scope_id: 0 },
            FieldRequest { field_id: 211, scope_id: 0 },
        ];
        let results = device.field_values(&requests).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].status.is_ok());
        assert_eq!(results[1].status, Err(DeviceError::GpuLost));
        assert_eq!(results[2].status, Err(DeviceError::NotSupported));
        assert_eq!(device.field_query_count(), 1);
    }

    #[test]
    fn test_mock_identity() {
        let device = MockDevice::new(2);
        assert_eq!(device.pci_info().unwrap().bus_id(), "0000:12:00.0");
        assert_eq!(device.uuid().unwrap(), mock_uuid(2));
    }

    #[test]
    fn test_mock_event_script() {
        let bus = MockEventBus::new();
        bus.push_xid(0, 79);
        bus.push(MockWait::Error(DeviceError::Unknown(3)));

        let mut source = bus.create_event_source().unwrap();
        let event = source.wait(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(event.data, 79);
        assert_eq!(source.wait(Duration::from_secs(1)), Err(DeviceError::Unknown(3)));
        assert_eq!(source.wait(Duration::from_millis(1)), Ok(None));
        assert_eq!(bus.wait_calls(), 3);
    }
}
