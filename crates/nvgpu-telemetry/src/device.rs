//! Device interface capabilities consumed by the telemetry engine
//!
//! The engine never talks to the vendor library directly. Everything it needs
//! from a GPU handle is expressed by the [`Device`] trait, and fault event
//! delivery by [`FaultEventBus`] / [`EventSource`]. Calls are blocking local
//! library calls; the engine runs them off the async executor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Maximum NVLink count on current hardware generations
pub const NVLINK_MAX_LINKS: u32 = 18;

/// Event mask bit for critical Xid errors
pub const EVENT_TYPE_XID_CRITICAL_ERROR: u64 = 0x0000_0000_0000_0008;

/// Return code of a single device interface call
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceError {
    #[error("not supported")]
    NotSupported,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("timeout")]
    Timeout,

    #[error("GPU is lost")]
    GpuLost,

    #[error("insufficient permissions")]
    NoPermission,

    #[error("library not initialized")]
    Uninitialized,

    #[error("unknown error (code {0})")]
    Unknown(u32),
}

impl DeviceError {
    /// Whether this code means the capability is absent rather than broken
    pub fn is_not_supported(&self) -> bool {
        matches!(self, DeviceError::NotSupported)
    }

    /// Not-supported and out-of-range link arguments are expected while scanning links
    pub fn is_expected_link_failure(&self) -> bool {
        matches!(self, DeviceError::NotSupported | DeviceError::InvalidArgument)
    }
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// PCI identity of a device or link endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciInfo {
    /// Legacy bus id bytes, `DDDD:BB:DD.F` padded with NULs
    pub bus_id_legacy: [u8; 16],
    pub domain: u32,
    pub bus: u32,
    pub device: u32,
}

impl PciInfo {
    /// Build from domain/bus/device numbers, filling the legacy bus id
    pub fn new(domain: u32, bus: u32, device: u32) -> Self {
        let text = format!("{:04x}:{:02x}:{:02x}.0", domain, bus, device);
        let mut bus_id_legacy = [0u8; 16];
        for (slot, byte) in bus_id_legacy.iter_mut().zip(text.bytes()) {
            *slot = byte;
        }
        Self {
            bus_id_legacy,
            domain,
            bus,
            device,
        }
    }

    /// Human-readable bus id
    pub fn bus_id(&self) -> String {
        pci_bus_id_to_string(&self.bus_id_legacy)
    }

    /// Whether two identities name the same physical function slot
    pub fn same_slot(&self, other: &PciInfo) -> bool {
        self.domain == other.domain && self.bus == other.bus && self.device == other.device
    }
}

/// Convert a legacy 16-byte PCI bus id to a string.
///
/// The address is 12 or 13 printable characters; anything from the first
/// NUL or non-printable byte at offset 12 or 13 is cut.
pub fn pci_bus_id_to_string(bus_id: &[u8; 16]) -> String {
    let mut end = 13;
    for (i, &byte) in bus_id.iter().enumerate().take(14).skip(12) {
        if byte == 0 || !(32..=126).contains(&byte) {
            end = i;
            break;
        }
    }
    String::from_utf8_lossy(&bus_id[..end]).into_owned()
}

/// Format a 16-byte UUID as `8-4-4-4-12` lowercase hex
pub fn uuid_bytes_to_string(uuid: &[u8; 16]) -> String {
    let hex: Vec<String> = uuid.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        hex[0..4].concat(),
        hex[4..6].concat(),
        hex[6..8].concat(),
        hex[8..10].concat(),
        hex[10..16].concat()
    )
}

/// NVLink state as reported per link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Enabled,
    Disabled,
}

/// One telemetry counter on one scope (link) of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldRequest {
    pub field_id: u32,
    pub scope_id: u32,
}

/// Per-request result of a batched field query, returned in request order
#[derive(Debug, Clone, PartialEq)]
pub struct FieldResult {
    pub field_id: u32,
    pub scope_id: u32,
    /// Per-request status, distinct from the status of the whole call
    pub status: DeviceResult<()>,
    /// Raw value type tag, see [`crate::codec::ValueType`]
    pub value_type: u32,
    pub value: [u8; 8],
}

impl FieldResult {
    pub fn ok(request: FieldRequest, value_type: u32, value: [u8; 8]) -> Self {
        Self {
            field_id: request.field_id,
            scope_id: request.scope_id,
            status: Ok(()),
            value_type,
            value,
        }
    }

    pub fn failed(request: FieldRequest, error: DeviceError) -> Self {
        Self {
            field_id: request.field_id,
            scope_id: request.scope_id,
            status: Err(error),
            value_type: 0,
            value: [0; 8],
        }
    }
}

/// PCIe common-ancestor distance between two devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TopologyLevel {
    /// Same board
    Internal,
    /// Single PCIe switch
    Single,
    /// Multiple PCIe switches
    Multiple,
    /// PCIe host bridge
    HostBridge,
    /// Interconnect within a NUMA node
    Node,
    /// SMP interconnect between NUMA nodes
    System,
}

impl TopologyLevel {
    pub fn from_ordinal(value: u32) -> Option<Self> {
        match value {
            0 => Some(TopologyLevel::Internal),
            10 => Some(TopologyLevel::Single),
            20 => Some(TopologyLevel::Multiple),
            30 => Some(TopologyLevel::HostBridge),
            40 => Some(TopologyLevel::Node),
            50 => Some(TopologyLevel::System),
            _ => None,
        }
    }

    pub fn ordinal(&self) -> u32 {
        match self {
            TopologyLevel::Internal => 0,
            TopologyLevel::Single => 10,
            TopologyLevel::Multiple => 20,
            TopologyLevel::HostBridge => 30,
            TopologyLevel::Node => 40,
            TopologyLevel::System => 50,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TopologyLevel::Internal => "INTERNAL",
            TopologyLevel::Single => "PIX",
            TopologyLevel::Multiple => "PXB",
            TopologyLevel::HostBridge => "PHB",
            TopologyLevel::Node => "NODE",
            TopologyLevel::System => "SYS",
        }
    }
}

impl fmt::Display for TopologyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Kind of device on the far side of an NVLink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EndpointKind {
    Gpu,
    Switch,
    Nic,
    Unknown,
}

impl EndpointKind {
    /// NIC and switch classes reachable over NVLink
    pub fn is_network(&self) -> bool {
        matches!(self, EndpointKind::Switch | EndpointKind::Nic)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Gpu => "gpu",
            EndpointKind::Switch => "switch",
            EndpointKind::Nic => "nic",
            EndpointKind::Unknown => "unknown",
        }
    }
}

/// Remote end of one NVLink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub kind: EndpointKind,
    pub pci: PciInfo,
}

/// Fabric query result including the packed health mask
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricInfo {
    pub cluster_uuid: [u8; 16],
    pub clique_id: u32,
    pub state: u32,
    pub status: u32,
    pub health_mask: u32,
}

/// Query capability of one GPU handle.
///
/// Handles are enumerated once at startup by the caller and are read-only to
/// the engine for the lifetime of the process.
pub trait Device: Send + Sync {
    /// Stable device UUID
    fn uuid(&self) -> DeviceResult<String>;

    /// PCI identity of the device
    fn pci_info(&self) -> DeviceResult<PciInfo>;

    /// Number of NVLinks the device can have; callers fall back to a
    /// configured count when this is not supported
    fn max_link_count(&self) -> DeviceResult<u32> {
        Err(DeviceError::NotSupported)
    }

    /// State of one NVLink
    fn link_state(&self, link: u32) -> DeviceResult<LinkState>;

    /// Batched field query; results are 1:1 with `requests` and in order
    fn field_values(&self, requests: &[FieldRequest]) -> DeviceResult<Vec<FieldResult>>;

    /// PCIe common-ancestor distance to another device
    fn common_ancestor(&self, other: &dyn Device) -> DeviceResult<TopologyLevel>;

    /// Remote endpoint of one NVLink
    fn link_remote_endpoint(&self, link: u32) -> DeviceResult<RemoteEndpoint>;

    /// Fabric state and health mask
    fn fabric_info(&self) -> DeviceResult<FabricInfo>;

    /// CPU affinity bitmask as 64-bit words, lowest CPU in bit 0 of word 0
    fn cpu_affinity(&self, words: usize) -> DeviceResult<Vec<u64>>;

    /// NUMA memory affinity bitmask as 64-bit words
    fn memory_affinity(&self, words: usize) -> DeviceResult<Vec<u64>>;

    /// Static board and firmware metadata
    fn gpu_info(&self) -> DeviceResult<GpuInfo> {
        Err(DeviceError::NotSupported)
    }
}

/// Static metadata of one GPU.
///
/// Values the device cannot report are carried as `"unknown"` by the
/// implementation; only a failure of the whole query is an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    pub brand: String,
    pub serial: String,
    pub board_id: String,
    pub vbios_version: String,
    pub oem_inforom_version: String,
    pub ecc_inforom_version: String,
    pub power_inforom_version: String,
    pub inforom_image_version: String,
}

/// Host-wide driver and library versions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub driver_version: String,
    pub library_version: String,
    /// CUDA driver version as reported by the driver, e.g. `12040`
    pub cuda_driver_version: u32,
}

impl SystemInfo {
    /// CUDA driver version as `major.minor`
    pub fn cuda_version(&self) -> String {
        format!(
            "{}.{}",
            self.cuda_driver_version / 1000,
            (self.cuda_driver_version % 1000) / 10
        )
    }
}

/// Query of host-wide versions, independent of any single device
pub trait SystemInfoSource: Send + Sync {
    fn system_info(&self) -> DeviceResult<SystemInfo>;
}

/// A fault event delivered by an [`EventSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEvent {
    /// Position of the originating device in the engine's device list
    pub device_index: usize,
    /// Event type bits
    pub event_type: u64,
    /// Event payload; the Xid code for critical Xid errors
    pub data: u64,
}

/// A subscription delivering fault events for a set of devices
pub trait EventSource: Send {
    /// Register one device for the given event mask
    fn register(&mut self, device_index: usize, device: &dyn Device, event_mask: u64) -> DeviceResult<()>;

    /// Block for the next event; `Ok(None)` means the timeout elapsed
    fn wait(&mut self, timeout: Duration) -> DeviceResult<Option<FaultEvent>>;
}

/// Factory for event subscriptions
pub trait FaultEventBus: Send + Sync {
    fn create_event_source(&self) -> DeviceResult<Box<dyn EventSource>>;
}
