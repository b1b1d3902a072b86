//! Metric and label names shared by the collectors and sinks

/// Namespace prefixed to every exported metric
pub const NAMESPACE: &str = "nvgpu";

pub const NVLINK_ERRORS: &str = "nvlink_errors_total";
pub const FABRIC_HEALTH: &str = "fabric_health";
pub const FABRIC_STATE: &str = "fabric_state";
pub const FABRIC_STATUS: &str = "fabric_status";
pub const FABRIC_HEALTH_SUMMARY: &str = "fabric_health_summary";
pub const FABRIC_INCORRECT_CONFIGURATION: &str = "fabric_incorrect_configuration";
pub const CLOCK_EVENT_DURATION: &str = "clocks_event_duration_seconds_total";
pub const GPU_TOPOLOGY: &str = "gpu_topology";
pub const NVLINK_NIC_ADJACENCY: &str = "nvlink_nic_adjacency";
pub const XID_ERRORS: &str = "xid_errors_total";
pub const GPU_INFO: &str = "gpu_info";
pub const EXPORTER_INFO: &str = "exporter_info";

pub mod labels {
    pub const UUID: &str = "UUID";
    pub const PCI_BUS_ID: &str = "pci_bus_id";
    pub const LINK: &str = "link";
    pub const ERROR_TYPE: &str = "error_type";
    pub const CLIQUE_ID: &str = "clique_id";
    pub const CLUSTER_UUID: &str = "cluster_uuid";
    pub const HEALTH_FIELD: &str = "health_field";
    pub const REASON: &str = "reason";
    pub const GPU_ID: &str = "gpu_id";
    pub const CPU_AFFINITY: &str = "cpu_affinity";
    pub const NUMA_AFFINITY: &str = "numa_affinity";
    pub const GPU_NUMA_ID: &str = "gpu_numa_id";
    pub const PEER_TYPE: &str = "peer_type";
    pub const PEER_ID: &str = "peer_id";
    pub const CONNECTION: &str = "connection";
    pub const NIC_PCI_BUS_ID: &str = "nic_pci_bus_id";
    pub const ENDPOINT_TYPE: &str = "endpoint_type";
    pub const XID: &str = "xid";
    pub const NAME: &str = "name";
    pub const BRAND: &str = "brand";
    pub const SERIAL: &str = "serial";
    pub const BOARD_ID: &str = "board_id";
    pub const VBIOS_VERSION: &str = "vbios_version";
    pub const OEM_INFOROM_VERSION: &str = "oem_inforom_version";
    pub const ECC_INFOROM_VERSION: &str = "ecc_inforom_version";
    pub const POWER_INFOROM_VERSION: &str = "power_inforom_version";
    pub const INFOROM_IMAGE_VERSION: &str = "inforom_image_version";
    pub const VERSION: &str = "version";
    pub const DRIVER_VERSION: &str = "driver_version";
    pub const NVML_VERSION: &str = "nvml_version";
    pub const CUDA_VERSION: &str = "cuda_version";
}

/// Help text and label set for each metric
pub struct MetricSpec {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
    pub counter: bool,
}

use labels::*;

const FABRIC_LABELS: &[&str] = &[UUID, PCI_BUS_ID, CLIQUE_ID, CLUSTER_UUID];

pub const METRICS: &[MetricSpec] = &[
    MetricSpec {
        name: NVLINK_ERRORS,
        help: "NVLink error counters by type",
        labels: &[UUID, PCI_BUS_ID, LINK, ERROR_TYPE],
        counter: false,
    },
    MetricSpec {
        name: FABRIC_HEALTH,
        help: "GPU fabric health flag (1 = flag false, 0 = flag true)",
        labels: &[UUID, PCI_BUS_ID, CLIQUE_ID, CLUSTER_UUID, HEALTH_FIELD],
        counter: false,
    },
    MetricSpec {
        name: FABRIC_STATE,
        help: "GPU fabric state (0=not_supported, 1=not_started, 2=in_progress, 3=completed)",
        labels: FABRIC_LABELS,
        counter: false,
    },
    MetricSpec {
        name: FABRIC_STATUS,
        help: "GPU fabric status code",
        labels: FABRIC_LABELS,
        counter: false,
    },
    MetricSpec {
        name: FABRIC_HEALTH_SUMMARY,
        help: "GPU fabric health summary (0=not_supported, 1=healthy, 2=unhealthy, 3=limited_capacity)",
        labels: FABRIC_LABELS,
        counter: false,
    },
    MetricSpec {
        name: FABRIC_INCORRECT_CONFIGURATION,
        help: "GPU fabric incorrect configuration code (1=none, 2=incorrect_sysguid, 3=incorrect_chassis_sn, 4=no_partition, 5=insufficient_nvlinks)",
        labels: FABRIC_LABELS,
        counter: false,
    },
    MetricSpec {
        name: CLOCK_EVENT_DURATION,
        help: "Cumulative time the GPU clocks were held back, by reason",
        labels: &[UUID, PCI_BUS_ID, REASON],
        counter: false,
    },
    MetricSpec {
        name: GPU_TOPOLOGY,
        help: "GPU to GPU connection type",
        labels: &[
            UUID,
            PCI_BUS_ID,
            GPU_ID,
            CPU_AFFINITY,
            NUMA_AFFINITY,
            GPU_NUMA_ID,
            PEER_TYPE,
            PEER_ID,
            CONNECTION,
        ],
        counter: false,
    },
    MetricSpec {
        name: NVLINK_NIC_ADJACENCY,
        help: "NVLink links from a GPU to a network endpoint",
        labels: &[UUID, PCI_BUS_ID, GPU_ID, NIC_PCI_BUS_ID, ENDPOINT_TYPE],
        counter: false,
    },
    MetricSpec {
        name: XID_ERRORS,
        help: "Critical Xid errors observed per GPU",
        labels: &[UUID, PCI_BUS_ID, XID],
        counter: true,
    },
    MetricSpec {
        name: GPU_INFO,
        help: "GPU device information",
        labels: &[
            UUID,
            PCI_BUS_ID,
            NAME,
            BRAND,
            SERIAL,
            BOARD_ID,
            VBIOS_VERSION,
            OEM_INFOROM_VERSION,
            ECC_INFOROM_VERSION,
            POWER_INFOROM_VERSION,
            INFOROM_IMAGE_VERSION,
        ],
        counter: false,
    },
    MetricSpec {
        name: EXPORTER_INFO,
        help: "Exporter, driver and library versions",
        labels: &[VERSION, DRIVER_VERSION, NVML_VERSION, CUDA_VERSION],
        counter: false,
    },
];

pub fn spec(name: &str) -> Option<&'static MetricSpec> {
    METRICS.iter().find(|m| m.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_metric_names_unique() {
        let names: HashSet<_> = METRICS.iter().map(|m| m.name).collect();
        assert_eq!(names.len(), METRICS.len());
        assert!(spec(XID_ERRORS).unwrap().counter);
        assert!(spec("missing").is_none());
    }
}
