//! GPU topology matrix and NVLink network adjacency

use super::Collector;
use crate::config::TopologyMode;
use crate::device::Device;
use crate::names::{self, labels};
use crate::sink::ObservationSink;
use crate::topology::{TopologyGraph, TopologyGraphBuilder};
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub struct TopologyCollector {
    builder: TopologyGraphBuilder,
    mode: TopologyMode,
    published: AtomicBool,
}

impl TopologyCollector {
    pub fn new(mode: TopologyMode, fallback_max_links: u32) -> Self {
        Self {
            builder: TopologyGraphBuilder::new(fallback_max_links),
            mode,
            published: AtomicBool::new(false),
        }
    }

    fn should_run(&self) -> bool {
        match self.mode {
            TopologyMode::Disabled => false,
            TopologyMode::Startup => !self.published.swap(true, Ordering::SeqCst),
            TopologyMode::EveryTick => true,
        }
    }

    /// Replace the published topology with `graph`.
    ///
    /// Both topology metrics are reset first so cells that changed since the
    /// previous build do not linger.
    pub fn publish(graph: &TopologyGraph, sink: &dyn ObservationSink) {
        sink.reset(names::GPU_TOPOLOGY);
        sink.reset(names::NVLINK_NIC_ADJACENCY);

        for node in &graph.nodes {
            let (Some(uuid), Some(pci_bus_id)) = (node.uuid.as_deref(), node.pci_bus_id()) else {
                continue;
            };
            let gpu_id = node.gpu_id();

            for peer in &graph.nodes {
                let Some(connection) = graph.connection(node.index, peer.index) else {
                    continue;
                };
                let peer_id = peer.gpu_id();
                let label = connection.label();
                sink.set_gauge(
                    names::GPU_TOPOLOGY,
                    &[
                        (labels::UUID, uuid),
                        (labels::PCI_BUS_ID, pci_bus_id.as_str()),
                        (labels::GPU_ID, gpu_id.as_str()),
                        (labels::CPU_AFFINITY, node.cpu_affinity.as_str()),
                        (labels::NUMA_AFFINITY, node.numa_affinity.as_str()),
                        (labels::GPU_NUMA_ID, node.numa_id.as_str()),
                        (labels::PEER_TYPE, "gpu"),
                        (labels::PEER_ID, peer_id.as_str()),
                        (labels::CONNECTION, label.as_str()),
                    ],
                    1.0,
                );
            }

            for adjacency in graph.nic_adjacency.iter().filter(|a| a.gpu == node.index) {
                sink.set_gauge(
                    names::NVLINK_NIC_ADJACENCY,
                    &[
                        (labels::UUID, uuid),
                        (labels::PCI_BUS_ID, pci_bus_id.as_str()),
                        (labels::GPU_ID, gpu_id.as_str()),
                        (labels::NIC_PCI_BUS_ID, adjacency.nic_pci_bus_id.as_str()),
                        (labels::ENDPOINT_TYPE, adjacency.kind.as_str()),
                    ],
                    f64::from(adjacency.links),
                );
            }
        }
    }
}

impl Collector for TopologyCollector {
    fn name(&self) -> &'static str {
        "topology"
    }

    fn collect(&self, devices: &[Arc<dyn Device>], sink: &dyn ObservationSink) -> Result<()> {
        if !self.should_run() {
            debug!(mode = %self.mode, "Topology collection skipped");
            return Ok(());
        }

        let graph = self.builder.build(devices);
        Self::publish(&graph, sink);
        info!(
            gpus = graph.len(),
            network_endpoints = graph.nic_adjacency.len(),
            "Topology published"
        );
        Ok(())
    }
}
