//! GPU topology reconstruction
//!
//! Builds the GPU-to-GPU connection matrix and the NVLink adjacency to
//! network endpoints. NVLink counts come from a single scan of every link of
//! every device. Pairs without NVLink fall back to the PCIe common ancestor,
//! which is queried at most once per unordered pair.

use crate::device::{Device, DeviceError, EndpointKind, PciInfo, TopologyLevel};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Affinity query size: 16 words of 64 bits
pub const AFFINITY_WORDS: usize = 16;

/// Label for an affinity with no set bits or an unsupported query
pub const AFFINITY_UNKNOWN: &str = "unknown";

/// How two GPUs are connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    /// Diagonal of the matrix
    Itself,
    /// Direct NVLink with the given link count
    NvLink(u32),
    /// PCIe path through the given common ancestor
    Pcie(TopologyLevel),
    /// The ancestor query is not supported
    Unknown,
}

impl Connection {
    pub fn label(&self) -> String {
        match self {
            Connection::Itself => "X".to_string(),
            Connection::NvLink(count) => format!("NV{}", count),
            Connection::Pcie(level) => level.label().to_string(),
            Connection::Unknown => "UNKNOWN".to_string(),
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Format affinity words as ascending ranges, e.g. `0-2,5,7-8`
pub fn format_affinity(words: &[u64]) -> String {
    let bits = words.iter().enumerate().flat_map(|(word_index, word)| {
        (0..64u32)
            .filter(move |bit| word & (1u64 << bit) != 0)
            .map(move |bit| word_index * 64 + bit as usize)
    });

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for bit in bits {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == bit => *end = bit,
            _ => ranges.push((bit, bit)),
        }
    }

    if ranges.is_empty() {
        return AFFINITY_UNKNOWN.to_string();
    }

    ranges
        .iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{}-{}", start, end)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Index of the only set bit, if exactly one bit is set
fn single_node(words: &[u64]) -> Option<usize> {
    let total: u32 = words.iter().map(|w| w.count_ones()).sum();
    if total != 1 {
        return None;
    }
    words
        .iter()
        .position(|w| *w != 0)
        .map(|i| i * 64 + words[i].trailing_zeros() as usize)
}

/// Memo of pairwise connections keyed by `(min, max)`.
///
/// A `None` entry records a failed query so the pair is not asked again.
#[derive(Debug, Default)]
pub struct PairCache {
    entries: HashMap<(usize, usize), Option<Connection>>,
    queries: usize,
}

impl PairCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(a: usize, b: usize) -> (usize, usize) {
        (a.min(b), a.max(b))
    }

    pub fn get_or_query<F>(&mut self, a: usize, b: usize, query: F) -> Option<Connection>
    where
        F: FnOnce() -> Option<Connection>,
    {
        let key = Self::key(a, b);
        if let Some(cached) = self.entries.get(&key) {
            return *cached;
        }
        self.queries += 1;
        let value = query();
        self.entries.insert(key, value);
        value
    }

    /// Number of queries actually issued
    pub fn queries(&self) -> usize {
        self.queries
    }
}

/// Identity and affinity of one GPU
#[derive(Debug, Clone, PartialEq)]
pub struct GpuNode {
    pub index: usize,
    pub uuid: Option<String>,
    pub pci: Option<PciInfo>,
    pub cpu_affinity: String,
    pub numa_affinity: String,
    /// The NUMA node the GPU memory is local to, when it is exactly one
    pub numa_id: String,
}

impl GpuNode {
    pub fn gpu_id(&self) -> String {
        format!("GPU{}", self.index)
    }

    pub fn pci_bus_id(&self) -> Option<String> {
        self.pci.as_ref().map(PciInfo::bus_id)
    }
}

/// NVLink adjacency from a GPU to one network endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicAdjacency {
    pub gpu: usize,
    pub nic_pci_bus_id: String,
    pub kind: EndpointKind,
    pub links: u32,
}

/// Result of a topology build
#[derive(Debug, Clone)]
pub struct TopologyGraph {
    pub nodes: Vec<GpuNode>,
    matrix: Vec<Vec<Option<Connection>>>,
    pub nic_adjacency: Vec<NicAdjacency>,
}

impl TopologyGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Connection between `i` and `j`, `None` when the query failed
    pub fn connection(&self, i: usize, j: usize) -> Option<Connection> {
        self.matrix.get(i).and_then(|row| row.get(j)).copied().flatten()
    }
}

/// Builds a [`TopologyGraph`] from device capability queries
pub struct TopologyGraphBuilder {
    fallback_max_links: u32,
}

impl TopologyGraphBuilder {
    pub fn new(fallback_max_links: u32) -> Self {
        Self { fallback_max_links }
    }

    pub fn build(&self, devices: &[Arc<dyn Device>]) -> TopologyGraph {
        let mut cache = PairCache::new();
        self.build_with_cache(devices, &mut cache)
    }

    pub fn build_with_cache(&self, devices: &[Arc<dyn Device>], cache: &mut PairCache) -> TopologyGraph {
        let n = devices.len();
        let nodes: Vec<GpuNode> = devices
            .iter()
            .enumerate()
            .map(|(index, device)| Self::describe(index, device.as_ref()))
            .collect();

        let (nvlink_counts, nic_adjacency) = self.scan_links(devices, &nodes);

        let mut matrix = vec![vec![None; n]; n];
        for i in 0..n {
            for j in 0..n {
                matrix[i][j] = if i == j {
                    Some(Connection::Itself)
                } else {
                    let links = nvlink_counts[i][j].max(nvlink_counts[j][i]);
                    if links > 0 {
                        Some(Connection::NvLink(links))
                    } else {
                        cache.get_or_query(i, j, || Self::query_ancestor(devices, &nodes, i, j))
                    }
                };
            }
        }

        debug!(
            devices = n,
            ancestor_queries = cache.queries(),
            network_endpoints = nic_adjacency.len(),
            "Topology built"
        );

        TopologyGraph {
            nodes,
            matrix,
            nic_adjacency,
        }
    }

    fn describe(index: usize, device: &dyn Device) -> GpuNode {
        let uuid = device
            .uuid()
            .map_err(|e| warn!(gpu = index, error = %e, "Failed to get UUID"))
            .ok();
        let pci = device
            .pci_info()
            .map_err(|e| warn!(gpu = index, error = %e, "Failed to get PCI info"))
            .ok();

        let memory = device.memory_affinity(AFFINITY_WORDS);
        let numa_id = match &memory {
            Ok(words) => single_node(words).map_or_else(|| AFFINITY_UNKNOWN.to_string(), |node| node.to_string()),
            Err(_) => AFFINITY_UNKNOWN.to_string(),
        };

        GpuNode {
            index,
            uuid,
            pci,
            cpu_affinity: Self::affinity(index, "cpu", device.cpu_affinity(AFFINITY_WORDS)),
            numa_affinity: Self::affinity(index, "numa", memory),
            numa_id,
        }
    }

    fn affinity(index: usize, kind: &str, result: Result<Vec<u64>, DeviceError>) -> String {
        match result {
            Ok(words) => format_affinity(&words),
            Err(DeviceError::NotSupported) => AFFINITY_UNKNOWN.to_string(),
            Err(e) => {
                warn!(gpu = index, affinity = kind, error = %e, "Failed to get affinity");
                AFFINITY_UNKNOWN.to_string()
            }
        }
    }

    /// One pass over every link of every device.
    ///
    /// Returns per-pair NVLink counts from each device's own perspective and
    /// the network endpoints grouped by remote PCI bus id.
    fn scan_links(&self, devices: &[Arc<dyn Device>], nodes: &[GpuNode]) -> (Vec<Vec<u32>>, Vec<NicAdjacency>) {
        let n = devices.len();
        let mut counts = vec![vec![0u32; n]; n];
        let mut nic_adjacency = Vec::new();

        for (i, device) in devices.iter().enumerate() {
            let max_links = device.max_link_count().unwrap_or(self.fallback_max_links);
            let mut endpoints: BTreeMap<String, (EndpointKind, u32)> = BTreeMap::new();

            for link in 0..max_links {
                let remote = match device.link_remote_endpoint(link) {
                    Ok(remote) => remote,
                    Err(e) if e.is_expected_link_failure() => continue,
                    Err(e) => {
                        debug!(gpu = i, link = link, error = %e, "Failed to get NVLink remote endpoint");
                        continue;
                    }
                };

                if remote.kind.is_network() {
                    let entry = endpoints.entry(remote.pci.bus_id()).or_insert((remote.kind, 0));
                    entry.1 += 1;
                    continue;
                }

                let peer = nodes.iter().position(|node| {
                    node.index != i && node.pci.as_ref().is_some_and(|pci| pci.same_slot(&remote.pci))
                });
                if let Some(j) = peer {
                    counts[i][j] += 1;
                }
            }

            nic_adjacency.extend(endpoints.into_iter().map(|(bus_id, (kind, links))| NicAdjacency {
                gpu: i,
                nic_pci_bus_id: bus_id,
                kind,
                links,
            }));
        }

        (counts, nic_adjacency)
    }

    fn query_ancestor(devices: &[Arc<dyn Device>], nodes: &[GpuNode], i: usize, j: usize) -> Option<Connection> {
        let (a, b) = (i.min(j), i.max(j));
        match devices[a].common_ancestor(devices[b].as_ref()) {
            Ok(level) => Some(Connection::Pcie(level)),
            Err(DeviceError::NotSupported) => Some(Connection::Unknown),
            Err(e) => {
                warn!(
                    gpu = ?nodes[a].uuid,
                    peer = ?nodes[b].uuid,
                    error = %e,
                    "Failed to get topology common ancestor"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    fn devices(mocks: Vec<MockDevice>) -> (Vec<Arc<MockDevice>>, Vec<Arc<dyn Device>>) {
        let mocks: Vec<Arc<MockDevice>> = mocks.into_iter().map(Arc::new).collect();
        let dyns = mocks.iter().map(|m| m.clone() as Arc<dyn Device>).collect();
        (mocks, dyns)
    }

    #[test]
    fn test_format_affinity() {
        let word = 0b1_1010_0111u64;
        assert_eq!(format_affinity(&[word]), "0-2,5,7-8");
        assert_eq!(format_affinity(&[]), "unknown");
        assert_eq!(format_affinity(&[0, 0]), "unknown");
        assert_eq!(format_affinity(&[u64::MAX, 1]), "0-64");
        assert_eq!(format_affinity(&[1 << 63, 0, 1]), "63,128");
    }

    #[test]
    fn test_pair_cache_symmetric() {
        let mut cache = PairCache::new();
        let mut calls = 0;
        for (a, b) in [(0, 1), (1, 0), (0, 1)] {
            cache.get_or_query(a, b, || {
                calls += 1;
                None
            });
        }
        assert_eq!(calls, 1);
        assert_eq!(cache.queries(), 1);
    }

    #[test]
    fn test_ancestor_queried_once_per_pair() {
        let (mocks, devs) = devices((0..4).map(MockDevice::new).collect());
        let graph = TopologyGraphBuilder::new(4).build(&devs);

        let total: usize = mocks.iter().map(|m| m.ancestor_query_count()).sum();
        assert!(total <= 6, "ancestor queried {} times", total);
        for i in 0..4 {
            assert_eq!(graph.connection(i, i), Some(Connection::Itself));
            for j in 0..4 {
                assert_eq!(graph.connection(i, j), graph.connection(j, i));
            }
        }
    }

    #[test]
    fn test_nvlink_counts_and_labels() {
        let gpu1 = MockDevice::new(1).pci_info_value();
        let (_, devs) = devices(vec![
            MockDevice::new(0)
                .with_remote_gpu(0, gpu1)
                .with_remote_gpu(1, gpu1)
                .with_remote_gpu(2, gpu1)
                .with_ancestor(2, TopologyLevel::Node),
            MockDevice::new(1),
            MockDevice::new(2),
        ]);

        let graph = TopologyGraphBuilder::new(4).build(&devs);
        assert_eq!(graph.connection(0, 1), Some(Connection::NvLink(3)));
        assert_eq!(graph.connection(1, 0).map(|c| c.label()), Some("NV3".to_string()));
        assert_eq!(graph.connection(2, 0).map(|c| c.label()), Some("NODE".to_string()));
        assert_eq!(graph.connection(2, 2).map(|c| c.label()), Some("X".to_string()));
    }

    #[test]
    fn test_ancestor_failures() {
        let (mocks, devs) = devices(vec![
            MockDevice::new(0)
                .with_ancestor_error(1, DeviceError::NotSupported)
                .with_ancestor_error(2, DeviceError::GpuLost),
            MockDevice::new(1),
            MockDevice::new(2),
        ]);

        let graph = TopologyGraphBuilder::new(2).build(&devs);
        assert_eq!(graph.connection(0, 1), Some(Connection::Unknown));
        assert_eq!(graph.connection(0, 2), None);
        assert_eq!(graph.connection(2, 0), None);
        assert_eq!(mocks[0].ancestor_query_count(), 2);
    }

    #[test]
    fn test_nic_adjacency_grouped_by_endpoint() {
        let nic_a = PciInfo::new(0, 0x9a, 0);
        let nic_b = PciInfo::new(0, 0x9b, 0);
        let (_, devs) = devices(vec![MockDevice::new(0)
            .with_remote_endpoint(0, EndpointKind::Nic, nic_a)
            .with_remote_endpoint(1, EndpointKind::Nic, nic_a)
            .with_remote_endpoint(2, EndpointKind::Switch, nic_b)
            .with_remote_endpoint(3, EndpointKind::Unknown, PciInfo::new(0, 0x9c, 0))]);

        let graph = TopologyGraphBuilder::new(8).build(&devs);
        assert_eq!(
            graph.nic_adjacency,
            vec![
                NicAdjacency {
                    gpu: 0,
                    nic_pci_bus_id: nic_a.bus_id(),
                    kind: EndpointKind::Nic,
                    links: 2,
                },
                NicAdjacency {
                    gpu: 0,
                    nic_pci_bus_id: nic_b.bus_id(),
                    kind: EndpointKind::Switch,
                    links: 1,
                },
            ]
        );
    }

    #[test]
    fn test_affinity_labels() {
        let (_, devs) = devices(vec![MockDevice::new(0)
            .with_cpu_affinity(vec![0b111])
            .with_memory_affinity_error(DeviceError::NotSupported)]);
        let graph = TopologyGraphBuilder::new(1).build(&devs);
        assert_eq!(graph.nodes[0].cpu_affinity, "0-2");
        assert_eq!(graph.nodes[0].numa_affinity, "unknown");
        assert_eq!(graph.nodes[0].numa_id, "unknown");
        assert_eq!(graph.nodes[0].gpu_id(), "GPU0");
    }

    #[test]
    fn test_numa_id_needs_single_node() {
        let (_, devs) = devices(vec![
            MockDevice::new(0),
            MockDevice::new(1).with_memory_affinity(vec![0, 1 << 3]),
            MockDevice::new(2).with_memory_affinity(vec![0b11]),
        ]);
        let graph = TopologyGraphBuilder::new(1).build(&devs);
        assert_eq!(graph.nodes[0].numa_id, "0");
        assert_eq!(graph.nodes[1].numa_id, "67");
        assert_eq!(graph.nodes[2].numa_id, "unknown");
        assert_eq!(graph.nodes[2].numa_affinity, "0-1");
    }
}
