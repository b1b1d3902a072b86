use nvgpu_telemetry::config::{CollectorConfig, OverlapPolicy, TopologyMode};
use nvgpu_telemetry::device::{Device, EndpointKind, FabricInfo, FaultEventBus, PciInfo, SystemInfoSource};
use nvgpu_telemetry::mock::{mock_pci, mock_uuid, MockDevice, MockEventBus, MockSystemInfo};
use nvgpu_telemetry::names::{self, labels};
use nvgpu_telemetry::scheduler::SchedulerState;
use nvgpu_telemetry::{InMemorySink, TelemetryEngine};
use std::sync::Arc;
use std::time::Duration;

fn healthy_fabric() -> FabricInfo {
    FabricInfo {
        cluster_uuid: [0x11; 16],
        clique_id: 1,
        state: 3,
        status: 0,
        // all flags false, configuration none
        health_mask: 0b1010_1010 | (1 << 8),
    }
}

fn fleet() -> Vec<Arc<MockDevice>> {
    let gpu0 = MockDevice::new(0)
        .with_max_link_count(4)
        .with_active_links(&[0, 1])
        .with_field_value(206, 0, 2.0)
        .with_field_value(219, 1, 5.0)
        .with_field_value(119, 0, 3_000_000_000.0)
        .with_fabric_info(healthy_fabric())
        .with_remote_gpu(0, mock_pci(1))
        .with_remote_gpu(1, mock_pci(1))
        .with_remote_endpoint(2, EndpointKind::Switch, PciInfo::new(0, 0xe0, 0));
    let gpu1 = MockDevice::new(1)
        .with_max_link_count(4)
        .with_active_links(&[0])
        .with_field_value(206, 0, 0.0)
        .with_fabric_info(healthy_fabric())
        .with_remote_gpu(0, mock_pci(0))
        .with_remote_gpu(1, mock_pci(0));
    // lost GPU: every query fails, the others keep reporting
    let gpu2 = MockDevice::new(2)
        .with_uuid_error(nvgpu_telemetry::DeviceError::GpuLost);
    vec![Arc::new(gpu0), Arc::new(gpu1), Arc::new(gpu2)]
}

fn as_devices(mocks: &[Arc<MockDevice>]) -> Vec<Arc<dyn Device>> {
    mocks.iter().map(|m| m.clone() as Arc<dyn Device>).collect()
}

#[tokio::test]
async fn engine_collects_polls_and_counts_faults() {
    let mocks = fleet();
    let sink = Arc::new(InMemorySink::new());
    let config = CollectorConfig::default()
        .with_polling_interval(Duration::from_millis(25))
        .with_event_wait_timeout(Duration::from_millis(10))
        .with_overlap_policy(OverlapPolicy::SkipIfRunning);

    let mut engine = TelemetryEngine::new(config, as_devices(&mocks), sink.clone()).unwrap();
    let bus = MockEventBus::new();
    bus.push_xid(1, 79);
    let event_bus: Arc<dyn FaultEventBus> = Arc::new(bus.clone());

    let initial = engine.start(Some(event_bus)).await.unwrap();
    assert_eq!(engine.state(), SchedulerState::Running);
    // the lost GPU fails every per-device collector but topology
    assert_eq!(initial.succeeded, vec!["topology"]);
    assert_eq!(initial.failed, vec!["fabric_health", "nvlink_errors", "clock_events"]);

    let uuid0 = mock_uuid(0);
    let bus0 = mock_pci(0).bus_id();
    assert_eq!(
        sink.gauge(
            names::NVLINK_ERRORS,
            &[
                (labels::UUID, uuid0.as_str()),
                (labels::PCI_BUS_ID, bus0.as_str()),
                (labels::LINK, "1"),
                (labels::ERROR_TYPE, "effective_errors"),
            ],
        ),
        Some(5.0)
    );
    assert_eq!(
        sink.gauge(
            names::CLOCK_EVENT_DURATION,
            &[
                (labels::UUID, uuid0.as_str()),
                (labels::PCI_BUS_ID, bus0.as_str()),
                (labels::REASON, "sw_power_capping"),
            ],
        ),
        Some(3.0)
    );

    let summaries = sink.gauges(names::FABRIC_HEALTH_SUMMARY);
    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|(_, v)| *v == 1.0));

    let topology = sink.gauges(names::GPU_TOPOLOGY);
    assert_eq!(topology.len(), 6);
    assert!(topology
        .iter()
        .any(|(l, _)| l[labels::GPU_ID] == "GPU0" && l[labels::PEER_ID] == "GPU1" && l[labels::CONNECTION] == "NV2"));
    assert!(topology
        .iter()
        .any(|(l, _)| l[labels::GPU_ID] == "GPU1" && l[labels::PEER_ID] == "GPU2" && l[labels::CONNECTION] == "SYS"));
    assert_eq!(sink.gauges(names::NVLINK_NIC_ADJACENCY).len(), 1);

    // inventory skips the lost GPU and needs a system source for host versions
    let inventory = sink.gauges(names::GPU_INFO);
    assert_eq!(inventory.len(), 2);
    assert!(inventory.iter().all(|(l, _)| l[labels::NAME] == "Mock H100"));
    assert_eq!(sink.series_count(names::EXPORTER_INFO), 0);

    // counters move between ticks
    mocks[0].set_field_value(206, 0, 9.0);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(
        sink.gauge(
            names::NVLINK_ERRORS,
            &[
                (labels::UUID, uuid0.as_str()),
                (labels::PCI_BUS_ID, bus0.as_str()),
                (labels::LINK, "0"),
                (labels::ERROR_TYPE, "malformed_packet_errors"),
            ],
        ),
        Some(9.0)
    );
    // topology ran once at startup only
    assert!(mocks[0].field_query_count() >= 3);
    assert_eq!(mocks[0].ancestor_query_count() + mocks[1].ancestor_query_count(), 2);

    let counts = engine.fault_counts();
    assert_eq!(counts.count(&mock_uuid(1), 79), 1);
    let uuid1 = mock_uuid(1);
    let bus1 = mock_pci(1).bus_id();
    assert_eq!(
        sink.counter(
            names::XID_ERRORS,
            &[
                (labels::UUID, uuid1.as_str()),
                (labels::PCI_BUS_ID, bus1.as_str()),
                (labels::XID, "79"),
            ],
        ),
        Some(1)
    );

    engine.shutdown().await;
    assert_eq!(engine.state(), SchedulerState::Stopped);
    assert_eq!(bus.registered_devices(), vec![0, 1, 2]);
}

#[tokio::test]
async fn engine_without_event_bus_still_polls() {
    let mocks = fleet();
    let sink = Arc::new(InMemorySink::new());
    let config = CollectorConfig::default()
        .with_topology_mode(TopologyMode::EveryTick)
        .with_polling_interval(Duration::from_secs(3600));

    let system: Arc<dyn SystemInfoSource> = Arc::new(MockSystemInfo::new());
    let mut engine = TelemetryEngine::new(config, as_devices(&mocks[..2]), sink.clone())
        .unwrap()
        .with_system_info(system, "0.9.1");
    let report = engine.start(None).await.unwrap();
    assert!(report.is_clean(), "{:?}", report.failed);
    assert_eq!(sink.series_count(names::GPU_INFO), 2);
    let exporter = sink.gauges(names::EXPORTER_INFO);
    assert_eq!(exporter.len(), 1);
    assert_eq!(exporter[0].0[labels::VERSION], "0.9.1");
    assert_eq!(exporter[0].0[labels::DRIVER_VERSION], "560.35.03");

    engine.collect_now().await.unwrap();
    // the only pair is NVLink-connected, so no ancestor query is issued
    assert_eq!(mocks[0].ancestor_query_count(), 0);
    assert_eq!(sink.series_count(names::GPU_TOPOLOGY), 4);
    assert!(engine.fault_counts().is_empty());

    engine.shutdown().await;
}
