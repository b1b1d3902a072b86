//! Telemetry engine
//!
//! Wires configuration, devices and the sink to the polling scheduler, the
//! built-in collectors and the Xid event loop.

use crate::collectors::{ClockEventCollector, Collector, FabricHealthCollector, NvLinkErrorCollector, TopologyCollector};
use crate::config::{CollectorConfig, TopologyMode};
use crate::device::{Device, FaultEventBus, SystemInfoSource};
use crate::events::{EventCollector, FaultCounts};
use crate::inventory::InventoryPublisher;
use crate::scheduler::{PassReport, PollingScheduler, SchedulerState};
use crate::sink::ObservationSink;
use crate::throttle::LogThrottle;
use crate::{Result, TelemetryError};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct TelemetryEngine {
    config: CollectorConfig,
    devices: Arc<Vec<Arc<dyn Device>>>,
    sink: Arc<dyn ObservationSink>,
    inventory: Arc<InventoryPublisher>,
    scheduler: PollingScheduler,
    events: Arc<EventCollector>,
    event_shutdown: Option<watch::Sender<bool>>,
    event_handle: Option<JoinHandle<()>>,
}

impl TelemetryEngine {
    /// Create an engine with the built-in collectors enabled by `config`
    pub fn new(
        config: CollectorConfig,
        devices: Vec<Arc<dyn Device>>,
        sink: Arc<dyn ObservationSink>,
    ) -> Result<Self> {
        config.validate().map_err(TelemetryError::Configuration)?;
        if devices.is_empty() {
            return Err(TelemetryError::FatalInit("no GPU devices supplied".to_string()));
        }

        info!(
            devices = devices.len(),
            polling_interval = ?config.polling_interval,
            topology_mode = %config.topology_mode,
            overlap_policy = %config.overlap_policy,
            "Creating telemetry engine"
        );

        let devices = Arc::new(devices);
        let throttle = Arc::new(LogThrottle::new(config.log_suppression_window));

        let mut scheduler = PollingScheduler::new(
            config.polling_interval,
            config.overlap_policy,
            Arc::clone(&devices),
            Arc::clone(&sink),
        );

        let mut builtin: Vec<Arc<dyn Collector>> = Vec::new();
        if config.collectors.fabric_health {
            builtin.push(Arc::new(FabricHealthCollector::new(Arc::clone(&throttle))));
        }
        if config.collectors.nvlink_errors {
            builtin.push(Arc::new(NvLinkErrorCollector::new(
                config.fallback_max_links,
                Arc::clone(&throttle),
            )));
        }
        if config.collectors.clock_events {
            builtin.push(Arc::new(ClockEventCollector::new(Arc::clone(&throttle))));
        }
        if config.topology_mode != TopologyMode::Disabled {
            builtin.push(Arc::new(TopologyCollector::new(
                config.topology_mode,
                config.fallback_max_links,
            )));
        }
        for collector in builtin {
            scheduler.register(collector)?;
        }

        let events = Arc::new(EventCollector::new(
            Arc::clone(&devices),
            Arc::clone(&sink),
            config.event_wait_timeout,
            config.event_error_backoff,
        ));

        Ok(Self {
            config,
            devices,
            sink,
            inventory: Arc::new(InventoryPublisher::default()),
            scheduler,
            events,
            event_shutdown: None,
            event_handle: None,
        })
    }

    /// Publish `exporter_info` from `source` at start, labelled with `version`
    pub fn with_system_info(mut self, source: Arc<dyn SystemInfoSource>, version: impl Into<String>) -> Self {
        self.inventory = Arc::new(InventoryPublisher::new(version).with_system_info(source));
        self
    }

    /// Register an additional collector; must be called before `start`
    pub fn register_collector(&mut self, collector: Arc<dyn Collector>) -> Result<()> {
        self.scheduler.register(collector)
    }

    /// Start the event loop (when a bus is given) and the polling scheduler.
    ///
    /// Event subscription happens first so a subscription failure leaves
    /// nothing running. Returns the report of the initial collection pass.
    pub async fn start(&mut self, event_bus: Option<Arc<dyn FaultEventBus>>) -> Result<PassReport> {
        if self.scheduler.state() != SchedulerState::Idle {
            return Err(TelemetryError::Configuration("engine already started".to_string()));
        }

        if let Some(bus) = event_bus {
            let (tx, rx) = watch::channel(false);
            let handle = Arc::clone(&self.events).start(bus, rx).await?;
            self.event_shutdown = Some(tx);
            self.event_handle = Some(handle);
        } else {
            warn!("No fault event bus supplied, Xid events will not be collected");
        }

        self.publish_inventory().await;

        match self.scheduler.start().await {
            Ok(report) => {
                info!(
                    collectors = ?self.scheduler.collector_names(),
                    failed = ?report.failed,
                    "Telemetry engine started"
                );
                Ok(report)
            }
            Err(e) => {
                self.stop_events().await;
                Err(e)
            }
        }
    }

    async fn publish_inventory(&self) {
        let inventory = Arc::clone(&self.inventory);
        let devices = Arc::clone(&self.devices);
        let sink = Arc::clone(&self.sink);
        match tokio::task::spawn_blocking(move || inventory.publish(&devices, sink.as_ref())).await {
            Ok(report) if !report.failed.is_empty() => {
                warn!(failed = ?report.failed, "GPU info missing for some devices");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Inventory publication aborted"),
        }
    }

    /// Stop both loops and wait for them
    pub async fn shutdown(&mut self) {
        info!("Shutting down telemetry engine");
        self.scheduler.stop().await;
        self.stop_events().await;
    }

    async fn stop_events(&mut self) {
        if let Some(tx) = self.event_shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.event_handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Xid event loop ended abnormally");
            }
        }
    }

    /// Run a single collection pass outside the schedule
    pub async fn collect_now(&self) -> Result<PassReport> {
        self.scheduler.run_once().await
    }

    pub fn fault_counts(&self) -> Arc<FaultCounts> {
        self.events.counts()
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn collector_names(&self) -> Vec<&'static str> {
        self.scheduler.collector_names()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectorToggles;
    use crate::mock::{MockDevice, MockEventBus, MockSystemInfo};
    use crate::names::{self, labels};
    use crate::sink::InMemorySink;
    use crate::DeviceError;
    use std::time::Duration;

    fn devices(count: usize) -> Vec<Arc<dyn Device>> {
        (0..count)
            .map(|i| Arc::new(MockDevice::new(i)) as Arc<dyn Device>)
            .collect()
    }

    #[test]
    fn test_engine_rejects_bad_input() {
        let sink = Arc::new(InMemorySink::new());
        let error = TelemetryEngine::new(CollectorConfig::default(), Vec::new(), sink.clone())
            .err()
            .unwrap();
        assert!(matches!(error, TelemetryError::FatalInit(_)));

        let config = CollectorConfig::default().with_polling_interval(Duration::ZERO);
        let error = TelemetryEngine::new(config, devices(1), sink).err().unwrap();
        assert!(matches!(error, TelemetryError::Configuration(_)));
    }

    #[test]
    fn test_collector_selection() {
        let sink = Arc::new(InMemorySink::new());
        let engine = TelemetryEngine::new(CollectorConfig::default(), devices(1), sink.clone()).unwrap();
        assert_eq!(
            engine.collector_names(),
            vec!["fabric_health", "nvlink_errors", "clock_events", "topology"]
        );

        let config = CollectorConfig::default()
            .with_topology_mode(TopologyMode::Disabled)
            .with_collectors(CollectorToggles {
                fabric_health: false,
                nvlink_errors: true,
                clock_events: false,
            });
        let engine = TelemetryEngine::new(config, devices(2), sink).unwrap();
        assert_eq!(engine.collector_names(), vec!["nvlink_errors"]);
        assert_eq!(engine.device_count(), 2);
    }

    #[tokio::test]
    async fn test_inventory_published_at_start() {
        let sink = Arc::new(InMemorySink::new());
        let devices: Vec<Arc<dyn Device>> = vec![
            Arc::new(MockDevice::new(0)),
            Arc::new(MockDevice::new(1).with_gpu_info_error(DeviceError::NoPermission)),
        ];
        let system: Arc<dyn SystemInfoSource> = Arc::new(MockSystemInfo::new());
        let mut engine = TelemetryEngine::new(CollectorConfig::default(), devices, sink.clone())
            .unwrap()
            .with_system_info(system, "1.4.0-test");

        engine.start(None).await.unwrap();
        assert_eq!(sink.series_count(names::GPU_INFO), 1);
        let exporter = sink.gauges(names::EXPORTER_INFO);
        assert_eq!(exporter.len(), 1);
        assert_eq!(exporter[0].0[labels::VERSION], "1.4.0-test");
        assert_eq!(exporter[0].0[labels::CUDA_VERSION], "12.6");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_system_info_failure_does_not_block_start() {
        let sink = Arc::new(InMemorySink::new());
        let system: Arc<dyn SystemInfoSource> = Arc::new(MockSystemInfo::with_error(DeviceError::Uninitialized));
        let mut engine = TelemetryEngine::new(CollectorConfig::default(), devices(1), sink.clone())
            .unwrap()
            .with_system_info(system, "1.4.0-test");

        engine.start(None).await.unwrap();
        assert_eq!(engine.state(), SchedulerState::Running);
        assert_eq!(sink.series_count(names::EXPORTER_INFO), 0);
        assert_eq!(sink.series_count(names::GPU_INFO), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscription_failure_is_fatal() {
        let sink = Arc::new(InMemorySink::new());
        let mut engine = TelemetryEngine::new(CollectorConfig::default(), devices(1), sink).unwrap();
        let bus: Arc<dyn FaultEventBus> = Arc::new(MockEventBus::new().with_create_error(DeviceError::NoPermission));

        let error = engine.start(Some(bus)).await.unwrap_err();
        assert!(error.is_fatal());
        assert_eq!(engine.state(), SchedulerState::Idle);
    }
}
