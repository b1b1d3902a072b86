//! Critical fault (Xid) event loop
//!
//! Subscribes every device to critical Xid events once, then blocks on the
//! event source with a bounded timeout until shutdown. Each event increments
//! an in-memory fault table and the exported counter.

use crate::device::{Device, DeviceError, EventSource, FaultEvent, FaultEventBus, EVENT_TYPE_XID_CRITICAL_ERROR};
use crate::names::{self, labels};
use crate::sink::ObservationSink;
use crate::{Result, TelemetryError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Fault table key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FaultKey {
    pub uuid: String,
    pub code: u64,
}

/// Occurrences of one fault code on one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultRecord {
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Monotonic fault counters, never evicted
#[derive(Debug, Default)]
pub struct FaultCounts {
    entries: DashMap<FaultKey, FaultRecord>,
}

impl FaultCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence and return the new count
    pub fn record(&self, uuid: &str, code: u64) -> u64 {
        let now = Utc::now();
        let key = FaultKey {
            uuid: uuid.to_string(),
            code,
        };
        let mut entry = self.entries.entry(key).or_insert_with(|| FaultRecord {
            count: 0,
            first_seen: now,
            last_seen: now,
        });
        entry.count += 1;
        entry.last_seen = now;
        entry.count
    }

    pub fn get(&self, uuid: &str, code: u64) -> Option<FaultRecord> {
        let key = FaultKey {
            uuid: uuid.to_string(),
            code,
        };
        self.entries.get(&key).map(|r| r.value().clone())
    }

    pub fn count(&self, uuid: &str, code: u64) -> u64 {
        self.get(uuid, code).map_or(0, |r| r.count)
    }

    /// Sum of all counters
    pub fn total(&self) -> u64 {
        self.entries.iter().map(|r| r.value().count).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted copy of the table
    pub fn snapshot(&self) -> Vec<(FaultKey, FaultRecord)> {
        let mut rows: Vec<_> = self
            .entries
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

/// Outcome of one wait on the event source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPoll {
    /// Wait timed out; nothing recorded
    Timeout,
    /// A critical fault was recorded
    Handled { uuid: String, code: u64 },
    /// An event arrived that is not a critical fault or has no known device
    Ignored,
    /// The wait failed
    Failed(DeviceError),
}

pub struct EventCollector {
    devices: Arc<Vec<Arc<dyn Device>>>,
    sink: Arc<dyn ObservationSink>,
    counts: Arc<FaultCounts>,
    wait_timeout: Duration,
    error_backoff: Duration,
}

impl EventCollector {
    pub fn new(
        devices: Arc<Vec<Arc<dyn Device>>>,
        sink: Arc<dyn ObservationSink>,
        wait_timeout: Duration,
        error_backoff: Duration,
    ) -> Self {
        Self {
            devices,
            sink,
            counts: Arc::new(FaultCounts::new()),
            wait_timeout,
            error_backoff,
        }
    }

    pub fn counts(&self) -> Arc<FaultCounts> {
        Arc::clone(&self.counts)
    }

    /// Create an event source and register every device for critical Xid events.
    ///
    /// A device that cannot be registered is logged and skipped.
    pub fn subscribe(&self, bus: &dyn FaultEventBus) -> Result<Box<dyn EventSource>> {
        let mut source = bus
            .create_event_source()
            .map_err(|e| TelemetryError::FatalInit(format!("failed to create event set: {}", e)))?;

        let mut registered = 0;
        for (index, device) in self.devices.iter().enumerate() {
            match source.register(index, device.as_ref(), EVENT_TYPE_XID_CRITICAL_ERROR) {
                Ok(()) => registered += 1,
                Err(e) => {
                    warn!(gpu = index, error = %e, "Failed to register device for Xid events");
                }
            }
        }

        info!(
            registered = registered,
            devices = self.devices.len(),
            "Subscribed to critical Xid events"
        );
        Ok(source)
    }

    /// Wait once on `source` and record any critical fault
    pub fn wait_and_handle(&self, source: &mut dyn EventSource) -> EventPoll {
        match source.wait(self.wait_timeout) {
            Ok(None) => EventPoll::Timeout,
            Ok(Some(event)) => self.handle(event),
            Err(DeviceError::Timeout) => EventPoll::Timeout,
            Err(e) => {
                warn!(error = %e, "Failed to wait for Xid event");
                EventPoll::Failed(e)
            }
        }
    }

    fn handle(&self, event: FaultEvent) -> EventPoll {
        if event.event_type & EVENT_TYPE_XID_CRITICAL_ERROR == 0 {
            debug!(event_type = event.event_type, "Ignoring non-Xid event");
            return EventPoll::Ignored;
        }

        let Some(device) = self.devices.get(event.device_index) else {
            warn!(gpu = event.device_index, xid = event.data, "Xid event for unknown device");
            return EventPoll::Ignored;
        };

        let uuid = match device.uuid() {
            Ok(uuid) => uuid,
            Err(e) => {
                warn!(gpu = event.device_index, xid = event.data, error = %e, "Failed to get UUID for Xid event");
                return EventPoll::Ignored;
            }
        };
        let pci_bus_id = match device.pci_info() {
            Ok(pci) => pci.bus_id(),
            Err(e) => {
                warn!(uuid = %uuid, xid = event.data, error = %e, "Failed to get PCI info for Xid event");
                return EventPoll::Ignored;
            }
        };

        let code = event.data;
        let total = self.counts.record(&uuid, code);
        let xid = code.to_string();
        self.sink.increment_counter(
            names::XID_ERRORS,
            &[
                (labels::UUID, uuid.as_str()),
                (labels::PCI_BUS_ID, pci_bus_id.as_str()),
                (labels::XID, xid.as_str()),
            ],
        );
        warn!(uuid = %uuid, pci_bus_id = %pci_bus_id, xid = code, total = total, "Critical Xid error");

        EventPoll::Handled { uuid, code }
    }

    /// Blocking loop; returns once `shutdown` carries `true` or its sender is gone
    pub fn run(&self, source: &mut dyn EventSource, shutdown: watch::Receiver<bool>) {
        loop {
            match shutdown.has_changed() {
                Ok(_) if *shutdown.borrow() => break,
                Err(_) => break,
                Ok(_) => {}
            }

            if let EventPoll::Failed(_) = self.wait_and_handle(source) {
                if !self.error_backoff.is_zero() {
                    std::thread::sleep(self.error_backoff);
                }
            }
        }
        debug!(faults = self.counts.total(), "Xid event loop stopped");
    }

    /// Subscribe and run the loop on the blocking pool.
    ///
    /// Subscription errors are returned before anything is spawned.
    pub async fn start(
        self: Arc<Self>,
        bus: Arc<dyn FaultEventBus>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>> {
        let collector = Arc::clone(&self);
        let mut source = tokio::task::spawn_blocking(move || collector.subscribe(bus.as_ref()))
            .await
            .map_err(|e| TelemetryError::FatalInit(format!("event subscription aborted: {}", e)))??;

        Ok(tokio::task::spawn_blocking(move || {
            self.run(source.as_mut(), shutdown);
        }))
    }
}
