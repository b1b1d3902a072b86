//! Fixed-interval polling scheduler
//!
//! Runs every registered collector once on start, then again on every tick
//! until stopped. Collectors are isolated from each other: an error or panic
//! in one is logged and the rest of the pass continues.

use crate::collectors::Collector;
use crate::config::OverlapPolicy;
use crate::device::Device;
use crate::sink::ObservationSink;
use crate::{Result, TelemetryError};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

/// Scheduler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

/// Outcome of one pass over all collectors
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub succeeded: Vec<&'static str>,
    pub failed: Vec<&'static str>,
}

impl PassReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Shared pieces a pass needs, cheap to clone into a blocking task
#[derive(Clone)]
struct PassContext {
    collectors: Arc<Vec<Arc<dyn Collector>>>,
    devices: Arc<Vec<Arc<dyn Device>>>,
    sink: Arc<dyn ObservationSink>,
    completed: Arc<AtomicU64>,
}

impl PassContext {
    fn run(&self) -> PassReport {
        let mut report = PassReport::default();
        for collector in self.collectors.iter() {
            let name = collector.name();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                collector.collect(&self.devices, self.sink.as_ref())
            }));
            match outcome {
                Ok(Ok(())) => report.succeeded.push(name),
                Ok(Err(e)) => {
                    warn!(collector = name, error = %e, "Collector failed");
                    report.failed.push(name);
                }
                Err(_) => {
                    error!(collector = name, "Collector panicked");
                    report.failed.push(name);
                }
            }
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        report
    }
}

/// Clears the in-flight flag when a pass ends
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PollingScheduler {
    interval: Duration,
    overlap_policy: OverlapPolicy,
    collectors: Vec<Arc<dyn Collector>>,
    devices: Arc<Vec<Arc<dyn Device>>>,
    sink: Arc<dyn ObservationSink>,
    state: Arc<RwLock<SchedulerState>>,
    in_flight: Arc<AtomicBool>,
    completed: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
    shutdown_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl PollingScheduler {
    pub fn new(
        interval: Duration,
        overlap_policy: OverlapPolicy,
        devices: Arc<Vec<Arc<dyn Device>>>,
        sink: Arc<dyn ObservationSink>,
    ) -> Self {
        Self {
            interval,
            overlap_policy,
            collectors: Vec::new(),
            devices,
            sink,
            state: Arc::new(RwLock::new(SchedulerState::Idle)),
            in_flight: Arc::new(AtomicBool::new(false)),
            completed: Arc::new(AtomicU64::new(0)),
            skipped: Arc::new(AtomicU64::new(0)),
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Add a collector; passes run collectors in registration order
    pub fn register(&mut self, collector: Arc<dyn Collector>) -> Result<()> {
        if self.state() != SchedulerState::Idle {
            return Err(TelemetryError::Configuration(
                "collectors must be registered before the scheduler starts".to_string(),
            ));
        }
        debug!(collector = collector.name(), "Registered collector");
        self.collectors.push(collector);
        Ok(())
    }

    pub fn collector_names(&self) -> Vec<&'static str> {
        self.collectors.iter().map(|c| c.name()).collect()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    /// Passes that ran to completion
    pub fn completed_passes(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Ticks dropped because a pass was still running
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    fn context(&self) -> PassContext {
        PassContext {
            collectors: Arc::new(self.collectors.clone()),
            devices: Arc::clone(&self.devices),
            sink: Arc::clone(&self.sink),
            completed: Arc::clone(&self.completed),
        }
    }

    /// Run one pass on the blocking pool and wait for it
    pub async fn run_once(&self) -> Result<PassReport> {
        let context = self.context();
        tokio::task::spawn_blocking(move || context.run())
            .await
            .map_err(|e| TelemetryError::TransientQuery(format!("collection pass aborted: {}", e)))
    }

    /// Run the initial pass, then start the periodic loop.
    ///
    /// Returns the report of the initial pass.
    pub async fn start(&mut self) -> Result<PassReport> {
        {
            let mut state = self.state.write();
            if *state != SchedulerState::Idle {
                return Err(TelemetryError::Configuration(format!(
                    "scheduler cannot start from state {:?}",
                    *state
                )));
            }
            *state = SchedulerState::Running;
        }

        info!(
            interval = ?self.interval,
            collectors = self.collectors.len(),
            devices = self.devices.len(),
            "Starting polling scheduler"
        );

        let initial = self.run_once().await?;
        if !initial.is_clean() {
            warn!(failed = ?initial.failed, "Initial collection pass had failures");
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let context = self.context();
        let period = self.interval;
        let policy = self.overlap_policy;
        let in_flight = Arc::clone(&self.in_flight);
        let skipped = Arc::clone(&self.skipped);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let guard = match policy {
                            OverlapPolicy::Allow => None,
                            OverlapPolicy::SkipIfRunning => {
                                if in_flight
                                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                                    .is_err()
                                {
                                    skipped.fetch_add(1, Ordering::SeqCst);
                                    debug!("Previous collection pass still running, skipping tick");
                                    continue;
                                }
                                Some(InFlight(Arc::clone(&in_flight)))
                            }
                        };

                        let context = context.clone();
                        tokio::task::spawn_blocking(move || {
                            let _guard = guard;
                            let report = context.run();
                            debug!(
                                succeeded = report.succeeded.len(),
                                failed = report.failed.len(),
                                "Collection pass finished"
                            );
                        });
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Polling loop stopped");
        });

        self.shutdown_tx = Some(shutdown_tx);
        self.handle = Some(handle);
        Ok(initial)
    }

    /// Stop the periodic loop. A pass already running finishes on its own.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Polling loop ended abnormally");
            }
        }
        *self.state.write() = SchedulerState::Stopped;
        info!(passes = self.completed_passes(), "Polling scheduler stopped");
    }
}
