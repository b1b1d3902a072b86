//! Collector configuration

use crate::device::NVLINK_MAX_LINKS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do when a tick fires while the previous pass is still running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Start the pass anyway; passes may overlap
    #[default]
    Allow,
    /// Skip the tick while a pass holds the guard
    SkipIfRunning,
}

/// How often the topology collector runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyMode {
    Disabled,
    /// Once, during the initial pass
    #[default]
    Startup,
    EveryTick,
}

/// Per-collector enable flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorToggles {
    pub fabric_health: bool,
    pub nvlink_errors: bool,
    pub clock_events: bool,
}

impl Default for CollectorToggles {
    fn default() -> Self {
        Self {
            fabric_health: true,
            nvlink_errors: true,
            clock_events: true,
        }
    }
}

/// Telemetry collector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Polling scheduler tick period
    pub polling_interval: Duration,

    /// Bounded wait for the next fault event
    pub event_wait_timeout: Duration,

    /// Pause after a failed event wait
    pub event_error_backoff: Duration,

    pub overlap_policy: OverlapPolicy,

    pub topology_mode: TopologyMode,

    /// Window for repeated log suppression, zero to disable
    pub log_suppression_window: Duration,

    /// Link count used when a device cannot report one
    pub fallback_max_links: u32,

    pub collectors: CollectorToggles,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(60),
            event_wait_timeout: Duration::from_secs(5),
            event_error_backoff: Duration::from_millis(100),
            overlap_policy: OverlapPolicy::Allow,
            topology_mode: TopologyMode::Startup,
            log_suppression_window: Duration::from_secs(300),
            fallback_max_links: NVLINK_MAX_LINKS,
            collectors: CollectorToggles::default(),
        }
    }
}

impl CollectorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_event_wait_timeout(mut self, timeout: Duration) -> Self {
        self.event_wait_timeout = timeout;
        self
    }

    pub fn with_event_error_backoff(mut self, backoff: Duration) -> Self {
        self.event_error_backoff = backoff;
        self
    }

    pub fn with_overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.overlap_policy = policy;
        self
    }

    pub fn with_topology_mode(mut self, mode: TopologyMode) -> Self {
        self.topology_mode = mode;
        self
    }

    pub fn with_log_suppression_window(mut self, window: Duration) -> Self {
        self.log_suppression_window = window;
        self
    }

    pub fn with_fallback_max_links(mut self, links: u32) -> Self {
        self.fallback_max_links = links;
        self
    }

    pub fn with_collectors(mut self, collectors: CollectorToggles) -> Self {
        self.collectors = collectors;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.polling_interval.is_zero() {
            return Err("Polling interval must be greater than zero".to_string());
        }

        if self.event_wait_timeout.is_zero() {
            return Err("Event wait timeout must be greater than zero".to_string());
        }

        if !(1..=64).contains(&self.fallback_max_links) {
            return Err(format!(
                "Fallback max links must be between 1 and 64, got {}",
                self.fallback_max_links
            ));
        }

        Ok(())
    }
}

impl std::fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverlapPolicy::Allow => write!(f, "allow"),
            OverlapPolicy::SkipIfRunning => write!(f, "skip_if_running"),
        }
    }
}

impl std::str::FromStr for OverlapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(OverlapPolicy::Allow),
            "skip_if_running" | "skip" => Ok(OverlapPolicy::SkipIfRunning),
            _ => Err(format!("Unknown overlap policy: {}", s)),
        }
    }
}

impl std::fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyMode::Disabled => write!(f, "disabled"),
            TopologyMode::Startup => write!(f, "startup"),
            TopologyMode::EveryTick => write!(f, "every_tick"),
        }
    }
}

impl std::str::FromStr for TopologyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disabled" | "off" => Ok(TopologyMode::Disabled),
            "startup" => Ok(TopologyMode::Startup),
            "every_tick" => Ok(TopologyMode::EveryTick),
            _ => Err(format!("Unknown topology mode: {}", s)),
        }
    }
}
