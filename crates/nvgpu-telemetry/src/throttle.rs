//! Per-key log suppression
//!
//! Devices that lack a capability fail the same query every tick. The
//! throttle lets one record per key through each window and counts the rest,
//! so the next allowed record can report how many were dropped.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Decision for one log attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDecision {
    /// Emit the record; `suppressed` records were dropped since the last one
    Emit { suppressed: u64 },
    /// Drop the record
    Suppress,
}

impl LogDecision {
    pub fn should_log(&self) -> bool {
        matches!(self, LogDecision::Emit { .. })
    }
}

struct KeyState {
    last_emitted: Instant,
    suppressed: u64,
}

/// Window-based log throttle keyed by arbitrary strings
pub struct LogThrottle {
    window: Duration,
    keys: Mutex<HashMap<String, KeyState>>,
}

impl LogThrottle {
    /// A zero window disables suppression
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn check(&self, key: &str) -> LogDecision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> LogDecision {
        if self.window.is_zero() {
            return LogDecision::Emit { suppressed: 0 };
        }

        let mut keys = self.keys.lock();
        match keys.get_mut(key) {
            Some(state) if now.saturating_duration_since(state.last_emitted) < self.window => {
                state.suppressed += 1;
                LogDecision::Suppress
            }
            Some(state) => {
                let suppressed = std::mem::take(&mut state.suppressed);
                state.last_emitted = now;
                LogDecision::Emit { suppressed }
            }
            None => {
                keys.insert(
                    key.to_string(),
                    KeyState {
                        last_emitted: now,
                        suppressed: 0,
                    },
                );
                LogDecision::Emit { suppressed: 0 }
            }
        }
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
