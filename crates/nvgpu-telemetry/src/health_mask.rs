//! Fabric health mask decoding

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a sub-field of a packed mask is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskKind {
    /// Two-bit tri-state flag
    Flag { not_supported: u32, true_value: u32 },
    /// Wider enumeration reported as its raw ordinal
    Code { not_supported: u32 },
}

/// One named bit range in a packed mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskField {
    pub name: &'static str,
    pub offset: u32,
    pub width: u32,
    pub kind: MaskKind,
}

impl MaskField {
    pub fn extract(&self, mask: u64) -> u32 {
        let bits = if self.width >= 64 {
            mask >> self.offset
        } else {
            (mask >> self.offset) & ((1u64 << self.width) - 1)
        };
        bits as u32
    }

    pub fn classify(&self, raw: u32) -> MaskValue {
        match self.kind {
            MaskKind::Flag { not_supported, .. } if raw == not_supported => MaskValue::NotSupported,
            MaskKind::Flag { true_value, .. } => MaskValue::Flag(raw == true_value),
            MaskKind::Code { not_supported } if raw == not_supported => MaskValue::NotSupported,
            MaskKind::Code { .. } => MaskValue::Code(raw),
        }
    }
}

/// A decoded sub-field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskValue {
    NotSupported,
    Flag(bool),
    Code(u32),
}

impl MaskValue {
    pub fn is_supported(&self) -> bool {
        !matches!(self, MaskValue::NotSupported)
    }

    pub fn is_true(&self) -> bool {
        matches!(self, MaskValue::Flag(true))
    }
}

pub const FLAG_NOT_SUPPORTED: u32 = 0;
pub const FLAG_TRUE: u32 = 1;
pub const FLAG_FALSE: u32 = 2;

pub const CONFIG_NOT_SUPPORTED: u32 = 0;
pub const CONFIG_NONE: u32 = 1;
pub const CONFIG_INCORRECT_SYSGUID: u32 = 2;
pub const CONFIG_INCORRECT_CHASSIS_SN: u32 = 3;
pub const CONFIG_NO_PARTITION: u32 = 4;
pub const CONFIG_INSUFFICIENT_NVLINKS: u32 = 5;

const FLAG: MaskKind = MaskKind::Flag {
    not_supported: FLAG_NOT_SUPPORTED,
    true_value: FLAG_TRUE,
};

pub const DEGRADED_BANDWIDTH: MaskField = MaskField {
    name: "degraded_bandwidth",
    offset: 0,
    width: 2,
    kind: FLAG,
};
pub const ROUTE_RECOVERY: MaskField = MaskField {
    name: "route_recovery",
    offset: 2,
    width: 2,
    kind: FLAG,
};
pub const ROUTE_UNHEALTHY: MaskField = MaskField {
    name: "route_unhealthy",
    offset: 4,
    width: 2,
    kind: FLAG,
};
pub const ACCESS_TIMEOUT_RECOVERY: MaskField = MaskField {
    name: "access_timeout_recovery",
    offset: 6,
    width: 2,
    kind: FLAG,
};
pub const INCORRECT_CONFIGURATION: MaskField = MaskField {
    name: "incorrect_configuration",
    offset: 8,
    width: 14,
    kind: MaskKind::Code {
        not_supported: CONFIG_NOT_SUPPORTED,
    },
};

/// Layout of the fabric health mask
pub const FABRIC_HEALTH_FIELDS: [MaskField; 5] = [
    DEGRADED_BANDWIDTH,
    ROUTE_RECOVERY,
    ROUTE_UNHEALTHY,
    ACCESS_TIMEOUT_RECOVERY,
    INCORRECT_CONFIGURATION,
];

/// Overall fabric health, ordered by exported code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthSummary {
    NotSupported = 0,
    Healthy = 1,
    Unhealthy = 2,
    LimitedCapacity = 3,
}

impl HealthSummary {
    pub fn code(&self) -> u32 {
        *self as u32
    }
}

impl fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthSummary::NotSupported => "not_supported",
            HealthSummary::Healthy => "healthy",
            HealthSummary::Unhealthy => "unhealthy",
            HealthSummary::LimitedCapacity => "limited_capacity",
        };
        write!(f, "{}", s)
    }
}

/// Decoded fabric health mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FabricHealthMask {
    pub degraded_bandwidth: MaskValue,
    pub route_recovery: MaskValue,
    pub route_unhealthy: MaskValue,
    pub access_timeout_recovery: MaskValue,
    pub incorrect_configuration: MaskValue,
}

impl FabricHealthMask {
    pub fn decode(mask: u32) -> Self {
        let read = |field: &MaskField| field.classify(field.extract(u64::from(mask)));
        Self {
            degraded_bandwidth: read(&DEGRADED_BANDWIDTH),
            route_recovery: read(&ROUTE_RECOVERY),
            route_unhealthy: read(&ROUTE_UNHEALTHY),
            access_timeout_recovery: read(&ACCESS_TIMEOUT_RECOVERY),
            incorrect_configuration: read(&INCORRECT_CONFIGURATION),
        }
    }

    /// The four tri-state flags with their names, in mask order
    pub fn flags(&self) -> [(&'static str, MaskValue); 4] {
        [
            (DEGRADED_BANDWIDTH.name, self.degraded_bandwidth),
            (ROUTE_RECOVERY.name, self.route_recovery),
            (ROUTE_UNHEALTHY.name, self.route_unhealthy),
            (ACCESS_TIMEOUT_RECOVERY.name, self.access_timeout_recovery),
        ]
    }

    /// Priority cascade: not supported, then unhealthy, then limited capacity
    pub fn summary(&self) -> HealthSummary {
        let all_unsupported = self.flags().iter().all(|(_, v)| !v.is_supported())
            && !self.incorrect_configuration.is_supported();
        if all_unsupported {
            return HealthSummary::NotSupported;
        }

        let misconfigured = matches!(self.incorrect_configuration, MaskValue::Code(code) if code != CONFIG_NONE);
        if self.route_recovery.is_true()
            || self.route_unhealthy.is_true()
            || self.access_timeout_recovery.is_true()
            || misconfigured
        {
            return HealthSummary::Unhealthy;
        }

        if self.degraded_bandwidth.is_true() {
            return HealthSummary::LimitedCapacity;
        }

        HealthSummary::Healthy
    }
}
