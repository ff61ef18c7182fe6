//! Thermal and power context consumed by the governor.
//!
//! The platform reports a small ordinal thermal state plus charging and
//! low-power flags. The governor only ever sees them through the
//! [`DeviceContext`] trait, so the source can be polled from sysfs or pushed
//! by the host application.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Discrete thermal reading reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThermalState {
    #[default]
    Nominal,
    Fair,
    Serious,
    Critical,
    /// Any reading the table does not recognise.
    Unknown,
}

impl ThermalState {
    /// Map the reading onto [0, 1].
    ///
    /// Unrecognised readings map to the midpoint, a conservative default
    /// that throttles a little without assuming the worst.
    pub fn normalized(&self) -> f64 {
        match self {
            ThermalState::Nominal => 0.0,
            ThermalState::Fair => 0.33,
            ThermalState::Serious => 0.67,
            ThermalState::Critical => 1.0,
            ThermalState::Unknown => 0.5,
        }
    }

    pub fn is_nominal(&self) -> bool {
        matches!(self, ThermalState::Nominal)
    }

    /// Map a platform ordinal (0 = nominal .. 3 = critical).
    pub fn from_ordinal(ordinal: i64) -> Self {
        match ordinal {
            0 => ThermalState::Nominal,
            1 => ThermalState::Fair,
            2 => ThermalState::Serious,
            3 => ThermalState::Critical,
            _ => ThermalState::Unknown,
        }
    }

    /// Parse a textual reading. Never fails: unknown text becomes `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "nominal" => ThermalState::Nominal,
            "fair" => ThermalState::Fair,
            "serious" => ThermalState::Serious,
            "critical" => ThermalState::Critical,
            _ => ThermalState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThermalState::Nominal => "nominal",
            ThermalState::Fair => "fair",
            ThermalState::Serious => "serious",
            ThermalState::Critical => "critical",
            ThermalState::Unknown => "unknown",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ThermalState::Nominal => 0,
            ThermalState::Fair => 1,
            ThermalState::Serious => 2,
            ThermalState::Critical => 3,
            ThermalState::Unknown => u8::MAX,
        }
    }
}

impl fmt::Display for ThermalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ThermalState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

// Unrecognised strings decode as `Unknown` instead of failing.
impl<'de> Deserialize<'de> for ThermalState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(ThermalState::parse(&s))
    }
}

/// Source of thermal and power state.
pub trait DeviceContext: Send + Sync {
    fn thermal_state(&self) -> ThermalState;

    fn is_charging(&self) -> bool;

    fn is_low_power_mode(&self) -> bool;

    /// Heat sources unrelated to the workload. While any is active the
    /// governor keeps adapting but does not learn (persist) the result.
    fn has_external_heat_factors(&self) -> bool {
        self.is_charging() || self.is_low_power_mode()
    }
}

/// Device context whose values are pushed by the host.
#[derive(Debug, Default)]
pub struct PushDeviceContext {
    thermal: AtomicU8,
    charging: AtomicBool,
    low_power: AtomicBool,
}

impl PushDeviceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_thermal_state(&self, state: ThermalState) {
        self.thermal.store(state.to_u8(), Ordering::SeqCst);
    }

    pub fn set_charging(&self, charging: bool) {
        self.charging.store(charging, Ordering::SeqCst);
    }

    pub fn set_low_power_mode(&self, low_power: bool) {
        self.low_power.store(low_power, Ordering::SeqCst);
    }
}

impl DeviceContext for PushDeviceContext {
    fn thermal_state(&self) -> ThermalState {
        ThermalState::from_ordinal(self.thermal.load(Ordering::SeqCst) as i64)
    }

    fn is_charging(&self) -> bool {
        self.charging.load(Ordering::SeqCst)
    }

    fn is_low_power_mode(&self) -> bool {
        self.low_power.load(Ordering::SeqCst)
    }
}
