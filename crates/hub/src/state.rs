use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::catalog::Catalog;
use crate::sensors::TempSource;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedControl = Arc<RwLock<ControlState>>;

// ---------------------------------------------------------------------------
// Interlocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Interlock {
    EStop,
    SafeMode,
}

impl fmt::Display for Interlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EStop => write!(f, "E-STOP"),
            Self::SafeMode => write!(f, "SAFE MODE"),
        }
    }
}

// ---------------------------------------------------------------------------
// Operator-tunable limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub pump_max_seconds: u32,
    pub pump_cooldown_seconds: u32,
    pub heater_max_seconds: u32,
    /// 0 disables the cutoff.
    pub heater_cutoff_temp: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            pump_max_seconds: 15,
            pump_cooldown_seconds: 60,
            heater_max_seconds: 300,
            heater_cutoff_temp: 30.0,
        }
    }
}

/// Threshold alerts raised by the health monitor. Zero disables a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub sensor_offline_minutes: u32,
    pub temp_high_c: f64,
    pub temp_low_c: f64,
    pub hum_high_pct: f64,
    pub hum_low_pct: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            sensor_offline_minutes: 5,
            temp_high_c: 30.0,
            temp_low_c: 0.0,
            hum_high_pct: 85.0,
            hum_low_pct: 0.0,
        }
    }
}

/// Sticky flags set by the health monitor and consumed by the safety gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SensorFaults {
    pub pump: bool,
    pub heater: bool,
}

// ---------------------------------------------------------------------------
// Control state
// ---------------------------------------------------------------------------

/// Process-wide switches and the latest configuration snapshot the safety
/// gate and the monitors consult.
pub struct ControlState {
    pub safe_mode: bool,
    pub estop: bool,
    pub sensor_faults: SensorFaults,
    pub limits: Limits,
    pub alert_thresholds: AlertThresholds,
    pub heater_sensor: TempSource,
    pub catalog: Catalog,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlSnapshot {
    pub safe_mode: bool,
    pub estop: bool,
    pub sensor_faults: SensorFaults,
    pub limits: Limits,
    pub alert_thresholds: AlertThresholds,
    pub heater_sensor: TempSource,
}

impl ControlState {
    pub fn new(start_in_safe_mode: bool) -> Self {
        Self {
            safe_mode: start_in_safe_mode,
            estop: false,
            sensor_faults: SensorFaults::default(),
            limits: Limits::default(),
            alert_thresholds: AlertThresholds::default(),
            heater_sensor: TempSource::default(),
            catalog: Catalog::default(),
        }
    }

    pub fn shared(self) -> SharedControl {
        Arc::new(RwLock::new(self))
    }

    /// The active interlock, E-STOP taking precedence.
    pub fn interlock(&self) -> Option<Interlock> {
        if self.estop {
            Some(Interlock::EStop)
        } else if self.safe_mode {
            Some(Interlock::SafeMode)
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            safe_mode: self.safe_mode,
            estop: self.estop,
            sensor_faults: self.sensor_faults,
            limits: self.limits.clone(),
            alert_thresholds: self.alert_thresholds.clone(),
            heater_sensor: self.heater_sensor,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
