//! Catalog metadata: richer per-actuator and per-sensor descriptions keyed by
//! id. Everything here is optional; lookups that miss degrade to the channel
//! list and name heuristics.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Pump,
    Heater,
    #[serde(alias = "fan_canopy", alias = "fan_box", alias = "fan_exhaust")]
    Fan,
    Light,
    Other,
}

impl Role {
    /// Last-resort role guess from a channel name or description.
    pub fn from_label(label: &str) -> Option<Role> {
        let label = label.to_ascii_uppercase();
        if label.contains("PUMP") {
            Some(Role::Pump)
        } else if label.contains("HEAT") {
            Some(Role::Heater)
        } else if label.contains("FAN") && !label.contains("POT") {
            Some(Role::Fan)
        } else if label.contains("LIGHT") {
            Some(Role::Light)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Safety caps
// ---------------------------------------------------------------------------

/// Per-actuator safety caps. A missing or zero value means "no cap".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyMeta {
    pub max_on_seconds: Option<u32>,
    pub max_daily_seconds: Option<u32>,
    pub cooldown_seconds: Option<u32>,
    pub requires_fan_dependency: bool,
}

impl SafetyMeta {
    pub fn max_on(&self) -> Option<u32> {
        self.max_on_seconds.filter(|v| *v > 0)
    }

    pub fn max_daily(&self) -> Option<u32> {
        self.max_daily_seconds.filter(|v| *v > 0)
    }

    pub fn cooldown(&self) -> Option<u32> {
        self.cooldown_seconds.filter(|v| *v > 0)
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    #[serde(alias = "pi_gpio", alias = "gpio")]
    Local,
    #[serde(alias = "esp32", alias = "node")]
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorMeta {
    pub id: String,
    #[serde(default)]
    pub legacy_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub supports_pwm: bool,
    #[serde(default)]
    pub gpio_pin: Option<u8>,
    #[serde(flatten)]
    pub safety: SafetyMeta,
}

impl ActuatorMeta {
    pub fn is_remote(&self) -> bool {
        self.backend == Backend::Remote || self.node_id.is_some()
    }

    /// Candidate local channel names, most specific first.
    pub fn channel_names(&self) -> impl Iterator<Item = String> + '_ {
        [self.legacy_name.as_deref(), self.name.as_deref(), Some(self.id.as_str())]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_ascii_uppercase)
    }

    fn matches_name(&self, target: &str) -> bool {
        self.channel_names().any(|n| n == target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorMeta {
    pub id: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub node_id: Option<String>,
}

impl SensorMeta {
    pub fn is_remote(&self) -> bool {
        self.backend == Backend::Remote || self.node_id.is_some()
    }

    /// Metric names that carry this sensor's primary values.
    pub fn metric_aliases(&self) -> &'static [&'static [&'static str]] {
        match self.kind.as_deref().unwrap_or("") {
            "dht11" | "dht22" | "sht31" => &[
                &["temp_c", "temperature", "temp"],
                &["rh_pct", "humidity", "hum"],
            ],
            "ds18b20" => &[&["temp_c", "temperature", "temp"]],
            "bh1750" | "ldr" => &[&["lux", "light", "lux_lm"]],
            "ads1115" | "soil" => &[&["soil_raw", "soil", "raw"]],
            _ => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub actuators: Vec<ActuatorMeta>,
    pub sensors: Vec<SensorMeta>,
}

impl Catalog {
    /// Metadata for a registered channel, matched by id/legacy name/name and
    /// then by GPIO pin.
    pub fn find_actuator(&self, name: &str, gpio_pin: Option<u8>) -> Option<&ActuatorMeta> {
        let target = name.trim().to_ascii_uppercase();
        self.actuators
            .iter()
            .find(|a| a.matches_name(&target))
            .or_else(|| {
                let pin = gpio_pin?;
                self.actuators
                    .iter()
                    .find(|a| !a.is_remote() && a.gpio_pin == Some(pin))
            })
    }

    pub fn actuator_by_id(&self, id: &str) -> Option<&ActuatorMeta> {
        self.actuators
            .iter()
            .find(|a| a.id == id || a.matches_name(&id.trim().to_ascii_uppercase()))
    }

    pub fn remote_actuators(&self) -> impl Iterator<Item = &ActuatorMeta> {
        self.actuators.iter().filter(|a| a.is_remote())
    }

    pub fn fans_in_zone<'a>(&'a self, zone: &'a str) -> impl Iterator<Item = &'a ActuatorMeta> {
        self.actuators
            .iter()
            .filter(move |a| a.role == Some(Role::Fan) && a.zone.as_deref() == Some(zone))
    }

    pub fn remote_sensors(&self) -> impl Iterator<Item = &SensorMeta> {
        self.sensors.iter().filter(|s| s.is_remote())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
