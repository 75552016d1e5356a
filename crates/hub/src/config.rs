//! TOML config file loading and validation for channels, catalog metadata,
//! sensors, safety limits, automation parameters and node credentials.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::actuator::Channel;
use crate::catalog::{Catalog, Role, SafetyMeta};
use crate::clock::{DailyWindow, TimeOfDay};
use crate::sensors::{soil_channel_index, TempSource};
use crate::state::{AlertThresholds, Limits};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runtime: RuntimeSettings,
    pub channels: Vec<ChannelEntry>,
    pub catalog: Catalog,
    pub sensors: SensorSettings,
    pub limits: Limits,
    pub alerts: AlertThresholds,
    pub automation: AutomationConfig,
    pub nodes: NodeSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub simulation: bool,
    pub start_in_safe_mode: bool,
    pub sensor_interval_secs: u64,
    pub automation_interval_secs: u64,
    pub health_interval_secs: u64,
    pub sensor_stale_secs: u64,
    pub sensor_read_timeout_ms: u64,
    pub sensor_log_interval_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            simulation: false,
            start_in_safe_mode: true,
            sensor_interval_secs: 3,
            automation_interval_secs: 3,
            health_interval_secs: 3,
            sensor_stale_secs: 15,
            sensor_read_timeout_ms: 2000,
            sensor_log_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelEntry {
    pub name: String,
    pub gpio_pin: i64,
    #[serde(default = "default_true")]
    pub active_low: bool,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub power_w: f64,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub voltage_v: Option<f64>,
    #[serde(default)]
    pub notes: String,
    #[serde(flatten)]
    pub safety: SafetyMeta,
}

fn default_true() -> bool {
    true
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    pub ds18b20_enabled: bool,
    pub bh1750_addr: u16,
    pub ads1115_addr: u16,
    pub w1_base: PathBuf,
    pub sim_scenario: String,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            ds18b20_enabled: true,
            bh1750_addr: 0x23,
            ads1115_addr: 0x48,
            w1_base: PathBuf::from("/sys/bus/w1/devices"),
            sim_scenario: "drying".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// node_id -> shared secret.
    pub tokens: BTreeMap<String, String>,
    pub rate_limit_secs: f64,
    pub command_rate_limit_secs: f64,
    pub command_ttl_secs: u32,
    pub command_max_queue: usize,
    pub stale_secs: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            tokens: BTreeMap::new(),
            rate_limit_secs: 0.2,
            command_rate_limit_secs: 0.2,
            command_ttl_secs: 30,
            command_max_queue: 50,
            stale_secs: 15,
        }
    }
}

// ---------------------------------------------------------------------------
// Automation parameters
// ---------------------------------------------------------------------------

fn window(start: (u32, u32), end: (u32, u32)) -> DailyWindow {
    DailyWindow::new(TimeOfDay::hm(start.0, start.1), TimeOfDay::hm(end.0, end.1))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub reset_time: TimeOfDay,
    pub light: LightConfig,
    pub fan: FanConfig,
    pub fan_periodic: FanPeriodicConfig,
    pub heater: HeaterConfig,
    pub pump: PumpConfig,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            reset_time: TimeOfDay::hm(0, 0),
            light: LightConfig::default(),
            fan: FanConfig::default(),
            fan_periodic: FanPeriodicConfig::default(),
            heater: HeaterConfig::default(),
            pump: PumpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LightConfig {
    pub enabled: bool,
    pub channel: Option<String>,
    pub lux_ok: f64,
    /// 0 disables the ceiling.
    pub lux_max: f64,
    pub target_ok_minutes: u32,
    pub window: DailyWindow,
    pub min_on_minutes: u32,
    pub min_off_minutes: u32,
    pub max_block_minutes: u32,
    pub manual_override_minutes: u32,
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: None,
            lux_ok: 350.0,
            lux_max: 0.0,
            target_ok_minutes: 300,
            window: window((6, 0), (22, 0)),
            min_on_minutes: 0,
            min_off_minutes: 0,
            max_block_minutes: 0,
            manual_override_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanConfig {
    pub enabled: bool,
    pub channel: Option<String>,
    pub rh_high: f64,
    pub rh_low: f64,
    pub max_on_minutes: u32,
    pub min_off_minutes: u32,
    pub manual_override_minutes: u32,
    pub night: FanNight,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanNight {
    pub enabled: bool,
    pub window: DailyWindow,
    pub rh_high: f64,
    pub rh_low: f64,
}

impl Default for FanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: None,
            rh_high: 80.0,
            rh_low: 70.0,
            max_on_minutes: 3,
            min_off_minutes: 2,
            manual_override_minutes: 10,
            night: FanNight::default(),
        }
    }
}

impl Default for FanNight {
    fn default() -> Self {
        Self {
            enabled: false,
            window: window((22, 0), (6, 0)),
            rh_high: 85.0,
            rh_low: 75.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanPeriodicConfig {
    pub enabled: bool,
    pub every_minutes: u32,
    pub duration_minutes: u32,
    pub night: PeriodicNight,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodicNight {
    pub enabled: bool,
    pub window: DailyWindow,
    pub every_minutes: u32,
    pub duration_minutes: u32,
}

impl Default for FanPeriodicConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            every_minutes: 60,
            duration_minutes: 2,
            night: PeriodicNight::default(),
        }
    }
}

impl Default for PeriodicNight {
    fn default() -> Self {
        Self {
            enabled: false,
            window: window((22, 0), (6, 0)),
            every_minutes: 90,
            duration_minutes: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaterConfig {
    pub enabled: bool,
    pub channel: Option<String>,
    pub sensor: TempSource,
    pub t_low: f64,
    pub t_high: f64,
    pub max_on_minutes: u32,
    pub min_off_minutes: u32,
    pub manual_override_minutes: u32,
    pub fan_required: bool,
    pub night: HeaterNight,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaterNight {
    pub enabled: bool,
    pub window: DailyWindow,
    pub t_low: f64,
    pub t_high: f64,
}

impl Default for HeaterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: None,
            sensor: TempSource::Dht22,
            t_low: 18.0,
            t_high: 20.0,
            max_on_minutes: 5,
            min_off_minutes: 2,
            manual_override_minutes: 10,
            fan_required: true,
            night: HeaterNight::default(),
        }
    }
}

impl Default for HeaterNight {
    fn default() -> Self {
        Self {
            enabled: false,
            window: window((22, 0), (6, 0)),
            t_low: 17.0,
            t_high: 19.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    pub enabled: bool,
    pub channel: Option<String>,
    pub soil_channel: String,
    /// 0 disables the dryness trigger.
    pub dry_threshold: f64,
    /// Capacitive probes read higher when dry; set true for those.
    pub dry_when_above: bool,
    pub pulse_seconds: u32,
    pub max_daily_seconds: u32,
    pub window: DailyWindow,
    pub manual_override_minutes: u32,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: None,
            soil_channel: "ch0".to_string(),
            dry_threshold: 0.0,
            dry_when_above: false,
            pulse_seconds: 5,
            max_daily_seconds: 60,
            window: window((6, 0), (22, 0)),
            manual_override_minutes: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

impl ChannelEntry {
    fn relay(name: &str, gpio_pin: i64, role: Role, description: &str) -> Self {
        Self {
            name: name.to_string(),
            gpio_pin,
            active_low: true,
            role: Some(role),
            enabled: true,
            zone: None,
            description: description.to_string(),
            power_w: 0.0,
            quantity: 1,
            voltage_v: Some(12.0),
            notes: String::new(),
            safety: SafetyMeta::default(),
        }
    }

    pub fn to_channel(&self) -> Channel {
        Channel {
            name: self.name.trim().to_ascii_uppercase(),
            gpio_pin: self.gpio_pin as u8,
            active_low: self.active_low,
            role: self.role,
            enabled: self.enabled,
            zone: self.zone.clone(),
            description: self.description.clone(),
            power_w: self.power_w,
            quantity: self.quantity,
            voltage_v: self.voltage_v,
            notes: self.notes.clone(),
            safety: self.safety.clone(),
        }
    }
}

/// The six-relay board the gateway ships with.
pub fn default_channels() -> Vec<ChannelEntry> {
    vec![
        ChannelEntry::relay("R1_HEATER_FAN", 18, Role::Heater, "Heater + fan"),
        ChannelEntry::relay("R2_FAN_MAIN", 23, Role::Fan, "12cm ventilation fan"),
        ChannelEntry::relay("R3_PUMP", 24, Role::Pump, "Pump"),
        ChannelEntry::relay("R4_FAN_L3", 25, Role::Fan, "Level 3 fan"),
        ChannelEntry::relay("R5_LIGHT_MID", 20, Role::Light, "Level 3 middle light"),
        ChannelEntry::relay("R6_LIGHT_BACK", 21, Role::Light, "Level 3 back light"),
    ]
}

impl Config {
    /// Configured channels, or the default board when none are listed.
    pub fn channels(&self) -> Vec<Channel> {
        if self.channels.is_empty() {
            default_channels().iter().map(ChannelEntry::to_channel).collect()
        } else {
            self.channels.iter().map(ChannelEntry::to_channel).collect()
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_runtime(&mut errors);
        self.validate_channels(&mut errors);
        self.validate_catalog(&mut errors);
        self.validate_automation(&mut errors);
        self.validate_nodes(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_runtime(&self, errors: &mut Vec<String>) {
        let r = &self.runtime;
        for (name, value) in [
            ("sensor_interval_secs", r.sensor_interval_secs),
            ("automation_interval_secs", r.automation_interval_secs),
            ("health_interval_secs", r.health_interval_secs),
            ("sensor_read_timeout_ms", r.sensor_read_timeout_ms),
        ] {
            if value == 0 {
                errors.push(format!("runtime: {name} must be positive"));
            }
        }
    }

    fn validate_channels(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<String> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, c) in self.channels.iter().enumerate() {
            let ctx = || {
                if c.name.trim().is_empty() {
                    format!("channels[{i}]")
                } else {
                    format!("channel '{}'", c.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if c.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(c.name.trim().to_ascii_uppercase()) {
                errors.push(format!("{}: duplicate channel name", ctx()));
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if !VALID_GPIO_PINS.contains(&c.gpio_pin) {
                errors.push(format!(
                    "{}: gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx(),
                    c.gpio_pin
                ));
            } else if !seen_pins.insert(c.gpio_pin) {
                errors.push(format!(
                    "{}: gpio_pin {} is already used by another channel",
                    ctx(),
                    c.gpio_pin
                ));
            }

            if c.power_w < 0.0 {
                errors.push(format!("{}: power_w must not be negative", ctx()));
            }
        }
    }

    fn validate_catalog(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        for a in &self.catalog.actuators {
            if a.id.trim().is_empty() {
                errors.push("catalog actuator: id is empty".to_string());
                continue;
            }
            if !seen_ids.insert(a.id.as_str()) {
                errors.push(format!("catalog actuator '{}': duplicate id", a.id));
            }
            if a.backend == crate::catalog::Backend::Remote
                && a.node_id.as_deref().map_or(true, |n| n.trim().is_empty())
            {
                errors.push(format!(
                    "catalog actuator '{}': remote backend requires node_id",
                    a.id
                ));
            }
            if a.safety.requires_fan_dependency && a.zone.is_none() {
                errors.push(format!(
                    "catalog actuator '{}': requires_fan_dependency needs a zone",
                    a.id
                ));
            }
        }
        let mut seen_sensors: HashSet<&str> = HashSet::new();
        for s in &self.catalog.sensors {
            if s.id.trim().is_empty() {
                errors.push("catalog sensor: id is empty".to_string());
            } else if !seen_sensors.insert(s.id.as_str()) {
                errors.push(format!("catalog sensor '{}': duplicate id", s.id));
            }
        }
    }

    fn validate_automation(&self, errors: &mut Vec<String>) {
        let a = &self.automation;
        if soil_channel_index(&a.pump.soil_channel).is_none() {
            errors.push(format!(
                "automation.pump: soil_channel '{}' must be one of ch0..ch3",
                a.pump.soil_channel
            ));
        }
        if a.light.lux_ok < 0.0 || a.light.lux_max < 0.0 {
            errors.push("automation.light: lux thresholds must not be negative".to_string());
        }
        if a.pump.dry_threshold < 0.0 {
            errors.push("automation.pump: dry_threshold must not be negative".to_string());
        }
        if self.limits.heater_cutoff_temp < 0.0 {
            errors.push("limits: heater_cutoff_temp must not be negative".to_string());
        }
    }

    fn validate_nodes(&self, errors: &mut Vec<String>) {
        for (node, token) in &self.nodes.tokens {
            if node.trim().is_empty() {
                errors.push("nodes.tokens: empty node id".to_string());
            }
            if token.trim().is_empty() {
                errors.push(format!("nodes.tokens: empty token for node '{node}'"));
            }
        }
        if self.nodes.command_max_queue == 0 {
            errors.push("nodes: command_max_queue must be positive".to_string());
        }
        if self.nodes.rate_limit_secs < 0.0 || self.nodes.command_rate_limit_secs < 0.0 {
            errors.push("nodes: rate limits must not be negative".to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Load + environment overrides
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults.
pub fn load(path: &str) -> Result<Config> {
    let config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Config::default()
    };
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Parse `node:token,node2:token2`. Malformed items are skipped.
pub fn parse_node_tokens(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|item| {
            let (node, token) = item.trim().split_once(':')?;
            let (node, token) = (node.trim(), token.trim());
            (!node.is_empty() && !token.is_empty()).then(|| (node.to_string(), token.to_string()))
        })
        .collect()
}

fn flag(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true")
}

/// Apply environment overrides on top of the file. `lookup` is
/// `std::env::var` in production.
pub fn apply_env(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SIMULATION_MODE") {
        config.runtime.simulation = flag(&v);
    }
    if let Some(v) = lookup("NODE_TOKENS") {
        config.nodes.tokens.extend(parse_node_tokens(&v));
    }
    if let Some(v) = lookup("NODE_COMMAND_TTL_SECONDS").and_then(|v| v.parse().ok()) {
        config.nodes.command_ttl_secs = v;
    }
    if let Some(v) = lookup("NODE_COMMAND_MAX_QUEUE").and_then(|v| v.parse().ok()) {
        config.nodes.command_max_queue = v;
    }
    if let Some(v) = lookup("NODE_STALE_SECONDS").and_then(|v| v.parse().ok()) {
        config.nodes.stale_secs = v;
    }
    if let Some(v) = lookup("SIM_SCENARIO") {
        config.sensors.sim_scenario = v;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_config() -> Config {
        Config {
            channels: default_channels(),
            ..Config::default()
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[runtime]
simulation = true
start_in_safe_mode = false

[[channels]]
name = "r3_pump"
gpio_pin = 24
role = "pump"
max_daily_seconds = 60

[[channels]]
name = "R2_FAN_MAIN"
gpio_pin = 23
active_low = false
zone = "tent"

[limits]
pump_max_seconds = 10

[automation]
reset_time = "04:00"

[automation.fan]
enabled = true
rh_high = 75
night = { enabled = true, window = { start = "21:00", end = "07:00" }, rh_high = 90, rh_low = 80 }

[automation.heater]
sensor = "ds18b20"

[automation.pump]
soil_channel = "ch2"
dry_when_above = true
dry_threshold = 18000

[nodes]
tokens = { "node-a" = "s3cret" }
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert!(config.runtime.simulation);
        assert!(!config.runtime.start_in_safe_mode);
        assert_eq!(config.runtime.sensor_interval_secs, 3);

        let channels = config.channels();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].name, "R3_PUMP");
        assert_eq!(channels[0].role, Some(Role::Pump));
        assert_eq!(channels[0].safety.max_daily(), Some(60));
        assert!(channels[0].active_low);
        assert!(!channels[1].active_low);
        assert_eq!(channels[1].role, None);

        assert_eq!(config.limits.pump_max_seconds, 10);
        assert_eq!(config.limits.pump_cooldown_seconds, 60);
        assert_eq!(config.automation.reset_time, TimeOfDay::hm(4, 0));
        assert_eq!(config.automation.fan.rh_high, 75.0);
        assert_eq!(config.automation.fan.rh_low, 70.0);
        assert!(config.automation.fan.night.enabled);
        assert_eq!(config.automation.fan.night.window.start, TimeOfDay::hm(21, 0));
        assert_eq!(config.automation.heater.sensor, TempSource::Ds18b20);
        assert!(config.automation.pump.dry_when_above);
        assert_eq!(config.nodes.tokens["node-a"], "s3cret");
        assert_eq!(config.nodes.command_ttl_secs, 30);
    }

    #[test]
    fn parse_empty_config_uses_default_board() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        let channels = config.channels();
        assert_eq!(channels.len(), 6);
        assert!(channels.iter().all(|c| c.active_low));
        assert!(config.runtime.start_in_safe_mode);
        assert!(!config.automation.light.enabled);
    }

    #[test]
    fn bad_time_of_day_rejected_at_parse() {
        let err = toml::from_str::<Config>(
            r#"
[automation.light]
window = { start = "6am", end = "22:00" }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("HH:MM"), "{err}");
    }

    // -- Validation: channels ---------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn channel_empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.channels[0].name = "  ".into();
        assert_validation_err(&cfg, "name is empty");
    }

    #[test]
    fn channel_duplicate_name_case_insensitive() {
        let mut cfg = valid_config();
        cfg.channels[1].name = "r1_heater_fan".into();
        assert_validation_err(&cfg, "duplicate channel name");
    }

    #[test]
    fn channel_gpio_pin_0_rejected() {
        let mut cfg = valid_config();
        cfg.channels[0].gpio_pin = 0;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn channel_gpio_pin_28_rejected() {
        let mut cfg = valid_config();
        cfg.channels[0].gpio_pin = 28;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn channel_duplicate_gpio_rejected() {
        let mut cfg = valid_config();
        cfg.channels[1].gpio_pin = 18;
        assert_validation_err(&cfg, "already used by another channel");
    }

    // -- Validation: catalog ----------------------------------------------

    #[test]
    fn remote_actuator_requires_node() {
        let mut cfg = valid_config();
        cfg.catalog = toml::from_str(
            r#"
[[actuators]]
id = "fan_remote"
backend = "remote"
"#,
        )
        .unwrap();
        assert_validation_err(&cfg, "remote backend requires node_id");
    }

    #[test]
    fn fan_dependency_requires_zone() {
        let mut cfg = valid_config();
        cfg.catalog = toml::from_str(
            r#"
[[actuators]]
id = "heater_1"
requires_fan_dependency = true
"#,
        )
        .unwrap();
        assert_validation_err(&cfg, "requires_fan_dependency needs a zone");
    }

    // -- Validation: automation + nodes -----------------------------------

    #[test]
    fn pump_soil_channel_must_exist() {
        let mut cfg = valid_config();
        cfg.automation.pump.soil_channel = "ch7".into();
        assert_validation_err(&cfg, "must be one of ch0..ch3");
    }

    #[test]
    fn empty_node_token_rejected() {
        let mut cfg = valid_config();
        cfg.nodes.tokens.insert("node-a".into(), " ".into());
        assert_validation_err(&cfg, "empty token for node 'node-a'");
    }

    #[test]
    fn zero_interval_rejected() {
        let mut cfg = valid_config();
        cfg.runtime.automation_interval_secs = 0;
        assert_validation_err(&cfg, "automation_interval_secs must be positive");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.channels[0].name = "".into();
        cfg.channels[1].gpio_pin = 1;
        cfg.automation.pump.soil_channel = "x".into();
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "wrong count in: {msg}");
        assert!(msg.contains("name is empty"), "missing name error in: {msg}");
        assert!(msg.contains("not a valid BCM GPIO pin"), "missing gpio error in: {msg}");
        assert!(msg.contains("soil_channel"), "missing soil error in: {msg}");
    }

    // -- Environment ------------------------------------------------------

    #[test]
    fn node_tokens_parsing() {
        let tokens = parse_node_tokens("node-a:abc, node-b : def ,bad,:x,y:");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens["node-a"], "abc");
        assert_eq!(tokens["node-b"], "def");
    }

    #[test]
    fn token_may_contain_colon() {
        let tokens = parse_node_tokens("node-a:abc:def");
        assert_eq!(tokens["node-a"], "abc:def");
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = valid_config();
        let env: BTreeMap<&str, &str> = [
            ("SIMULATION_MODE", "1"),
            ("NODE_TOKENS", "node-z:tok"),
            ("NODE_COMMAND_TTL_SECONDS", "45"),
            ("NODE_COMMAND_MAX_QUEUE", "not-a-number"),
        ]
        .into_iter()
        .collect();
        apply_env(&mut cfg, |k| env.get(k).map(|v| v.to_string()));
        assert!(cfg.runtime.simulation);
        assert_eq!(cfg.nodes.tokens["node-z"], "tok");
        assert_eq!(cfg.nodes.command_ttl_secs, 45);
        assert_eq!(cfg.nodes.command_max_queue, 50);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let cfg = load("/nonexistent/greenhouse.toml").unwrap();
        assert_eq!(cfg.channels().len(), 6);
    }
}
