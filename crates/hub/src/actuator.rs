//! Actuator registry and relay driver. The `gpio` feature gates the real
//! rppal output backend; without it, a simulated backend records pin levels
//! in memory.
//!
//! The registry is the only place actuator state changes. Every transition,
//! including the auto-off deadline firing, happens under one mutex.

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::catalog::{ActuatorMeta, Catalog, Role, SafetyMeta};
use crate::clock::{plus_secs, secs_between, Clock, Timestamp};
use crate::error::ActuationError;

/// Longest the timer task sleeps before re-checking deadlines.
const MAX_TIMER_NAP: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Channel definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Channel {
    pub name: String,
    pub gpio_pin: u8,
    pub active_low: bool,
    pub role: Option<Role>,
    pub enabled: bool,
    pub zone: Option<String>,
    pub description: String,
    pub power_w: f64,
    pub quantity: u32,
    pub voltage_v: Option<f64>,
    pub notes: String,
    #[serde(flatten)]
    pub safety: SafetyMeta,
}

impl Channel {
    /// Role from the channel itself, then catalog metadata, then the name.
    pub fn resolved_role(&self, meta: Option<&ActuatorMeta>) -> Option<Role> {
        self.role
            .or_else(|| meta.and_then(|m| m.role))
            .or_else(|| Role::from_label(&self.name))
    }

    pub fn is_role(&self, role: Role, meta: Option<&ActuatorMeta>) -> bool {
        self.resolved_role(meta) == Some(role)
    }
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorState {
    pub on: bool,
    pub last_change_ts: Option<Timestamp>,
    /// Provenance of the last change: `manual`, `automation_*`, `auto_off`,
    /// `estop`, `stale_sensors`, ...
    pub reason: String,
    pub pending_auto_off: Option<Timestamp>,
}

impl ActuatorState {
    fn startup() -> Self {
        Self {
            on: false,
            last_change_ts: None,
            reason: "startup".to_string(),
            pending_auto_off: None,
        }
    }
}

/// Channel description plus live state, for status payloads.
#[derive(Debug, Clone, Serialize)]
pub struct ActuatorView {
    #[serde(flatten)]
    pub channel: Channel,
    #[serde(flatten)]
    pub state: ActuatorState,
}

// ---------------------------------------------------------------------------
// Output backends
// ---------------------------------------------------------------------------

/// Physical relay access. Errors are reported, never retried.
pub trait OutputBackend: Send + 'static {
    fn setup(&mut self, pin: u8, active_low: bool) -> Result<()>;
    fn write(&mut self, pin: u8, active_low: bool, on: bool) -> Result<()>;
}

/// Output level for a relay: active-low boards switch ON with LOW.
fn pin_level(active_low: bool, on: bool) -> bool {
    on != active_low
}

/// In-memory backend for development and tests. Clones share the same pin
/// table so a test can observe what the registry drove.
#[derive(Clone, Default)]
pub struct SimulatedOutputs {
    levels: Arc<Mutex<HashMap<u8, bool>>>,
}

impl SimulatedOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Physical level of a pin (`true` = HIGH), if it was ever set up.
    pub fn level(&self, pin: u8) -> Option<bool> {
        self.levels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pin)
            .copied()
    }
}

impl OutputBackend for SimulatedOutputs {
    fn setup(&mut self, pin: u8, active_low: bool) -> Result<()> {
        debug!(pin, active_low, "[sim-gpio] registered output (not wired)");
        self.write(pin, active_low, false)
    }

    fn write(&mut self, pin: u8, active_low: bool, on: bool) -> Result<()> {
        self.levels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pin, pin_level(active_low, on));
        Ok(())
    }
}

/// Real relay board (production, requires rppal + Raspberry Pi hardware).
#[cfg(feature = "gpio")]
pub struct GpioOutputs {
    gpio: Gpio,
    pins: HashMap<u8, OutputPin>,
}

#[cfg(feature = "gpio")]
impl GpioOutputs {
    pub fn new() -> Result<Self> {
        Ok(Self {
            gpio: Gpio::new()?,
            pins: HashMap::new(),
        })
    }
}

#[cfg(feature = "gpio")]
impl OutputBackend for GpioOutputs {
    fn setup(&mut self, pin: u8, active_low: bool) -> Result<()> {
        if !self.pins.contains_key(&pin) {
            let out = self.gpio.get(pin)?.into_output();
            self.pins.insert(pin, out);
        }
        // Fail-safe: ensure "OFF" right after claiming the pin.
        self.write(pin, active_low, false)
    }

    fn write(&mut self, pin: u8, active_low: bool, on: bool) -> Result<()> {
        let out = self
            .pins
            .get_mut(&pin)
            .ok_or_else(|| anyhow::anyhow!("gpio {pin} not set up"))?;
        if pin_level(active_low, on) {
            out.set_high();
        } else {
            out.set_low();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Inner {
    backend: Box<dyn OutputBackend>,
    channels: BTreeMap<String, Channel>,
    states: BTreeMap<String, ActuatorState>,
    last_stop: HashMap<String, Timestamp>,
}

/// Reasons that describe a reset rather than an actual stop; they never
/// start a cooldown.
fn resets_only(reason: &str) -> bool {
    matches!(reason, "startup" | "config_reload")
}

impl Inner {
    fn drive(&mut self, name: &str, on: bool) {
        let Some(chan) = self.channels.get(name) else {
            return;
        };
        let (pin, active_low) = (chan.gpio_pin, chan.active_low);
        if let Err(e) = self.backend.write(pin, active_low, on) {
            warn!(actuator = %name, pin, on, "relay write failed: {e:#}");
        }
    }

    /// Drive one channel and record the transition. Any pending auto-off is
    /// replaced.
    fn apply(&mut self, name: &str, on: bool, reason: &str, seconds: Option<u32>, now: Timestamp) {
        self.drive(name, on);
        let pending_auto_off = match seconds {
            Some(s) if on && s > 0 => Some(plus_secs(now, f64::from(s))),
            _ => None,
        };
        self.states.insert(
            name.to_string(),
            ActuatorState {
                on,
                last_change_ts: Some(now),
                reason: reason.to_string(),
                pending_auto_off,
            },
        );
        if !on && !resets_only(reason) {
            self.last_stop.insert(name.to_string(), now);
        }
        info!(actuator = %name, on, reason, seconds, "actuator set");
    }
}

pub struct ActuatorRegistry {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    timer_wake: Notify,
}

impl ActuatorRegistry {
    pub fn new(backend: Box<dyn OutputBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                backend,
                channels: BTreeMap::new(),
                states: BTreeMap::new(),
                last_stop: HashMap::new(),
            }),
            clock,
            timer_wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the full channel set. Every old output is driven off, the new
    /// outputs are claimed in the off position, and then every channel is
    /// switched off once more through the normal path.
    pub fn configure(&self, channels: Vec<Channel>) {
        let now = self.clock.now();
        let mut inner = self.lock();

        let old: Vec<String> = inner.channels.keys().cloned().collect();
        for name in &old {
            inner.drive(name, false);
        }

        inner.channels.clear();
        inner.states.clear();
        for mut chan in channels {
            let name = chan.name.trim().to_ascii_uppercase();
            chan.name = name.clone();
            if let Err(e) = inner.backend.setup(chan.gpio_pin, chan.active_low) {
                warn!(actuator = %name, pin = chan.gpio_pin, "output setup failed: {e:#}");
            }
            inner.states.insert(name.clone(), ActuatorState::startup());
            inner.channels.insert(name, chan);
        }

        let names: Vec<String> = inner.channels.keys().cloned().collect();
        for name in &names {
            inner.apply(name, false, "config_reload", None, now);
        }
        info!(channels = names.len(), "actuator channels configured");
    }

    /// The only mutator. Re-arming a channel cancels its pending auto-off;
    /// `seconds` arms a new one when turning on.
    pub fn set_state(
        &self,
        name: &str,
        on: bool,
        reason: &str,
        seconds: Option<u32>,
    ) -> Result<(), ActuationError> {
        let name = name.trim().to_ascii_uppercase();
        let now = self.clock.now();
        {
            let mut inner = self.lock();
            if !inner.channels.contains_key(&name) {
                return Err(ActuationError::UnknownActuator(name));
            }
            inner.apply(&name, on, reason, seconds, now);
        }
        if on && seconds.is_some_and(|s| s > 0) {
            self.timer_wake.notify_one();
        }
        Ok(())
    }

    /// Cancel every timer and force every channel off.
    pub fn all_off(&self, reason: &str) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let names: Vec<String> = inner.channels.keys().cloned().collect();
        for name in &names {
            inner.apply(name, false, reason, None, now);
        }
    }

    /// Switch off every channel that is on and matches `pred`. Returns the
    /// names that were switched.
    pub fn force_off_where(
        &self,
        reason: &str,
        mut pred: impl FnMut(&Channel) -> bool,
    ) -> Vec<String> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let targets: Vec<String> = inner
            .channels
            .iter()
            .filter(|(name, chan)| {
                inner.states.get(*name).is_some_and(|s| s.on) && pred(chan)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in &targets {
            inner.apply(name, false, reason, None, now);
        }
        targets
    }

    // -- Timers -------------------------------------------------------------

    /// Switch off every channel whose auto-off deadline has passed.
    pub fn fire_due(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let due: Vec<String> = inner
            .states
            .iter()
            .filter(|(_, s)| s.on && s.pending_auto_off.is_some_and(|d| d <= now))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &due {
            inner.apply(name, false, "auto_off", None, now);
        }
        due
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.lock()
            .states
            .values()
            .filter_map(|s| s.pending_auto_off)
            .min()
    }

    /// Timer task. Sleeps until the earliest deadline (or a re-arm wakes it)
    /// and fires what is due. Intended to be `tokio::spawn`-ed from main.
    pub async fn run_timers(self: Arc<Self>) {
        loop {
            let nap = match self.next_deadline() {
                Some(deadline) => {
                    let secs = secs_between(deadline, self.clock.now()).max(0.0);
                    Duration::from_secs_f64(secs).min(MAX_TIMER_NAP)
                }
                None => MAX_TIMER_NAP,
            };
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = self.timer_wake.notified() => {}
            }
            for name in self.fire_due() {
                info!(actuator = %name, "auto-off fired");
            }
        }
    }

    // -- Reads --------------------------------------------------------------

    pub fn state(&self, name: &str) -> Option<ActuatorState> {
        self.lock()
            .states
            .get(&name.trim().to_ascii_uppercase())
            .cloned()
    }

    pub fn is_on(&self, name: &str) -> bool {
        self.state(name).is_some_and(|s| s.on)
    }

    pub fn channel(&self, name: &str) -> Option<Channel> {
        self.lock()
            .channels
            .get(&name.trim().to_ascii_uppercase())
            .cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.lock().channels.values().cloned().collect()
    }

    pub fn name_for_pin(&self, pin: u8) -> Option<String> {
        self.lock()
            .channels
            .iter()
            .find(|(_, c)| c.gpio_pin == pin)
            .map(|(name, _)| name.clone())
    }

    pub fn last_stop(&self, name: &str) -> Option<Timestamp> {
        self.lock()
            .last_stop
            .get(&name.trim().to_ascii_uppercase())
            .copied()
    }

    /// Most recent stop of any channel whose role, resolved through the
    /// catalog, is pump.
    pub fn last_pump_stop(&self, catalog: &Catalog) -> Option<Timestamp> {
        let inner = self.lock();
        inner
            .channels
            .values()
            .filter(|c| c.is_role(Role::Pump, catalog.find_actuator(&c.name, Some(c.gpio_pin))))
            .filter_map(|c| inner.last_stop.get(&c.name).copied())
            .max()
    }

    pub fn snapshot(&self) -> Vec<ActuatorView> {
        let inner = self.lock();
        inner
            .channels
            .iter()
            .map(|(name, chan)| ActuatorView {
                channel: Channel {
                    role: chan.resolved_role(None),
                    ..chan.clone()
                },
                state: inner
                    .states
                    .get(name)
                    .cloned()
                    .unwrap_or_else(ActuatorState::startup),
            })
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    pub(crate) fn channel(name: &str, pin: u8, role: Option<Role>) -> Channel {
        Channel {
            name: name.to_string(),
            gpio_pin: pin,
            active_low: true,
            role,
            enabled: true,
            zone: None,
            description: String::new(),
            power_w: 0.0,
            quantity: 1,
            voltage_v: None,
            notes: String::new(),
            safety: SafetyMeta::default(),
        }
    }

    fn start() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (ActuatorRegistry, SimulatedOutputs, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let outputs = SimulatedOutputs::new();
        let reg = ActuatorRegistry::new(Box::new(outputs.clone()), clock.clone());
        reg.configure(vec![
            channel("R3_PUMP", 24, Some(Role::Pump)),
            channel("R2_FAN_MAIN", 23, None),
        ]);
        (reg, outputs, clock)
    }

    // -- configure ------------------------------------------------------------

    #[test]
    fn configure_drives_everything_off() {
        let (reg, outputs, _) = setup();
        // active-low: HIGH = OFF
        assert_eq!(outputs.level(24), Some(true));
        assert_eq!(outputs.level(23), Some(true));
        let st = reg.state("r3_pump").unwrap();
        assert!(!st.on);
        assert_eq!(st.reason, "config_reload");
        assert!(reg.last_stop("R3_PUMP").is_none());
        assert!(reg.last_pump_stop(&Catalog::default()).is_none());
    }

    #[test]
    fn reconfigure_twice_leaves_all_off_without_timers() {
        let (reg, outputs, _) = setup();
        reg.set_state("R3_PUMP", true, "manual", Some(10)).unwrap();
        assert_eq!(outputs.level(24), Some(false));

        let chans = reg.channels();
        reg.configure(chans.clone());
        reg.configure(chans);
        assert!(reg.snapshot().iter().all(|v| !v.state.on));
        assert_eq!(reg.next_deadline(), None);
        assert_eq!(outputs.level(24), Some(true));
    }

    #[test]
    fn reconfigure_releases_removed_channel() {
        let (reg, outputs, _) = setup();
        reg.set_state("R2_FAN_MAIN", true, "manual", None).unwrap();
        reg.configure(vec![channel("R3_PUMP", 24, Some(Role::Pump))]);
        assert_eq!(outputs.level(23), Some(true));
        assert!(reg.state("R2_FAN_MAIN").is_none());
    }

    // -- set_state ------------------------------------------------------------

    #[test]
    fn unknown_actuator_rejected() {
        let (reg, _, _) = setup();
        let err = reg.set_state("NOPE", true, "manual", None).unwrap_err();
        assert_eq!(err, ActuationError::UnknownActuator("NOPE".into()));
    }

    #[test]
    fn set_state_records_reason_and_time() {
        let (reg, outputs, clock) = setup();
        clock.advance_secs(5);
        reg.set_state("R2_FAN_MAIN", true, "automation_fan", None).unwrap();
        let st = reg.state("R2_FAN_MAIN").unwrap();
        assert!(st.on);
        assert_eq!(st.reason, "automation_fan");
        assert_eq!(st.last_change_ts, Some(clock.now()));
        assert_eq!(outputs.level(23), Some(false));
    }

    #[test]
    fn active_high_polarity() {
        let clock = Arc::new(ManualClock::new(start()));
        let outputs = SimulatedOutputs::new();
        let reg = ActuatorRegistry::new(Box::new(outputs.clone()), clock);
        let mut chan = channel("R5_LIGHT_MID", 20, Some(Role::Light));
        chan.active_low = false;
        reg.configure(vec![chan]);
        assert_eq!(outputs.level(20), Some(false));
        reg.set_state("R5_LIGHT_MID", true, "manual", None).unwrap();
        assert_eq!(outputs.level(20), Some(true));
    }

    #[test]
    fn pump_stop_recorded_for_any_reason() {
        let (reg, _, clock) = setup();
        reg.set_state("R3_PUMP", true, "manual", Some(5)).unwrap();
        clock.advance_secs(2);
        reg.set_state("R3_PUMP", false, "sensor_error", None).unwrap();
        assert_eq!(reg.last_pump_stop(&Catalog::default()), Some(clock.now()));
        assert_eq!(reg.last_stop("R3_PUMP"), Some(clock.now()));
    }

    #[test]
    fn fan_stop_does_not_touch_pump_stop() {
        let (reg, _, _) = setup();
        reg.set_state("R2_FAN_MAIN", false, "manual", None).unwrap();
        assert!(reg.last_pump_stop(&Catalog::default()).is_none());
        assert!(reg.last_stop("R2_FAN_MAIN").is_some());
    }

    #[test]
    fn pump_role_from_catalog_counts_as_pump_stop() {
        let clock = Arc::new(ManualClock::new(start()));
        let reg = ActuatorRegistry::new(Box::new(SimulatedOutputs::new()), clock.clone());
        reg.configure(vec![channel("R6_AUX", 12, None)]);
        reg.set_state("R6_AUX", true, "manual", Some(5)).unwrap();
        clock.advance_secs(3);
        reg.set_state("R6_AUX", false, "manual", None).unwrap();

        assert!(reg.last_pump_stop(&Catalog::default()).is_none());
        let catalog = Catalog {
            actuators: vec![ActuatorMeta {
                id: "drip_line".to_string(),
                legacy_name: None,
                name: None,
                role: Some(Role::Pump),
                zone: None,
                backend: crate::catalog::Backend::Local,
                node_id: None,
                supports_pwm: false,
                gpio_pin: Some(12),
                safety: SafetyMeta::default(),
            }],
            sensors: Vec::new(),
        };
        assert_eq!(reg.last_pump_stop(&catalog), Some(clock.now()));
    }

    // -- auto-off -------------------------------------------------------------

    #[test]
    fn auto_off_fires_once_after_duration() {
        let (reg, _, clock) = setup();
        reg.set_state("R3_PUMP", false, "manual", None).unwrap();
        reg.set_state("R3_PUMP", true, "manual", Some(10)).unwrap();
        clock.advance_secs(9);
        assert!(reg.fire_due().is_empty());
        clock.advance_secs(1);
        assert_eq!(reg.fire_due(), vec!["R3_PUMP".to_string()]);
        let st = reg.state("R3_PUMP").unwrap();
        assert!(!st.on);
        assert_eq!(st.reason, "auto_off");
        assert!(reg.fire_due().is_empty());
    }

    #[test]
    fn rearm_cancels_stale_deadline() {
        let (reg, _, clock) = setup();
        reg.set_state("R2_FAN_MAIN", true, "manual", Some(10)).unwrap();
        clock.advance_secs(5);
        reg.set_state("R2_FAN_MAIN", true, "manual", Some(60)).unwrap();
        clock.advance_secs(10);
        assert!(reg.fire_due().is_empty());
        assert!(reg.is_on("R2_FAN_MAIN"));
        assert_eq!(reg.next_deadline(), Some(plus_secs(start(), 65.0)));
    }

    #[test]
    fn manual_off_cancels_deadline() {
        let (reg, _, clock) = setup();
        reg.set_state("R3_PUMP", true, "manual", Some(10)).unwrap();
        reg.set_state("R3_PUMP", false, "manual", None).unwrap();
        reg.set_state("R3_PUMP", true, "manual", None).unwrap();
        clock.advance_secs(30);
        assert!(reg.fire_due().is_empty());
        assert!(reg.is_on("R3_PUMP"));
    }

    #[test]
    fn all_off_cancels_timers() {
        let (reg, _, _) = setup();
        reg.set_state("R3_PUMP", true, "manual", Some(10)).unwrap();
        reg.set_state("R2_FAN_MAIN", true, "manual", Some(20)).unwrap();
        reg.all_off("estop");
        assert_eq!(reg.next_deadline(), None);
        assert!(reg.snapshot().iter().all(|v| !v.state.on && v.state.reason == "estop"));
    }

    #[tokio::test]
    async fn timer_task_fires_with_system_clock() {
        let outputs = SimulatedOutputs::new();
        let reg = Arc::new(ActuatorRegistry::new(
            Box::new(outputs.clone()),
            Arc::new(crate::clock::SystemClock),
        ));
        reg.configure(vec![channel("R3_PUMP", 24, Some(Role::Pump))]);
        let task = tokio::spawn(Arc::clone(&reg).run_timers());
        reg.set_state("R3_PUMP", true, "manual", Some(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(!reg.is_on("R3_PUMP"));
        assert_eq!(outputs.level(24), Some(true));
        task.abort();
    }

    // -- force_off_where / roles ----------------------------------------------

    #[test]
    fn force_off_only_touches_matching_on_channels() {
        let (reg, _, _) = setup();
        reg.set_state("R3_PUMP", true, "manual", Some(5)).unwrap();
        reg.set_state("R2_FAN_MAIN", true, "manual", None).unwrap();
        let off = reg.force_off_where("stale_sensors", |c| c.is_role(Role::Pump, None));
        assert_eq!(off, vec!["R3_PUMP".to_string()]);
        assert!(reg.is_on("R2_FAN_MAIN"));
    }

    #[test]
    fn role_falls_back_to_name() {
        let chan = channel("R2_FAN_MAIN", 23, None);
        assert_eq!(chan.resolved_role(None), Some(Role::Fan));
        let chan = channel("R9_AUX", 9, None);
        assert_eq!(chan.resolved_role(None), None);
        let meta: ActuatorMeta = toml::from_str("id = \"aux\"\nrole = \"heater\"").unwrap();
        assert_eq!(chan.resolved_role(Some(&meta)), Some(Role::Heater));
    }

    #[test]
    fn snapshot_lists_channels_with_state() {
        let (reg, _, _) = setup();
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].channel.name, "R2_FAN_MAIN");
        assert_eq!(snap[0].channel.role, Some(Role::Fan));
        let json = serde_json::to_value(&snap[1]).unwrap();
        assert_eq!(json["name"], "R3_PUMP");
        assert_eq!(json["on"], false);
    }
}
