//! Automation engine: five fixed control loops ticked on one interval.
//!
//! Every loop follows the same shape: find its channel, back off while a
//! manual override is in force, decide on/off from sensor data and its own
//! counters, and request changes through the safety gate.
//!
//! ```text
//!             ┌────────── manual change (override window) ──────────┐
//!             ▼                                                     │
//!  Off ──[wants_on && !dwelling]──▶ On(auto) ──[band released]──▶ Off(auto)
//!   ▲                                 │                              │
//!   │                                 └──[max runtime]──▶ Off(auto) ─┤
//!   └────────────────────[min-off dwell elapsed]────────────────────┘
//! ```
//!
//! Under an interlock the loops keep their counters but never touch an
//! actuator. Daily counters reset together at `reset_time`, before any loop
//! runs in that tick.

pub mod control;
mod fan;
mod heater;
mod light;
mod pump;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::actuator::ActuatorRegistry;
use crate::alerts::Alerts;
use crate::catalog::{Catalog, Role};
use crate::clock::{local, reset_key, secs_between, Clock, Timestamp};
use crate::config::AutomationConfig;
use crate::db::Db;
use crate::safety::SafetyGate;
use crate::sensors::{SensorCache, SensorSnapshot};
use crate::state::{Limits, SharedControl};

use control::{AutoOff, Target};
pub use fan::FanStatus;
pub use heater::HeaterStatus;
pub use light::LightStatus;
pub use pump::PumpStatus;

/// A rejected automatic turn-on is written to the event log at most this
/// often per channel.
const BLOCK_LOG_COOLDOWN_SECS: f64 = 120.0;

/// Alert key and messages for the pump daily budget block.
const PUMP_LIMIT_KEY: &str = "pump_daily_limit";
const PUMP_LIMIT_ON: &str = "Pump automation stopped: daily limit reached.";
const PUMP_LIMIT_OFF: &str = "Pump daily limit reset.";

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Which loops an override-clear applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideScope {
    All,
    Light,
    Fan,
    Heater,
    Pump,
}

impl OverrideScope {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Some(Self::All),
            "light" | "lux" => Some(Self::Light),
            "fan" => Some(Self::Fan),
            "heater" => Some(Self::Heater),
            "pump" => Some(Self::Pump),
            _ => None,
        }
    }

    fn covers(self, other: Self) -> bool {
        self == Self::All || self == other
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct EngineState {
    config: AutomationConfig,
    reset_key: NaiveDate,
    light: light::LightState,
    fan: fan::FanState,
    heater: heater::HeaterState,
    pump: pump::PumpState,
}

impl EngineState {
    fn new(config: AutomationConfig, now: Timestamp) -> Self {
        let key = reset_key(local(now), config.reset_time);
        Self {
            config,
            reset_key: key,
            light: light::LightState::new(now),
            fan: fan::FanState::default(),
            heater: heater::HeaterState::default(),
            pump: pump::PumpState::default(),
        }
    }
}

/// Inputs shared by every loop for one tick.
struct Tick<'a> {
    now: Timestamp,
    snap: &'a SensorSnapshot,
    /// An interlock is active: update counters, touch nothing.
    suppressed: bool,
    limits: &'a Limits,
    catalog: &'a Catalog,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutomationStatus {
    pub reset_key: NaiveDate,
    pub light: LightStatus,
    pub fan: FanStatus,
    pub heater: HeaterStatus,
    pub pump: PumpStatus,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    gate: Arc<SafetyGate>,
    registry: Arc<ActuatorRegistry>,
    sensors: Arc<SensorCache>,
    control: SharedControl,
    alerts: Arc<Alerts>,
    db: Db,
    clock: Arc<dyn Clock>,
    state: tokio::sync::Mutex<EngineState>,
    block_log: Mutex<HashMap<String, Timestamp>>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AutomationConfig,
        gate: Arc<SafetyGate>,
        registry: Arc<ActuatorRegistry>,
        sensors: Arc<SensorCache>,
        control: SharedControl,
        alerts: Arc<Alerts>,
        db: Db,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            gate,
            registry,
            sensors,
            control,
            alerts,
            db,
            clock,
            state: tokio::sync::Mutex::new(EngineState::new(config, now)),
            block_log: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the loop parameters. Counters and timers are kept.
    pub async fn set_config(&self, config: AutomationConfig) {
        self.state.lock().await.config = config;
    }

    /// Periodic task. Intended to be `tokio::spawn`-ed from main.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        info!(interval_secs = interval.as_secs(), "automation engine started");
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One evaluation of every enabled loop.
    pub async fn tick(&self) {
        let now = self.clock.now();
        let Some(snap) = self.sensors.latest().await else {
            debug!("automation tick skipped: no sensor snapshot yet");
            return;
        };
        let (suppressed, limits, catalog) = {
            let control = self.control.read().await;
            (
                control.interlock().is_some(),
                control.limits.clone(),
                control.catalog.clone(),
            )
        };
        let tick = Tick {
            now,
            snap: &snap,
            suppressed,
            limits: &limits,
            catalog: &catalog,
        };

        let mut st = self.state.lock().await;
        let key = reset_key(local(now), st.config.reset_time);
        if key != st.reset_key {
            st.reset_key = key;
            self.reset_daily(&mut st, now).await;
        }

        let st = &mut *st;
        let cfg = &st.config;
        if cfg.light.enabled {
            self.tick_light(&tick, &cfg.light, &mut st.light).await;
        }
        if cfg.fan.enabled {
            self.tick_fan(&tick, &cfg.fan, &mut st.fan).await;
        }
        if cfg.fan_periodic.enabled {
            self.tick_fan_periodic(&tick, cfg, &mut st.fan).await;
        }
        if cfg.heater.enabled {
            self.tick_heater(&tick, cfg, &mut st.heater).await;
        }
        if cfg.pump.enabled {
            self.tick_pump(&tick, cfg, &mut st.pump).await;
        }
    }

    async fn reset_daily(&self, st: &mut EngineState, now: Timestamp) {
        info!(day = %st.reset_key, "automation daily reset");
        st.light.reset(now);
        st.fan.reset();
        st.heater.reset();
        st.pump.reset();
        self.block_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.alerts
            .threshold(PUMP_LIMIT_KEY, false, PUMP_LIMIT_ON, PUMP_LIMIT_OFF)
            .await;
    }

    /// Mark every override in `scope` as cleared. Returns the loop names
    /// affected.
    pub async fn clear_override(&self, scope: OverrideScope) -> Vec<&'static str> {
        let now = self.clock.now();
        let mut st = self.state.lock().await;
        let mut cleared = Vec::new();
        if scope.covers(OverrideScope::Light) {
            st.light.manual.clear(now);
            cleared.push("lux");
        }
        if scope.covers(OverrideScope::Fan) {
            st.fan.manual.clear(now);
            cleared.push("fan");
        }
        if scope.covers(OverrideScope::Heater) {
            st.heater.manual.clear(now);
            cleared.push("heater");
        }
        if scope.covers(OverrideScope::Pump) {
            st.pump.manual.clear(now);
            cleared.push("pump");
        }
        drop(st);
        info!(?cleared, "manual override cleared");
        self.db
            .record_event(
                now,
                "automation",
                "info",
                "Manual override cleared",
                Some(json!({ "scopes": cleared })),
            )
            .await;
        cleared
    }

    pub async fn status(&self) -> AutomationStatus {
        let now = self.clock.now();
        let catalog = self.control.read().await.catalog.clone();
        let mut st = self.state.lock().await;
        let st = &mut *st;
        let pump_channel = self
            .target(st.config.pump.channel.as_deref(), Role::Pump, &catalog)
            .map(|t| t.name);
        let pump_used = match &pump_channel {
            Some(name) => st
                .pump
                .daily_used(&self.db, name, now)
                .await
                .unwrap_or_else(|e| {
                    warn!(actuator = %name, "pump usage lookup failed: {e:#}");
                    0.0
                }),
            None => 0.0,
        };
        AutomationStatus {
            reset_key: st.reset_key,
            light: st.light.status(&st.config.light, now),
            fan: st.fan.status(&st.config, now),
            heater: st.heater.status(&st.config.heater, now),
            pump: st.pump.status(&st.config.pump, pump_used, now),
        }
    }

    // -- Helpers shared by the loops -------------------------------------------

    /// The channel a loop drives: the configured name, else the first
    /// channel whose resolved role matches.
    fn target(&self, explicit: Option<&str>, role: Role, catalog: &Catalog) -> Option<Target> {
        let name = match explicit.map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => name.to_ascii_uppercase(),
            None => self
                .registry
                .channels()
                .into_iter()
                .find(|c| c.is_role(role, catalog.find_actuator(&c.name, Some(c.gpio_pin))))?
                .name,
        };
        let state = self.registry.state(&name)?;
        Some(Target { name, state })
    }

    /// Automatic turn-on through the safety gate. A rejection is logged
    /// (throttled per channel) and reported as `None`.
    async fn try_on(&self, name: &str, seconds: Option<u32>, reason: &str) -> Option<Option<u32>> {
        match self
            .gate
            .apply(name, true, seconds.map(i64::from), reason)
            .await
        {
            Ok(applied) => Some(applied),
            Err(e) => {
                let now = self.clock.now();
                let log = {
                    let mut last = self.block_log.lock().unwrap_or_else(|e| e.into_inner());
                    let due = last
                        .get(name)
                        .map_or(true, |ts| secs_between(now, *ts) >= BLOCK_LOG_COOLDOWN_SECS);
                    if due {
                        last.insert(name.to_string(), now);
                    }
                    due
                };
                if log {
                    warn!(actuator = %name, reason, "automation blocked: {e}");
                    self.db
                        .record_event(
                            now,
                            "automation",
                            "warning",
                            &format!("{name} automation blocked ({reason})"),
                            Some(json!({ "error": e.to_string(), "code": e.code() })),
                        )
                        .await;
                }
                None
            }
        }
    }

    /// Automatic switch-off; records the loop's last automatic off.
    async fn auto_off(&self, name: &str, reason: &str, off: &mut AutoOff) {
        match self.gate.apply(name, false, None, reason).await {
            Ok(_) => off.record(reason, self.clock.now()),
            Err(e) => warn!(actuator = %name, reason, "automatic off failed: {e}"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::actuator::tests::channel;
    use crate::actuator::Channel;
    use crate::alerts::tests::Recording;
    use crate::safety::tests::Rig;

    pub(crate) struct EngineRig {
        pub(crate) rig: Rig,
        pub(crate) engine: Engine,
        pub(crate) notes: Arc<Recording>,
    }

    impl EngineRig {
        pub(crate) async fn at(start: Timestamp, channels: Vec<Channel>, config: AutomationConfig) -> Self {
            let rig = Rig::at(start, channels).await;
            let notes = Arc::new(Recording::default());
            let alerts = Arc::new(Alerts::new(rig.clock.clone(), Some(rig.db.clone()), notes.clone()));
            let engine = Engine::new(
                config,
                rig.gate.clone(),
                rig.registry.clone(),
                rig.sensors.clone(),
                rig.control.clone(),
                alerts,
                rig.db.clone(),
                rig.clock.clone(),
            );
            Self { rig, engine, notes }
        }

        pub(crate) async fn readings(&self, temp: f64, hum: f64, lux: f64, soil: f64) {
            self.rig
                .sensors
                .install(crate::sensors::tests::healthy(self.rig.clock.now(), temp, hum, lux, soil))
                .await;
        }

        pub(crate) fn notes(&self) -> Vec<String> {
            self.notes
                .sent
                .lock()
                .unwrap()
                .iter()
                .map(|(_, m)| m.clone())
                .collect()
        }

        pub(crate) fn reason(&self, name: &str) -> String {
            self.rig.registry.state(name).unwrap().reason
        }
    }

    /// A local-time instant on 2024-06-01.
    pub(crate) fn local_at(h: u32, m: u32) -> Timestamp {
        crate::clock::from_local(
            chrono::NaiveDate::from_ymd_opt(2024, 6, 1)
                .unwrap()
                .and_hms_opt(h, m, 0)
                .unwrap(),
        )
    }

    pub(crate) fn greenhouse() -> Vec<Channel> {
        vec![
            channel("R1_HEATER_FAN", 18, None),
            channel("R2_FAN_MAIN", 23, None),
            channel("R3_PUMP", 24, None),
            channel("R5_LIGHT_MID", 20, None),
        ]
    }

    // -- scope ----------------------------------------------------------------

    #[test]
    fn override_scope_parsing() {
        assert_eq!(OverrideScope::parse("LUX"), Some(OverrideScope::Light));
        assert_eq!(OverrideScope::parse(" all "), Some(OverrideScope::All));
        assert_eq!(OverrideScope::parse("valve"), None);
    }

    // -- engine ---------------------------------------------------------------

    #[tokio::test]
    async fn no_snapshot_means_no_action() {
        let mut cfg = AutomationConfig::default();
        cfg.fan.enabled = true;
        let er = EngineRig::at(local_at(12, 0), greenhouse(), cfg).await;
        er.engine.tick().await;
        assert!(!er.rig.registry.is_on("R2_FAN_MAIN"));
    }

    #[tokio::test]
    async fn suppressed_under_safe_mode() {
        let mut cfg = AutomationConfig::default();
        cfg.fan.enabled = true;
        let er = EngineRig::at(local_at(12, 0), greenhouse(), cfg).await;
        er.rig.control.write().await.safe_mode = true;
        er.rig.climate(20.0, 95.0).await;
        er.engine.tick().await;
        assert!(!er.rig.registry.is_on("R2_FAN_MAIN"));

        er.rig.control.write().await.safe_mode = false;
        er.engine.tick().await;
        assert!(er.rig.registry.is_on("R2_FAN_MAIN"));
    }

    #[tokio::test]
    async fn role_resolution_prefers_explicit_channel() {
        let er = EngineRig::at(local_at(12, 0), greenhouse(), AutomationConfig::default()).await;
        let catalog = Catalog::default();
        assert_eq!(er.engine.target(None, Role::Fan, &catalog).unwrap().name, "R2_FAN_MAIN");
        assert_eq!(er.engine.target(None, Role::Heater, &catalog).unwrap().name, "R1_HEATER_FAN");
        assert_eq!(
            er.engine.target(Some("r5_light_mid"), Role::Fan, &catalog).unwrap().name,
            "R5_LIGHT_MID"
        );
        assert!(er.engine.target(Some("R9_NOPE"), Role::Fan, &catalog).is_none());
    }

    #[tokio::test]
    async fn blocked_turn_on_logged_once_per_cooldown() {
        let er = EngineRig::at(local_at(12, 0), greenhouse(), AutomationConfig::default()).await;
        er.rig.control.write().await.sensor_faults.pump = true;
        let start = er.rig.clock.now();

        assert!(er.engine.try_on("R3_PUMP", Some(5), "pump_auto_on").await.is_none());
        er.rig.clock.advance_secs(60);
        assert!(er.engine.try_on("R3_PUMP", Some(5), "pump_auto_on").await.is_none());
        er.rig.clock.advance_secs(61);
        assert!(er.engine.try_on("R3_PUMP", Some(5), "pump_auto_on").await.is_none());

        let blocked: Vec<_> = er
            .rig
            .db
            .events_since(start, Some("automation"))
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.message == "R3_PUMP automation blocked (pump_auto_on)")
            .collect();
        assert_eq!(blocked.len(), 2);
    }

    #[tokio::test]
    async fn daily_reset_clears_counters_and_pump_block() {
        let mut cfg = AutomationConfig::default();
        cfg.pump.enabled = true;
        cfg.pump.dry_threshold = 12000.0;
        cfg.light.enabled = true;
        let er = EngineRig::at(local_at(12, 0), greenhouse(), cfg).await;
        er.rig
            .db
            .log_actuation(er.rig.clock.now(), "R3_PUMP", true, "manual", Some(60))
            .await
            .unwrap();
        er.readings(22.0, 50.0, 400.0, 10000.0).await;
        er.rig.clock.advance_secs(30 * 60);
        er.engine.tick().await;
        let before = er.engine.status().await;
        assert!(before.pump.block_until.is_some());
        assert_eq!(before.light.ok_minutes_today, 30.0);

        er.rig.clock.advance_secs(25 * 3600);
        er.readings(22.0, 50.0, 100.0, 10000.0).await;
        er.engine.tick().await;
        let after = er.engine.status().await;
        assert_eq!(after.reset_key, chrono::NaiveDate::from_ymd_opt(2024, 6, 2).unwrap());
        assert_eq!(after.light.ok_minutes_today, 0.0);
        assert!(after.pump.block_until.is_none());
        assert!(er.rig.registry.is_on("R3_PUMP"));
        assert!(er.notes().contains(&PUMP_LIMIT_OFF.to_string()));
    }

    #[tokio::test]
    async fn clear_override_reports_scopes() {
        let er = EngineRig::at(local_at(12, 0), greenhouse(), AutomationConfig::default()).await;
        assert_eq!(er.engine.clear_override(OverrideScope::Fan).await, vec!["fan"]);
        assert_eq!(
            er.engine.clear_override(OverrideScope::All).await,
            vec!["lux", "fan", "heater", "pump"]
        );
    }

    #[tokio::test]
    async fn status_serialises() {
        let er = EngineRig::at(local_at(12, 0), greenhouse(), AutomationConfig::default()).await;
        let status = er.engine.status().await;
        let v = serde_json::to_value(&status).unwrap();
        assert_eq!(v["fan"]["rh_high"], 80.0);
        assert_eq!(v["pump"]["daily_used_seconds"], 0.0);
        assert_eq!(v["light"]["within_window"], true);
    }
}
