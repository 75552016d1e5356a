//! Heating: a temperature band on the selected sensor, optionally gated on
//! the fan running.

use serde::Serialize;

use super::control::{AutoOff, Hysteresis, ManualOverride};
use super::{Engine, Tick};
use crate::catalog::Role;
use crate::clock::Timestamp;
use crate::config::{AutomationConfig, HeaterConfig};
use crate::sensors::TempSource;

const PREFIX: &str = "heater_auto";

const FAN_BLOCK_KEY: &str = "heater_fan_block";
const FAN_BLOCK_ON: &str = "Heater automation waiting: fan is off.";
const FAN_BLOCK_OFF: &str = "Heater automation fan requirement satisfied.";

#[derive(Default)]
pub(super) struct HeaterState {
    pub(super) manual: ManualOverride,
    off: AutoOff,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeaterStatus {
    pub enabled: bool,
    pub sensor: TempSource,
    pub t_low: f64,
    pub t_high: f64,
    pub night_active: bool,
    pub max_on_minutes: u32,
    pub min_off_minutes: u32,
    pub fan_required: bool,
    pub manual_override_until: Option<Timestamp>,
    pub last_auto_off_ts: Option<Timestamp>,
    pub last_auto_off_reason: Option<String>,
}

/// Temperature band in force at `now`: (low, high, night).
fn thresholds(cfg: &HeaterConfig, now: Timestamp) -> (f64, f64, bool) {
    if cfg.night.enabled && cfg.night.window.contains_ts(now) {
        (cfg.night.t_low, cfg.night.t_high, true)
    } else {
        (cfg.t_low, cfg.t_high, false)
    }
}

/// Shortest non-zero of the safety limit and the loop's own limit, in
/// seconds. 0 = unlimited.
fn max_runtime(safety_secs: u32, loop_minutes: u32) -> u32 {
    let own = loop_minutes.saturating_mul(60);
    match (safety_secs, own) {
        (0, own) => own,
        (safety, 0) => safety,
        (safety, own) => safety.min(own),
    }
}

impl HeaterState {
    pub(super) fn reset(&mut self) {
        self.manual.reset();
        self.off.clear();
    }

    pub(super) fn status(&self, cfg: &HeaterConfig, now: Timestamp) -> HeaterStatus {
        let (t_low, t_high, night_active) = thresholds(cfg, now);
        HeaterStatus {
            enabled: cfg.enabled,
            sensor: cfg.sensor,
            t_low,
            t_high,
            night_active,
            max_on_minutes: cfg.max_on_minutes,
            min_off_minutes: cfg.min_off_minutes,
            fan_required: cfg.fan_required,
            manual_override_until: self.manual.until,
            last_auto_off_ts: self.off.last_ts,
            last_auto_off_reason: self.off.last_reason.clone(),
        }
    }
}

impl Engine {
    pub(super) async fn tick_heater(&self, tick: &Tick<'_>, cfg: &AutomationConfig, st: &mut HeaterState) {
        if tick.suppressed {
            return;
        }
        let now = tick.now;
        let heater = &cfg.heater;
        let Some(temperature) = tick.snap.trusted_temperature(heater.sensor) else {
            return;
        };
        let Some(target) = self.target(heater.channel.as_deref(), Role::Heater, tick.catalog) else {
            return;
        };
        if st
            .manual
            .check(&target.state, heater.manual_override_minutes, now)
            .is_some()
        {
            return;
        }

        let (low, high, _) = thresholds(heater, now);
        let auto = target.auto_on(PREFIX);
        let desired = Hysteresis::falling(low, high).wants_on(temperature, auto);

        // No fan channel at all means nothing to wait for.
        let fan_blocked = heater.fan_required
            && desired
            && self
                .target(cfg.fan.channel.as_deref(), Role::Fan, tick.catalog)
                .is_some_and(|fan| !fan.state.on);
        self.alerts
            .threshold(FAN_BLOCK_KEY, fan_blocked, FAN_BLOCK_ON, FAN_BLOCK_OFF)
            .await;
        if fan_blocked {
            if auto {
                self.auto_off(&target.name, "heater_auto_fan_required", &mut st.off)
                    .await;
            }
            return;
        }

        if auto {
            let limit = max_runtime(tick.limits.heater_max_seconds, heater.max_on_minutes);
            if target.ran_for(f64::from(limit), now) {
                self.auto_off(&target.name, "heater_auto_max", &mut st.off)
                    .await;
                return;
            }
        }
        if desired {
            if st.off.dwelling(heater.min_off_minutes, now) {
                return;
            }
            if !target.state.on {
                self.try_on(&target.name, None, "heater_auto_on").await;
            }
            return;
        }
        if auto {
            self.auto_off(&target.name, "heater_auto_off", &mut st.off)
                .await;
        }
    }
}
