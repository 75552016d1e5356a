//! Ventilation: the humidity band loop and the periodic air exchange. Both
//! drive the same fan and share its override and min-off dwell.

use serde::Serialize;
use tracing::{info, warn};

use super::control::{AutoOff, Hysteresis, ManualOverride};
use super::{Engine, Tick};
use crate::catalog::Role;
use crate::clock::{secs_between, Timestamp};
use crate::config::{AutomationConfig, FanConfig, FanPeriodicConfig};
use crate::sensors::SensorSnapshot;

const PREFIX: &str = "fan_auto";
const PERIODIC_ON: &str = "fan_periodic_on";
/// The periodic run is ended by the loop; its auto-off only fires this long
/// after the scheduled end, if the engine has stalled.
const PERIODIC_TIMER_SLACK_SECS: u32 = 60;

#[derive(Default)]
pub(super) struct FanState {
    pub(super) manual: ManualOverride,
    off: AutoOff,
    periodic_last_start: Option<Timestamp>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FanStatus {
    pub enabled: bool,
    pub rh_high: f64,
    pub rh_low: f64,
    pub night_active: bool,
    pub max_on_minutes: u32,
    pub min_off_minutes: u32,
    pub manual_override_until: Option<Timestamp>,
    pub last_auto_off_ts: Option<Timestamp>,
    pub last_auto_off_reason: Option<String>,
    pub periodic_enabled: bool,
    pub periodic_every_minutes: u32,
    pub periodic_duration_minutes: u32,
    pub periodic_night_active: bool,
    pub periodic_last_start: Option<Timestamp>,
}

/// Humidity band in force at `now`: (high, low, night).
fn thresholds(cfg: &FanConfig, now: Timestamp) -> (f64, f64, bool) {
    if cfg.night.enabled && cfg.night.window.contains_ts(now) {
        (cfg.night.rh_high, cfg.night.rh_low, true)
    } else {
        (cfg.rh_high, cfg.rh_low, false)
    }
}

/// Periodic schedule in force at `now`: (every, duration, night).
fn schedule(cfg: &FanPeriodicConfig, now: Timestamp) -> (u32, u32, bool) {
    if cfg.night.enabled && cfg.night.window.contains_ts(now) {
        (cfg.night.every_minutes, cfg.night.duration_minutes, true)
    } else {
        (cfg.every_minutes, cfg.duration_minutes, false)
    }
}

fn trusted_humidity(snap: &SensorSnapshot) -> Option<f64> {
    snap.dht22
        .status
        .is_trustworthy()
        .then_some(snap.dht22.humidity)
        .flatten()
}

impl FanState {
    pub(super) fn reset(&mut self) {
        self.manual.reset();
        self.off.clear();
        self.periodic_last_start = None;
    }

    pub(super) fn status(&self, cfg: &AutomationConfig, now: Timestamp) -> FanStatus {
        let (rh_high, rh_low, night_active) = thresholds(&cfg.fan, now);
        let (every, duration, periodic_night_active) = schedule(&cfg.fan_periodic, now);
        FanStatus {
            enabled: cfg.fan.enabled,
            rh_high,
            rh_low,
            night_active,
            max_on_minutes: cfg.fan.max_on_minutes,
            min_off_minutes: cfg.fan.min_off_minutes,
            manual_override_until: self.manual.until,
            last_auto_off_ts: self.off.last_ts,
            last_auto_off_reason: self.off.last_reason.clone(),
            periodic_enabled: cfg.fan_periodic.enabled,
            periodic_every_minutes: every,
            periodic_duration_minutes: duration,
            periodic_night_active,
            periodic_last_start: self.periodic_last_start,
        }
    }
}

impl Engine {
    pub(super) async fn tick_fan(&self, tick: &Tick<'_>, cfg: &FanConfig, st: &mut FanState) {
        if tick.suppressed {
            return;
        }
        let now = tick.now;
        let Some(humidity) = trusted_humidity(tick.snap) else {
            return;
        };
        let Some(target) = self.target(cfg.channel.as_deref(), Role::Fan, tick.catalog) else {
            return;
        };
        if st
            .manual
            .check(&target.state, cfg.manual_override_minutes, now)
            .is_some()
        {
            return;
        }

        let (high, low, _) = thresholds(cfg, now);
        let band = Hysteresis::rising(high, low);
        let auto = target.auto_on(PREFIX);
        let desired = band.wants_on(humidity, auto);

        if auto && target.ran_for(f64::from(cfg.max_on_minutes) * 60.0, now) {
            self.auto_off(&target.name, "fan_auto_max", &mut st.off)
                .await;
            return;
        }
        if desired {
            if st.off.dwelling(cfg.min_off_minutes, now) {
                return;
            }
            if !target.state.on {
                self.try_on(&target.name, None, "fan_auto_on").await;
            }
            return;
        }
        if auto {
            self.auto_off(&target.name, "fan_auto_off", &mut st.off)
                .await;
        }
    }

    pub(super) async fn tick_fan_periodic(
        &self,
        tick: &Tick<'_>,
        cfg: &AutomationConfig,
        st: &mut FanState,
    ) {
        if tick.suppressed {
            return;
        }
        let now = tick.now;
        let Some(target) = self.target(cfg.fan.channel.as_deref(), Role::Fan, tick.catalog) else {
            return;
        };
        if st
            .manual
            .check(&target.state, cfg.fan.manual_override_minutes, now)
            .is_some()
        {
            return;
        }
        let (every, duration, _) = schedule(&cfg.fan_periodic, now);
        if every == 0 || duration == 0 {
            return;
        }

        if target.state.on {
            if target.state.reason != PERIODIC_ON
                || !target.ran_for(f64::from(duration) * 60.0, now)
            {
                return;
            }
            // Still humid: hand the running fan to the humidity loop.
            let humid = cfg.fan.enabled
                && trusted_humidity(tick.snap)
                    .is_some_and(|h| h >= thresholds(&cfg.fan, now).0);
            if humid {
                match self.gate.hand_over(&target.name, "fan_auto_on").await {
                    Ok(secs) => {
                        info!(actuator = %target.name, ?secs, "periodic run handed to humidity control");
                        return;
                    }
                    Err(e) => warn!(actuator = %target.name, "fan handoff failed: {e}"),
                }
            }
            self.auto_off(&target.name, "fan_periodic_off", &mut st.off)
                .await;
            return;
        }

        if st
            .periodic_last_start
            .is_some_and(|ts| secs_between(now, ts) < f64::from(every) * 60.0)
        {
            return;
        }
        if self
            .try_on(
                &target.name,
                Some(duration * 60 + PERIODIC_TIMER_SLACK_SECS),
                PERIODIC_ON,
            )
            .await
            .is_some()
        {
            st.periodic_last_start = Some(now);
        }
    }
}
