//! Irrigation: short pulses while the soil reads dry, within a daily
//! watering budget and the pump's cooldown.

use anyhow::Result;
use chrono::Duration;
use serde::Serialize;
use tracing::warn;

use super::control::ManualOverride;
use super::{Engine, Tick, PUMP_LIMIT_KEY, PUMP_LIMIT_OFF, PUMP_LIMIT_ON};
use crate::catalog::Role;
use crate::clock::{next_reset, secs_between, Timestamp};
use crate::config::{AutomationConfig, PumpConfig};
use crate::db::Db;

/// How long a daily-usage figure from the actuation log is reused.
const DAILY_CACHE_SECS: f64 = 30.0;

#[derive(Default)]
pub(super) struct PumpState {
    pub(super) manual: ManualOverride,
    block_until: Option<Timestamp>,
    /// (fetched at, seconds used)
    daily: Option<(Timestamp, f64)>,
    last_auto: Option<Timestamp>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PumpStatus {
    pub enabled: bool,
    pub soil_channel: String,
    pub dry_threshold: f64,
    pub dry_when_above: bool,
    pub pulse_seconds: u32,
    pub max_daily_seconds: u32,
    pub daily_used_seconds: f64,
    pub within_window: bool,
    pub block_until: Option<Timestamp>,
    pub manual_override_until: Option<Timestamp>,
    pub last_auto: Option<Timestamp>,
}

/// Dry by the configured direction. A zero threshold never triggers.
fn is_dry(cfg: &PumpConfig, value: f64) -> bool {
    if cfg.dry_threshold <= 0.0 {
        return false;
    }
    if cfg.dry_when_above {
        value >= cfg.dry_threshold
    } else {
        value <= cfg.dry_threshold
    }
}

impl PumpState {
    pub(super) fn reset(&mut self) {
        self.manual.reset();
        self.block_until = None;
        self.daily = None;
        self.last_auto = None;
    }

    /// Seconds the pump ran in the trailing 24 hours.
    pub(super) async fn daily_used(&mut self, db: &Db, name: &str, now: Timestamp) -> Result<f64> {
        if let Some((ts, used)) = self.daily {
            if secs_between(now, ts) < DAILY_CACHE_SECS {
                return Ok(used);
            }
        }
        let used = db.on_seconds_since(name, now - Duration::hours(24)).await?;
        self.daily = Some((now, used));
        Ok(used)
    }

    pub(super) fn status(&self, cfg: &PumpConfig, used: f64, now: Timestamp) -> PumpStatus {
        PumpStatus {
            enabled: cfg.enabled,
            soil_channel: cfg.soil_channel.clone(),
            dry_threshold: cfg.dry_threshold,
            dry_when_above: cfg.dry_when_above,
            pulse_seconds: cfg.pulse_seconds,
            max_daily_seconds: cfg.max_daily_seconds,
            daily_used_seconds: (used * 10.0).round() / 10.0,
            within_window: cfg.window.contains_ts(now),
            block_until: self.block_until,
            manual_override_until: self.manual.until,
            last_auto: self.last_auto,
        }
    }
}

impl Engine {
    pub(super) async fn tick_pump(&self, tick: &Tick<'_>, cfg: &AutomationConfig, st: &mut PumpState) {
        if tick.suppressed {
            return;
        }
        let now = tick.now;
        let pump = &cfg.pump;
        let soil = &tick.snap.soil;
        if !soil.status.is_trustworthy() {
            return;
        }
        let Some(target) = self.target(pump.channel.as_deref(), Role::Pump, tick.catalog) else {
            return;
        };
        let used = match st.daily_used(&self.db, &target.name, now).await {
            Ok(used) => used,
            Err(e) => {
                warn!(actuator = %target.name, "pump usage lookup failed: {e:#}");
                return;
            }
        };
        if st
            .manual
            .check(&target.state, pump.manual_override_minutes, now)
            .is_some()
        {
            return;
        }
        if target.state.on || !pump.window.contains_ts(now) {
            return;
        }

        let max_daily = f64::from(pump.max_daily_seconds);
        if pump.max_daily_seconds == 0 && st.block_until.take().is_some() {
            self.clear_pump_limit().await;
        }
        if pump.max_daily_seconds > 0 && used >= max_daily {
            if st.block_until.is_none() {
                st.block_until = Some(next_reset(now, cfg.reset_time));
                self.alerts
                    .threshold(PUMP_LIMIT_KEY, true, PUMP_LIMIT_ON, PUMP_LIMIT_OFF)
                    .await;
            }
            return;
        }
        if let Some(until) = st.block_until {
            if now < until {
                return;
            }
            st.block_until = None;
            self.clear_pump_limit().await;
        }

        if !soil.channel(&pump.soil_channel).is_some_and(|v| is_dry(pump, v)) {
            return;
        }
        let cooldown = f64::from(tick.limits.pump_cooldown_seconds);
        if self
            .registry
            .last_pump_stop(tick.catalog)
            .is_some_and(|ts| secs_between(now, ts) < cooldown)
        {
            return;
        }

        let mut pulse = pump.pulse_seconds.min(tick.limits.pump_max_seconds);
        if pump.max_daily_seconds > 0 {
            let remaining = (max_daily - used).floor();
            pulse = pulse.min(remaining.max(0.0) as u32);
        }
        if pulse == 0 {
            return;
        }
        if let Some(applied) = self.try_on(&target.name, Some(pulse), "pump_auto_on").await {
            if let Some(secs) = applied {
                st.daily = Some((now, used + f64::from(secs)));
            }
            st.last_auto = Some(now);
        }
    }

    async fn clear_pump_limit(&self) {
        self.alerts
            .threshold(PUMP_LIMIT_KEY, false, PUMP_LIMIT_ON, PUMP_LIMIT_OFF)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{greenhouse, local_at, EngineRig};
    use super::*;
    use crate::clock::{from_local, plus_secs, Clock};

    const PUMP: &str = "R3_PUMP";

    fn config() -> AutomationConfig {
        let mut cfg = AutomationConfig::default();
        cfg.pump.enabled = true;
        cfg.pump.dry_threshold = 12000.0;
        cfg
    }

    #[test]
    fn dryness_direction() {
        let mut cfg = config().pump;
        assert!(is_dry(&cfg, 11000.0));
        assert!(!is_dry(&cfg, 13000.0));
        cfg.dry_when_above = true;
        assert!(is_dry(&cfg, 13000.0));
        cfg.dry_threshold = 0.0;
        assert!(!is_dry(&cfg, 13000.0));
    }

    #[tokio::test]
    async fn dry_soil_starts_a_pulse() {
        let er = EngineRig::at(local_at(12, 0), greenhouse(), config()).await;
        er.readings(22.0, 50.0, 400.0, 10000.0).await;
        let now = er.rig.clock.now();
        er.engine.tick().await;
        let st = er.rig.registry.state(PUMP).unwrap();
        assert_eq!(st.reason, "pump_auto_on");
        assert_eq!(st.pending_auto_off, Some(plus_secs(now, 5.0)));
        let status = er.engine.status().await;
        assert_eq!(status.pump.daily_used_seconds, 5.0);
        assert_eq!(status.pump.last_auto, Some(now));
    }

    #[tokio::test]
    async fn wet_soil_or_outside_window_does_nothing() {
        let er = EngineRig::at(local_at(12, 0), greenhouse(), config()).await;
        er.readings(22.0, 50.0, 400.0, 15000.0).await;
        er.engine.tick().await;
        assert!(!er.rig.registry.is_on(PUMP));

        er.rig.clock.set(local_at(23, 0));
        er.readings(22.0, 50.0, 400.0, 10000.0).await;
        er.engine.tick().await;
        assert!(!er.rig.registry.is_on(PUMP));
    }

    #[tokio::test]
    async fn daily_limit_blocks_until_reset() {
        let er = EngineRig::at(local_at(12, 0), greenhouse(), config()).await;
        let now = er.rig.clock.now();
        er.rig
            .db
            .log_actuation(now, PUMP, true, "manual", Some(60))
            .await
            .unwrap();
        er.readings(22.0, 50.0, 400.0, 10000.0).await;
        er.engine.tick().await;
        assert!(!er.rig.registry.is_on(PUMP));

        let midnight = from_local(
            chrono::NaiveDate::from_ymd_opt(2024, 6, 2)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        );
        let status = er.engine.status().await;
        assert_eq!(status.pump.block_until, Some(midnight));
        assert!(er.notes().contains(&PUMP_LIMIT_ON.to_string()));
    }

    #[tokio::test]
    async fn pulse_clamped_to_remaining_budget() {
        let er = EngineRig::at(local_at(12, 0), greenhouse(), config()).await;
        let now = er.rig.clock.now();
        er.rig
            .db
            .log_actuation(now, PUMP, true, "manual", Some(57))
            .await
            .unwrap();
        er.readings(22.0, 50.0, 400.0, 10000.0).await;
        er.engine.tick().await;
        let st = er.rig.registry.state(PUMP).unwrap();
        assert_eq!(st.pending_auto_off, Some(plus_secs(now, 3.0)));
    }

    #[tokio::test]
    async fn waits_for_pump_cooldown() {
        let er = EngineRig::at(local_at(12, 0), greenhouse(), config()).await;
        er.rig.registry.set_state(PUMP, true, "pump_auto_on", Some(5)).unwrap();
        er.rig.registry.set_state(PUMP, false, "auto_off", None).unwrap();
        er.readings(22.0, 50.0, 400.0, 10000.0).await;
        er.engine.tick().await;
        assert!(!er.rig.registry.is_on(PUMP));

        er.rig.clock.advance_secs(61);
        er.engine.tick().await;
        assert!(er.rig.registry.is_on(PUMP));
    }

    #[tokio::test]
    async fn soil_fault_stops_irrigation() {
        let er = EngineRig::at(local_at(12, 0), greenhouse(), config()).await;
        let mut snap = crate::sensors::tests::healthy(er.rig.clock.now(), 22.0, 50.0, 400.0, 10000.0);
        snap.soil.status = crate::sensors::SensorStatus::Error;
        er.rig.sensors.install(snap).await;
        er.engine.tick().await;
        assert!(!er.rig.registry.is_on(PUMP));
    }
}
