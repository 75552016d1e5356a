//! Supplemental lighting: top up the day's minutes of adequate lux inside
//! the lighting window.

use serde::Serialize;

use super::control::{AutoOff, ManualOverride};
use super::{Engine, Tick};
use crate::alerts::{Severity, SENSOR_ALERT_COOLDOWN_SECS};
use crate::catalog::Role;
use crate::clock::{secs_between, Timestamp};
use crate::config::LightConfig;

/// Reason prefix owned by this loop.
const PREFIX: &str = "automation";

pub(super) struct LightState {
    pub(super) manual: ManualOverride,
    off: AutoOff,
    ok_minutes: f64,
    last_sample: Timestamp,
    block_until: Option<Timestamp>,
    paused: bool,
    target_met_alerted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LightStatus {
    pub enabled: bool,
    pub paused: bool,
    pub manual_override_until: Option<Timestamp>,
    pub block_until: Option<Timestamp>,
    pub ok_minutes_today: f64,
    pub target_ok_minutes: u32,
    pub target_reached: bool,
    pub within_window: bool,
    pub min_off_minutes: u32,
    pub last_auto_off_ts: Option<Timestamp>,
    pub last_auto_off_reason: Option<String>,
}

impl LightState {
    pub(super) fn new(now: Timestamp) -> Self {
        Self {
            manual: ManualOverride::default(),
            off: AutoOff::default(),
            ok_minutes: 0.0,
            last_sample: now,
            block_until: None,
            paused: false,
            target_met_alerted: false,
        }
    }

    pub(super) fn reset(&mut self, now: Timestamp) {
        let manual = std::mem::take(&mut self.manual);
        *self = Self::new(now);
        self.manual = manual;
        self.manual.reset();
    }

    fn target_reached(&self, cfg: &LightConfig) -> bool {
        cfg.target_ok_minutes > 0 && self.ok_minutes >= f64::from(cfg.target_ok_minutes)
    }

    pub(super) fn status(&self, cfg: &LightConfig, now: Timestamp) -> LightStatus {
        LightStatus {
            enabled: cfg.enabled,
            paused: cfg.enabled && self.paused,
            manual_override_until: self.manual.until.filter(|_| cfg.enabled),
            block_until: self.block_until.filter(|_| cfg.enabled),
            ok_minutes_today: (self.ok_minutes * 10.0).round() / 10.0,
            target_ok_minutes: cfg.target_ok_minutes,
            target_reached: cfg.enabled && self.target_reached(cfg),
            within_window: cfg.window.contains_ts(now),
            min_off_minutes: cfg.min_off_minutes,
            last_auto_off_ts: self.off.last_ts,
            last_auto_off_reason: self.off.last_reason.clone(),
        }
    }
}

impl Engine {
    pub(super) async fn tick_light(&self, tick: &Tick<'_>, cfg: &LightConfig, st: &mut LightState) {
        let now = tick.now;
        let reading = &tick.snap.bh1750;
        if !reading.status.is_trustworthy() {
            self.alerts
                .add_throttled(
                    "lux_paused",
                    SENSOR_ALERT_COOLDOWN_SECS,
                    Severity::Warning,
                    "Lux automation paused: BH1750 error",
                )
                .await;
            st.paused = true;
            // Time without a reading never counts toward the target.
            st.last_sample = now;
            return;
        }
        if st.paused {
            st.paused = false;
            self.alerts
                .add(Severity::Info, "Lux automation resumed: BH1750 OK")
                .await;
        }

        let lux = reading.lux;
        if lux.is_some_and(|l| l >= cfg.lux_ok) {
            st.ok_minutes += secs_between(now, st.last_sample).max(0.0) / 60.0;
        }
        st.last_sample = now;

        let Some(target) = self.target(cfg.channel.as_deref(), Role::Light, tick.catalog) else {
            return;
        };
        if tick.suppressed {
            return;
        }
        if st
            .manual
            .check(&target.state, cfg.manual_override_minutes, now)
            .is_some()
        {
            return;
        }
        let auto_on = target.auto_on(PREFIX);

        if cfg.lux_max > 0.0 && lux.is_some_and(|l| l >= cfg.lux_max) {
            self.alerts
                .add_throttled(
                    "lux_max",
                    SENSOR_ALERT_COOLDOWN_SECS,
                    Severity::Info,
                    "Lux automation paused: lux above maximum",
                )
                .await;
            if auto_on {
                self.auto_off(&target.name, "automation_lux_max", &mut st.off)
                    .await;
            }
            return;
        }

        let within = cfg.window.contains_ts(now);
        let reached = st.target_reached(cfg);
        let desired = within && !reached;

        if desired {
            if auto_on && target.ran_for(f64::from(cfg.max_block_minutes) * 60.0, now) {
                self.auto_off(&target.name, "automation_max_block", &mut st.off)
                    .await;
                st.block_until = Some(cfg.window.end_after(now));
                self.alerts
                    .add(
                        Severity::Warning,
                        "Lux automation blocked: max block limit reached",
                    )
                    .await;
                return;
            }
            if st.block_until.is_some_and(|until| now < until) {
                if auto_on {
                    self.auto_off(&target.name, "automation_block", &mut st.off)
                        .await;
                }
                return;
            }
            let cooling = st.off.dwelling(cfg.min_off_minutes, now)
                && st
                    .off
                    .last_reason
                    .as_deref()
                    .is_some_and(|r| r.starts_with(PREFIX) && r != "automation_window");
            if cooling {
                self.alerts
                    .add_throttled(
                        "lux_min_off",
                        SENSOR_ALERT_COOLDOWN_SECS,
                        Severity::Info,
                        "Lux automation paused: min off cooldown",
                    )
                    .await;
                return;
            }
            if !target.state.on {
                self.try_on(&target.name, None, PREFIX).await;
            }
            return;
        }

        st.block_until = None;
        if auto_on {
            if !within {
                self.auto_off(&target.name, "automation_window", &mut st.off)
                    .await;
                return;
            }
            if target.on_for(now) < f64::from(cfg.min_on_minutes) * 60.0 {
                return;
            }
            self.auto_off(&target.name, "automation_target_met", &mut st.off)
                .await;
            if !st.target_met_alerted {
                self.alerts
                    .add_throttled(
                        "lux_target_met",
                        SENSOR_ALERT_COOLDOWN_SECS,
                        Severity::Info,
                        "Lux automation target achieved",
                    )
                    .await;
                st.target_met_alerted = true;
            }
            return;
        }
        if !reached {
            st.target_met_alerted = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{greenhouse, local_at, EngineRig};
    use crate::clock::Clock;
    use crate::config::AutomationConfig;
    use crate::sensors::SensorStatus;

    const LIGHT: &str = "R5_LIGHT_MID";

    fn config(f: impl FnOnce(&mut crate::config::LightConfig)) -> AutomationConfig {
        let mut cfg = AutomationConfig::default();
        cfg.light.enabled = true;
        f(&mut cfg.light);
        cfg
    }

    #[tokio::test]
    async fn dark_window_turns_light_on() {
        let er = EngineRig::at(local_at(12, 0), greenhouse(), config(|_| {})).await;
        er.readings(20.0, 50.0, 100.0, 15000.0).await;
        er.engine.tick().await;
        assert!(er.rig.registry.is_on(LIGHT));
        assert_eq!(er.reason(LIGHT), "automation");
    }

    #[tokio::test]
    async fn target_met_switches_off_and_alerts_once() {
        let er = EngineRig::at(
            local_at(12, 0),
            greenhouse(),
            config(|l| l.target_ok_minutes = 10),
        )
        .await;
        er.readings(20.0, 50.0, 400.0, 15000.0).await;
        er.engine.tick().await;
        assert!(er.rig.registry.is_on(LIGHT));

        er.rig.clock.advance_secs(11 * 60);
        er.readings(20.0, 50.0, 400.0, 15000.0).await;
        er.engine.tick().await;
        assert!(!er.rig.registry.is_on(LIGHT));
        assert_eq!(er.reason(LIGHT), "automation_target_met");

        er.rig.clock.advance_secs(60);
        er.engine.tick().await;
        let achieved = er
            .notes()
            .iter()
            .filter(|m| *m == "Lux automation target achieved")
            .count();
        assert_eq!(achieved, 1);
        assert!(er.engine.status().await.light.target_reached);
    }

    #[tokio::test]
    async fn leaving_the_window_switches_off() {
        let er = EngineRig::at(local_at(21, 50), greenhouse(), config(|_| {})).await;
        er.readings(20.0, 50.0, 100.0, 15000.0).await;
        er.engine.tick().await;
        assert!(er.rig.registry.is_on(LIGHT));

        er.rig.clock.advance_secs(15 * 60);
        er.engine.tick().await;
        assert!(!er.rig.registry.is_on(LIGHT));
        assert_eq!(er.reason(LIGHT), "automation_window");
    }

    #[tokio::test]
    async fn bh1750_error_pauses_then_resumes() {
        let er = EngineRig::at(local_at(12, 0), greenhouse(), config(|_| {})).await;
        let mut snap = crate::sensors::tests::healthy(er.rig.clock.now(), 20.0, 50.0, 100.0, 1.0);
        snap.bh1750.status = SensorStatus::Error;
        snap.bh1750.lux = None;
        er.rig.sensors.install(snap).await;
        er.engine.tick().await;
        assert!(!er.rig.registry.is_on(LIGHT));
        assert!(er.engine.status().await.light.paused);

        er.readings(20.0, 50.0, 100.0, 15000.0).await;
        er.engine.tick().await;
        assert!(er.rig.registry.is_on(LIGHT));
        let notes = er.notes();
        assert!(notes.contains(&"Lux automation paused: BH1750 error".to_string()));
        assert!(notes.contains(&"Lux automation resumed: BH1750 OK".to_string()));
    }

    #[tokio::test]
    async fn manual_change_defers_automation() {
        let er = EngineRig::at(
            local_at(12, 0),
            greenhouse(),
            config(|l| l.manual_override_minutes = 10),
        )
        .await;
        er.rig.registry.set_state(LIGHT, false, "manual", None).unwrap();
        er.readings(20.0, 50.0, 100.0, 15000.0).await;
        er.engine.tick().await;
        assert!(!er.rig.registry.is_on(LIGHT));
        assert!(er.engine.status().await.light.manual_override_until.is_some());

        er.rig.clock.advance_secs(11 * 60);
        er.engine.tick().await;
        assert!(er.rig.registry.is_on(LIGHT));
    }

    #[tokio::test]
    async fn max_block_holds_light_off_until_window_end() {
        let er = EngineRig::at(
            local_at(12, 0),
            greenhouse(),
            config(|l| l.max_block_minutes = 30),
        )
        .await;
        er.readings(20.0, 50.0, 100.0, 15000.0).await;
        er.engine.tick().await;
        assert!(er.rig.registry.is_on(LIGHT));

        er.rig.clock.advance_secs(31 * 60);
        er.engine.tick().await;
        assert_eq!(er.reason(LIGHT), "automation_max_block");
        assert_eq!(
            er.engine.status().await.light.block_until,
            Some(local_at(22, 0))
        );

        er.rig.clock.advance_secs(60);
        er.engine.tick().await;
        assert!(!er.rig.registry.is_on(LIGHT));
    }

    #[tokio::test]
    async fn lux_ceiling_switches_off() {
        let er = EngineRig::at(local_at(12, 0), greenhouse(), config(|l| l.lux_max = 1000.0)).await;
        er.readings(20.0, 50.0, 100.0, 15000.0).await;
        er.engine.tick().await;
        assert!(er.rig.registry.is_on(LIGHT));

        er.readings(20.0, 50.0, 1500.0, 15000.0).await;
        er.engine.tick().await;
        assert_eq!(er.reason(LIGHT), "automation_lux_max");
        assert!(!er.rig.registry.is_on(LIGHT));
    }
}
