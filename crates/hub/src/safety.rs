//! The safety gate: the single entry point for every automated or manual
//! change to a local actuator.
//!
//! Checks run in a fixed order and the first failure wins; later checks
//! assume the earlier ones already hold. On success the (possibly clamped)
//! duration actually applied is returned.

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::actuator::{ActuatorRegistry, Channel};
use crate::catalog::{ActuatorMeta, Catalog, Role, SafetyMeta};
use crate::clock::{secs_between, Clock};
use crate::db::Db;
use crate::error::ActuationError;
use crate::remote::NodeProtocol;
use crate::sensors::SensorCache;
use crate::state::SharedControl;

/// Channel caps merged with catalog caps; the catalog wins where it sets a
/// value.
fn effective_safety(chan: &Channel, meta: Option<&ActuatorMeta>) -> SafetyMeta {
    let Some(m) = meta else {
        return chan.safety.clone();
    };
    SafetyMeta {
        max_on_seconds: m.safety.max_on().or(chan.safety.max_on()),
        max_daily_seconds: m.safety.max_daily().or(chan.safety.max_daily()),
        cooldown_seconds: m.safety.cooldown().or(chan.safety.cooldown()),
        requires_fan_dependency: m.safety.requires_fan_dependency
            || chan.safety.requires_fan_dependency,
    }
}

/// Whole seconds left of a cooldown, never less than one.
fn remaining(cooldown: u32, elapsed: f64) -> u64 {
    (f64::from(cooldown) - elapsed).ceil().max(1.0) as u64
}

pub struct SafetyGate {
    registry: Arc<ActuatorRegistry>,
    control: SharedControl,
    sensors: Arc<SensorCache>,
    nodes: Arc<NodeProtocol>,
    db: Db,
    clock: Arc<dyn Clock>,
}

impl SafetyGate {
    pub fn new(
        registry: Arc<ActuatorRegistry>,
        control: SharedControl,
        sensors: Arc<SensorCache>,
        nodes: Arc<NodeProtocol>,
        db: Db,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            control,
            sensors,
            nodes,
            db,
            clock,
        }
    }

    /// Validate and apply one request. `seconds` is the requested on-time;
    /// turning off ignores it.
    pub async fn apply(
        &self,
        name: &str,
        on: bool,
        seconds: Option<i64>,
        reason: &str,
    ) -> Result<Option<u32>, ActuationError> {
        let name = name.trim().to_ascii_uppercase();
        let result = self.check_and_apply(&name, on, seconds, reason, false).await;
        if let Err(e) = &result {
            debug!(actuator = %name, on, reason, code = e.code(), "actuation rejected: {e}");
        }
        result
    }

    /// Hand a running actuator to another owner under a new reason. The
    /// same checks as a turn-on apply, except the already-on and cooldown
    /// checks, and the new deadline comes from the caps alone. An actuator
    /// that is off is simply started.
    pub async fn hand_over(&self, name: &str, reason: &str) -> Result<Option<u32>, ActuationError> {
        let name = name.trim().to_ascii_uppercase();
        let result = self.check_and_apply(&name, true, None, reason, true).await;
        if let Err(e) = &result {
            debug!(actuator = %name, reason, code = e.code(), "hand-over rejected: {e}");
        }
        result
    }

    async fn check_and_apply(
        &self,
        name: &str,
        on: bool,
        seconds: Option<i64>,
        reason: &str,
        hand_over: bool,
    ) -> Result<Option<u32>, ActuationError> {
        let (interlock, faults, limits, heater_sensor, catalog) = {
            let control = self.control.read().await;
            (
                control.interlock(),
                control.sensor_faults,
                control.limits.clone(),
                control.heater_sensor,
                control.catalog.clone(),
            )
        };

        // 1. global interlocks
        if let Some(lock) = interlock {
            return Err(ActuationError::InterlockActive(lock));
        }

        let chan = self
            .registry
            .channel(name)
            .ok_or_else(|| ActuationError::UnknownActuator(name.to_string()))?;

        if !on {
            self.commit(name, false, reason, None).await?;
            return Ok(None);
        }

        let meta = catalog.find_actuator(name, Some(chan.gpio_pin));
        let safety = effective_safety(&chan, meta);
        let role = chan.resolved_role(meta);
        let now = self.clock.now();

        // 2. sensor-fault locks
        if role == Some(Role::Pump) && faults.pump {
            return Err(ActuationError::SensorFaultLocked {
                locked: "Pump",
                sensor: "soil",
            });
        }
        if role == Some(Role::Heater) && faults.heater {
            return Err(ActuationError::SensorFaultLocked {
                locked: "Heater",
                sensor: "temperature",
            });
        }

        // 3. companion fan
        if safety.requires_fan_dependency && !self.fan_running(&chan, meta, role, &catalog) {
            return Err(ActuationError::DependencyUnmet);
        }

        // 4. no-op
        let running = self.registry.is_on(name);
        if running && !hand_over {
            return Err(ActuationError::AlreadyOn);
        }
        let continuing = running && hand_over;

        // 5. duration sanity
        if seconds.is_some_and(|s| s <= 0) {
            return Err(ActuationError::InvalidDuration("Seconds must be positive"));
        }
        let mut secs: Option<u32> = seconds.map(|s| u32::try_from(s).unwrap_or(u32::MAX));

        // 6. pump
        if role == Some(Role::Pump) {
            let mut s = secs.ok_or(ActuationError::InvalidDuration("Pump requires seconds"))?;
            let mut cap = limits.pump_max_seconds;
            if let Some(m) = safety.max_on() {
                cap = if cap > 0 { cap.min(m) } else { m };
            }
            if cap > 0 {
                s = s.min(cap);
            }
            secs = Some(s);

            let cooldown = limits
                .pump_cooldown_seconds
                .max(safety.cooldown().unwrap_or(0));
            let last = self
                .registry
                .last_stop(name)
                .or_else(|| self.registry.last_pump_stop(&catalog));
            if let Some(last) = last.filter(|_| cooldown > 0 && !continuing) {
                let elapsed = secs_between(now, last);
                if elapsed < f64::from(cooldown) {
                    return Err(ActuationError::CooldownActive {
                        remaining_secs: remaining(cooldown, elapsed),
                        pump: true,
                    });
                }
            }
        }

        // 7. heater
        if role == Some(Role::Heater) {
            let cutoff = limits.heater_cutoff_temp;
            if cutoff > 0.0 {
                let temp = self
                    .sensors
                    .latest()
                    .await
                    .and_then(|snap| snap.trusted_temperature(heater_sensor));
                if let Some(temp) = temp.filter(|t| *t >= cutoff) {
                    return Err(ActuationError::HeaterCutoffExceeded { temp, cutoff });
                }
            }
            let max = limits.heater_max_seconds;
            if max > 0 {
                secs = Some(secs.map_or(max, |s| s.min(max)));
            }
        }

        // 8. per-channel absolute cap
        if let Some(max_on) = safety.max_on() {
            secs = Some(secs.map_or(max_on, |s| s.min(max_on)));
        }

        // 9. rolling 24h budget
        if let Some(max_daily) = safety.max_daily() {
            let used = match self.db.on_seconds_since(name, now - Duration::hours(24)).await {
                Ok(used) => used,
                Err(e) => {
                    warn!(actuator = %name, "daily budget lookup failed: {e:#}");
                    return Err(ActuationError::DailyBudgetExhausted);
                }
            };
            let left = i64::from(max_daily) - used as i64;
            if left <= 0 {
                return Err(ActuationError::DailyBudgetExhausted);
            }
            let left = u32::try_from(left).unwrap_or(max_daily);
            secs = Some(secs.map_or(left, |s| s.min(left)));
        }

        // 10. generic cooldown
        if role != Some(Role::Pump) && !continuing {
            if let (Some(cooldown), Some(last)) = (safety.cooldown(), self.registry.last_stop(name)) {
                let elapsed = secs_between(now, last);
                if elapsed < f64::from(cooldown) {
                    return Err(ActuationError::CooldownActive {
                        remaining_secs: remaining(cooldown, elapsed),
                        pump: false,
                    });
                }
            }
        }

        self.commit(name, true, reason, secs).await?;
        Ok(secs)
    }

    async fn commit(
        &self,
        name: &str,
        on: bool,
        reason: &str,
        secs: Option<u32>,
    ) -> Result<(), ActuationError> {
        self.registry.set_state(name, on, reason, secs)?;
        if let Err(e) = self
            .db
            .log_actuation(self.clock.now(), name, on, reason, secs)
            .await
        {
            warn!(actuator = %name, "actuation log write failed: {e:#}");
        }
        Ok(())
    }

    /// A fan in the same zone is running, locally or as last acked by its
    /// node. Fans themselves always pass.
    pub fn fan_running(
        &self,
        chan: &Channel,
        meta: Option<&ActuatorMeta>,
        role: Option<Role>,
        catalog: &Catalog,
    ) -> bool {
        if role == Some(Role::Fan) {
            return true;
        }
        let Some(zone) = meta
            .and_then(|m| m.zone.as_deref())
            .or(chan.zone.as_deref())
        else {
            return false;
        };

        for fan in catalog.fans_in_zone(zone) {
            if fan.is_remote() {
                if self.nodes.actuator_on(&fan.id) {
                    return true;
                }
                continue;
            }
            let local = fan
                .channel_names()
                .find(|n| self.registry.channel(n).is_some())
                .or_else(|| fan.gpio_pin.and_then(|p| self.registry.name_for_pin(p)));
            if local.is_some_and(|n| self.registry.is_on(&n)) {
                return true;
            }
        }

        self.registry.channels().iter().any(|c| {
            c.zone.as_deref() == Some(zone)
                && c.is_role(Role::Fan, catalog.find_actuator(&c.name, Some(c.gpio_pin)))
                && self.registry.is_on(&c.name)
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
