//! Building blocks shared by every control loop: manual-override inference,
//! hysteresis bands, dwell timers and the channel handle a loop acts on.

use serde::Serialize;

use crate::actuator::ActuatorState;
use crate::clock::{plus_secs, secs_between, Timestamp};

// ---------------------------------------------------------------------------
// Manual override
// ---------------------------------------------------------------------------

/// Infers "a human is in charge" from the actuator's last change. A change
/// with reason `manual` defers automation for `minutes`, unless the operator
/// cleared overrides after that change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManualOverride {
    pub until: Option<Timestamp>,
    #[serde(skip)]
    cleared_at: Option<Timestamp>,
}

impl ManualOverride {
    /// Recompute the override for the current state. Returns the expiry
    /// while it is in force.
    pub fn check(&mut self, state: &ActuatorState, minutes: u32, now: Timestamp) -> Option<Timestamp> {
        self.until = self.active_until(state, minutes, now);
        self.until
    }

    fn active_until(&self, state: &ActuatorState, minutes: u32, now: Timestamp) -> Option<Timestamp> {
        if minutes == 0 || state.reason != "manual" {
            return None;
        }
        let changed = state.last_change_ts?;
        if self.cleared_at.is_some_and(|c| changed <= c) {
            return None;
        }
        let until = plus_secs(changed, f64::from(minutes) * 60.0);
        (now < until).then_some(until)
    }

    pub fn clear(&mut self, now: Timestamp) {
        self.cleared_at = Some(now);
        self.until = None;
    }

    /// Daily reset forgets the expiry but keeps the cleared marker.
    pub fn reset(&mut self) {
        self.until = None;
    }
}

// ---------------------------------------------------------------------------
// Hysteresis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    /// On at or above `on_at`, held while above `off_at` (humidity).
    Rising,
    /// On at or below `on_at`, held while below `off_at` (temperature).
    Falling,
}

/// A two-threshold band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hysteresis {
    pub on_at: f64,
    pub off_at: f64,
    direction: Direction,
}

impl Hysteresis {
    /// `high`/`low` band for a quantity that should be pushed down. A low
    /// at or above high is pulled to one below high.
    pub fn rising(high: f64, low: f64) -> Self {
        let low = if low >= high { (high - 1.0).max(0.0) } else { low };
        Self {
            on_at: high,
            off_at: low,
            direction: Direction::Rising,
        }
    }

    /// `low`/`high` band for a quantity that should be pushed up. A high at
    /// or below low is pushed to one above low.
    pub fn falling(low: f64, high: f64) -> Self {
        let high = if low >= high { low + 1.0 } else { high };
        Self {
            on_at: low,
            off_at: high,
            direction: Direction::Falling,
        }
    }

    /// Whether the output should be on. `holding` means automation already
    /// has it on, so the release threshold applies.
    pub fn wants_on(&self, value: f64, holding: bool) -> bool {
        match (self.direction, holding) {
            (Direction::Rising, true) => value > self.off_at,
            (Direction::Rising, false) => value >= self.on_at,
            (Direction::Falling, true) => value < self.off_at,
            (Direction::Falling, false) => value <= self.on_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Dwell
// ---------------------------------------------------------------------------

/// Last automatic switch-off of one loop, for min-off dwell.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoOff {
    pub last_ts: Option<Timestamp>,
    pub last_reason: Option<String>,
}

impl AutoOff {
    pub fn record(&mut self, reason: &str, now: Timestamp) {
        self.last_ts = Some(now);
        self.last_reason = Some(reason.to_string());
    }

    /// Still inside `minutes` of the last automatic off.
    pub fn dwelling(&self, minutes: u32, now: Timestamp) -> bool {
        minutes > 0
            && self
                .last_ts
                .is_some_and(|ts| secs_between(now, ts) < f64::from(minutes) * 60.0)
    }

    pub fn clear(&mut self) {
        self.last_ts = None;
        self.last_reason = None;
    }
}

// ---------------------------------------------------------------------------
// Channel handle
// ---------------------------------------------------------------------------

/// The channel a loop drives and its state at the start of the tick.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub state: ActuatorState,
}

impl Target {
    /// On, and the last change came from the loop owning `prefix`.
    pub fn auto_on(&self, prefix: &str) -> bool {
        self.state.on && self.state.reason.starts_with(prefix)
    }

    /// Seconds since the last change; zero when it never changed.
    pub fn on_for(&self, now: Timestamp) -> f64 {
        self.state
            .last_change_ts
            .map_or(0.0, |ts| secs_between(now, ts))
    }

    /// Ran at least `limit_secs` (0 = no limit).
    pub fn ran_for(&self, limit_secs: f64, now: Timestamp) -> bool {
        limit_secs > 0.0 && self.on_for(now) >= limit_secs
    }
}

// ===========================================================================
// Tests
// ===========================================================================
