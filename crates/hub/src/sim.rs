//! Stateful greenhouse sensor simulator for development without hardware.
//!
//! Every channel is a random walk with mean reversion so consecutive polls
//! look like a real greenhouse rather than white noise:
//! - climate drifts around a daytime set point with small noise
//! - lux follows the walk but never goes negative
//! - soil channels dry out slowly and spike occasionally, per the scenario

use std::fmt;
use std::sync::Mutex;

use crate::clock::Timestamp;
use crate::sensors::{
    ClimateReading, LightReading, ProbeReading, SensorBackend, SensorStatus, SoilReading,
};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Soil behaviour profile, selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mid-range start with a slow drift toward dry.
    Drying,
    /// Hovers near the centre with little noise.
    Stable,
    /// High noise and frequent spikes.
    Flaky,
    /// Starts near the wet end and barely moves.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Random walk
// ---------------------------------------------------------------------------

struct Walk {
    value: f64,
    center: f64,
    sigma: f64,
    reversion: f64,
    drift: f64,
    min: f64,
    max: f64,
}

impl Walk {
    fn step(&mut self) -> f64 {
        let pull = self.reversion * (self.center - self.value);
        self.value = (self.value + pull + self.drift + gaussian(0.0, self.sigma))
            .clamp(self.min, self.max);
        self.value
    }
}

/// ADS1115 single-ended range used for the soil channels.
const SOIL_DRY: f64 = 26000.0;
const SOIL_WET: f64 = 12000.0;

struct SimState {
    temperature: Walk,
    humidity: Walk,
    probe: Walk,
    lux: Walk,
    soil: [Walk; 4],
    spike_prob: f32,
    spike_sigma: f64,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct SimulatedSensors {
    state: Mutex<SimState>,
    ds18b20_enabled: bool,
}

impl SimulatedSensors {
    pub fn new(scenario: Scenario, ds18b20_enabled: bool) -> Self {
        let range = SOIL_DRY - SOIL_WET;
        let (drift, sigma, reversion, spike_prob, spike_sigma, start_frac) = match scenario {
            Scenario::Drying => (15.0, 150.0, 0.02, 0.03_f32, 2000.0, 0.5),
            Scenario::Stable => (2.0, 60.0, 0.05, 0.005, 1000.0, 0.5),
            Scenario::Flaky => (10.0, 250.0, 0.02, 0.10, 3000.0, 0.5),
            Scenario::Wet => (3.0, 80.0, 0.02, 0.02, 1500.0, 0.2),
        };
        let soil = || Walk {
            value: SOIL_WET + start_frac * range + gaussian(0.0, range * 0.03),
            center: (SOIL_DRY + SOIL_WET) / 2.0,
            sigma,
            reversion,
            drift,
            min: SOIL_WET - 500.0,
            max: SOIL_DRY + 500.0,
        };

        let state = SimState {
            temperature: Walk {
                value: 24.0,
                center: 24.0,
                sigma: 0.3,
                reversion: 0.05,
                drift: 0.0,
                min: 18.0,
                max: 30.0,
            },
            humidity: Walk {
                value: 55.0,
                center: 55.0,
                sigma: 1.0,
                reversion: 0.05,
                drift: 0.0,
                min: 40.0,
                max: 70.0,
            },
            probe: Walk {
                value: 20.0,
                center: 20.0,
                sigma: 0.2,
                reversion: 0.05,
                drift: 0.0,
                min: 16.0,
                max: 25.0,
            },
            lux: Walk {
                value: 400.0,
                center: 400.0,
                sigma: 25.0,
                reversion: 0.05,
                drift: 0.0,
                min: 100.0,
                max: 700.0,
            },
            soil: [soil(), soil(), soil(), soil()],
            spike_prob,
            spike_sigma,
        };

        Self {
            state: Mutex::new(state),
            ds18b20_enabled,
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut st)
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

impl SensorBackend for SimulatedSensors {
    fn read_dht22(&self, now: Timestamp) -> ClimateReading {
        self.with_state(|st| ClimateReading {
            temperature: Some(round1(st.temperature.step())),
            humidity: Some(round1(st.humidity.step())),
            ts: now,
            status: SensorStatus::Simulated,
        })
    }

    fn read_ds18b20(&self, now: Timestamp) -> ProbeReading {
        if !self.ds18b20_enabled {
            return ProbeReading::failed(now, SensorStatus::Disabled);
        }
        self.with_state(|st| ProbeReading {
            temperature: Some(round1(st.probe.step())),
            ts: now,
            status: SensorStatus::Simulated,
        })
    }

    fn read_bh1750(&self, now: Timestamp) -> LightReading {
        self.with_state(|st| LightReading {
            lux: Some(round1(st.lux.step())),
            ts: now,
            status: SensorStatus::Simulated,
        })
    }

    fn read_soil(&self, now: Timestamp) -> SoilReading {
        self.with_state(|st| {
            let (spike_prob, spike_sigma) = (st.spike_prob, st.spike_sigma);
            let channels = st.soil.each_mut().map(|w| {
                let spike = if fastrand::f32() < spike_prob {
                    gaussian(0.0, spike_sigma)
                } else {
                    0.0
                };
                Some((w.step() + spike).round().clamp(0.0, 32767.0))
            });
            SoilReading {
                channels,
                ts: now,
                status: SensorStatus::Simulated,
            }
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
