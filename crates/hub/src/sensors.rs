//! Sensor cache: polls a [`SensorBackend`], keeps the latest snapshot and a
//! 30-minute climate history for moving averages.
//!
//! Hardware faults never surface as errors here. A read that fails, panics or
//! exceeds the read timeout degrades to a reading with `status = Error`, and
//! the rest of the gateway reacts to that status.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::clock::{secs_between, Clock, Timestamp};

/// Climate history retention.
const HISTORY_SECS: f64 = 30.0 * 60.0;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Ok,
    Simulated,
    Error,
    Missing,
    Disabled,
    Unavailable,
    CrcError,
}

impl SensorStatus {
    /// Only `ok` and `simulated` readings are fit for control decisions.
    pub fn is_trustworthy(self) -> bool {
        matches!(self, Self::Ok | Self::Simulated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Simulated => "simulated",
            Self::Error => "error",
            Self::Missing => "missing",
            Self::Disabled => "disabled",
            Self::Unavailable => "unavailable",
            Self::CrcError => "crc_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Dht22,
    Ds18b20,
    Bh1750,
    Soil,
}

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [Self::Dht22, Self::Ds18b20, Self::Bh1750, Self::Soil];

    pub fn key(self) -> &'static str {
        match self {
            Self::Dht22 => "dht22",
            Self::Ds18b20 => "ds18b20",
            Self::Bh1750 => "bh1750",
            Self::Soil => "soil",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Dht22 => "DHT22",
            Self::Ds18b20 => "DS18B20",
            Self::Bh1750 => "BH1750",
            Self::Soil => "ADS1115",
        }
    }
}

/// Which sensor feeds heater control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TempSource {
    #[default]
    Dht22,
    Ds18b20,
}

impl TempSource {
    pub fn kind(self) -> SensorKind {
        match self {
            Self::Dht22 => SensorKind::Dht22,
            Self::Ds18b20 => SensorKind::Ds18b20,
        }
    }
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClimateReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub ts: Timestamp,
    pub status: SensorStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReading {
    pub temperature: Option<f64>,
    pub ts: Timestamp,
    pub status: SensorStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LightReading {
    pub lux: Option<f64>,
    pub ts: Timestamp,
    pub status: SensorStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SoilReading {
    /// Raw ADC values for ch0..ch3.
    pub channels: [Option<f64>; 4],
    pub ts: Timestamp,
    pub status: SensorStatus,
}

impl ClimateReading {
    pub fn failed(ts: Timestamp, status: SensorStatus) -> Self {
        Self {
            temperature: None,
            humidity: None,
            ts,
            status,
        }
    }
}

impl ProbeReading {
    pub fn failed(ts: Timestamp, status: SensorStatus) -> Self {
        Self {
            temperature: None,
            ts,
            status,
        }
    }
}

impl LightReading {
    pub fn failed(ts: Timestamp, status: SensorStatus) -> Self {
        Self {
            lux: None,
            ts,
            status,
        }
    }
}

impl SoilReading {
    pub fn failed(ts: Timestamp, status: SensorStatus) -> Self {
        Self {
            channels: [None; 4],
            ts,
            status,
        }
    }

    /// Value of a `chN` channel name.
    pub fn channel(&self, name: &str) -> Option<f64> {
        let idx = soil_channel_index(name)?;
        self.channels[idx]
    }
}

/// Parses `ch0`..`ch3` into an index.
pub fn soil_channel_index(name: &str) -> Option<usize> {
    let idx: usize = name.trim().strip_prefix("ch")?.parse().ok()?;
    (idx < 4).then_some(idx)
}

/// One complete poll of every local sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub ts: Timestamp,
    pub dht22: ClimateReading,
    pub ds18b20: ProbeReading,
    pub bh1750: LightReading,
    pub soil: SoilReading,
}

impl SensorSnapshot {
    /// A snapshot where every sensor reports `unavailable`.
    pub fn unavailable(ts: Timestamp) -> Self {
        let st = SensorStatus::Unavailable;
        Self {
            ts,
            dht22: ClimateReading::failed(ts, st),
            ds18b20: ProbeReading::failed(ts, st),
            bh1750: LightReading::failed(ts, st),
            soil: SoilReading::failed(ts, st),
        }
    }

    pub fn status(&self, kind: SensorKind) -> SensorStatus {
        match kind {
            SensorKind::Dht22 => self.dht22.status,
            SensorKind::Ds18b20 => self.ds18b20.status,
            SensorKind::Bh1750 => self.bh1750.status,
            SensorKind::Soil => self.soil.status,
        }
    }

    pub fn any_trustworthy(&self) -> bool {
        SensorKind::ALL
            .iter()
            .any(|k| self.status(*k).is_trustworthy())
    }

    /// Status and temperature of the selected heater sensor.
    pub fn temperature(&self, source: TempSource) -> (SensorStatus, Option<f64>) {
        match source {
            TempSource::Dht22 => (self.dht22.status, self.dht22.temperature),
            TempSource::Ds18b20 => (self.ds18b20.status, self.ds18b20.temperature),
        }
    }

    /// Temperature only if the selected sensor is trustworthy.
    pub fn trusted_temperature(&self, source: TempSource) -> Option<f64> {
        let (status, value) = self.temperature(source);
        if status.is_trustworthy() {
            value
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Blocking sensor access. Implementations may take a while (I2C, 1-Wire);
/// the cache runs them on the blocking pool under a timeout.
pub trait SensorBackend: Send + Sync + 'static {
    fn read_dht22(&self, now: Timestamp) -> ClimateReading;
    fn read_ds18b20(&self, now: Timestamp) -> ProbeReading;
    fn read_bh1750(&self, now: Timestamp) -> LightReading;
    fn read_soil(&self, now: Timestamp) -> SoilReading;
}

// ---------------------------------------------------------------------------
// Averages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowAverage {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ClimateAverages {
    #[serde(rename = "1m")]
    pub m1: WindowAverage,
    #[serde(rename = "5m")]
    pub m5: WindowAverage,
    #[serde(rename = "30m")]
    pub m30: WindowAverage,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CacheInner {
    latest: Option<SensorSnapshot>,
    history: VecDeque<(Timestamp, f64, f64)>,
}

type Busy = Arc<Mutex<HashSet<SensorKind>>>;

/// A sensor with a blocking read in progress. The claim is released when the
/// read returns or unwinds, even if the caller stopped waiting for it.
struct ReadSlot {
    busy: Busy,
    kind: SensorKind,
}

impl ReadSlot {
    fn claim(busy: &Busy, kind: SensorKind) -> Option<Self> {
        let fresh = busy.lock().unwrap_or_else(|e| e.into_inner()).insert(kind);
        fresh.then(|| Self {
            busy: Arc::clone(busy),
            kind,
        })
    }
}

impl Drop for ReadSlot {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.kind);
    }
}

pub struct SensorCache {
    backend: Arc<dyn SensorBackend>,
    clock: Arc<dyn Clock>,
    read_timeout: Duration,
    busy: Busy,
    inner: RwLock<CacheInner>,
}

impl SensorCache {
    pub fn new(backend: Arc<dyn SensorBackend>, clock: Arc<dyn Clock>, read_timeout: Duration) -> Self {
        Self {
            backend,
            clock,
            read_timeout,
            busy: Arc::default(),
            inner: RwLock::new(CacheInner::default()),
        }
    }

    /// Poll every sensor and replace the latest snapshot.
    pub async fn read_all(&self) -> SensorSnapshot {
        let now = self.clock.now();
        let (dht22, ds18b20, bh1750, soil) = tokio::join!(
            self.bounded(SensorKind::Dht22, ClimateReading::failed(now, SensorStatus::Error), move |b| b.read_dht22(now)),
            self.bounded(SensorKind::Ds18b20, ProbeReading::failed(now, SensorStatus::Error), move |b| b.read_ds18b20(now)),
            self.bounded(SensorKind::Bh1750, LightReading::failed(now, SensorStatus::Error), move |b| b.read_bh1750(now)),
            self.bounded(SensorKind::Soil, SoilReading::failed(now, SensorStatus::Error), move |b| b.read_soil(now)),
        );
        let snapshot = SensorSnapshot {
            ts: now,
            dht22,
            ds18b20,
            bh1750,
            soil,
        };
        self.install(snapshot.clone()).await;
        snapshot
    }

    /// Replace the latest snapshot and fold its climate reading into the
    /// history.
    pub async fn install(&self, snapshot: SensorSnapshot) {
        let mut inner = self.inner.write().await;
        let d = &snapshot.dht22;
        if d.status.is_trustworthy() {
            if let (Some(t), Some(h)) = (d.temperature, d.humidity) {
                inner.history.push_back((d.ts, t, h));
            }
        }
        let now = snapshot.ts;
        while let Some((ts, _, _)) = inner.history.front() {
            if secs_between(now, *ts) > HISTORY_SECS {
                inner.history.pop_front();
            } else {
                break;
            }
        }
        inner.latest = Some(snapshot);
    }

    async fn bounded<T, F>(&self, kind: SensorKind, fallback: T, read: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&dyn SensorBackend) -> T + Send + 'static,
    {
        // A read that outlived its timeout is still holding the bus.
        let Some(slot) = ReadSlot::claim(&self.busy, kind) else {
            debug!(sensor = kind.key(), "previous read still running, skipped");
            return fallback;
        };
        let backend = Arc::clone(&self.backend);
        let task = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            read(backend.as_ref())
        });
        match tokio::time::timeout(self.read_timeout, task).await {
            Ok(Ok(reading)) => reading,
            Ok(Err(e)) => {
                warn!(sensor = kind.key(), "sensor read task failed: {e}");
                fallback
            }
            Err(_) => {
                warn!(
                    sensor = kind.key(),
                    timeout_ms = self.read_timeout.as_millis() as u64,
                    "sensor read timed out"
                );
                fallback
            }
        }
    }

    /// Latest snapshot without touching hardware.
    pub async fn latest(&self) -> Option<SensorSnapshot> {
        self.inner.read().await.latest.clone()
    }

    /// Time of the last completed poll.
    pub async fn last_poll(&self) -> Option<Timestamp> {
        self.inner.read().await.latest.as_ref().map(|s| s.ts)
    }

    /// Mean temperature/humidity over each trailing window (seconds).
    pub async fn averages_for(&self, windows: &[u64]) -> Vec<WindowAverage> {
        let now = self.clock.now();
        let inner = self.inner.read().await;
        windows
            .iter()
            .map(|w| {
                let in_window: Vec<(f64, f64)> = inner
                    .history
                    .iter()
                    .filter(|(ts, _, _)| secs_between(now, *ts) <= *w as f64)
                    .map(|(_, t, h)| (*t, *h))
                    .collect();
                if in_window.is_empty() {
                    return WindowAverage::default();
                }
                let n = in_window.len() as f64;
                WindowAverage {
                    temperature: Some(round1(in_window.iter().map(|p| p.0).sum::<f64>() / n)),
                    humidity: Some(round1(in_window.iter().map(|p| p.1).sum::<f64>() / n)),
                }
            })
            .collect()
    }

    pub async fn averages(&self) -> ClimateAverages {
        let v = self.averages_for(&[60, 300, 1800]).await;
        ClimateAverages {
            m1: v[0],
            m5: v[1],
            m30: v[2],
        }
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// A snapshot with every sensor reporting `ok`.
    pub(crate) fn healthy(ts: Timestamp, temp: f64, hum: f64, lux: f64, soil: f64) -> SensorSnapshot {
        let ok = SensorStatus::Ok;
        SensorSnapshot {
            ts,
            dht22: ClimateReading {
                temperature: Some(temp),
                humidity: Some(hum),
                ts,
                status: ok,
            },
            ds18b20: ProbeReading {
                temperature: Some(temp),
                ts,
                status: ok,
            },
            bh1750: LightReading {
                lux: Some(lux),
                ts,
                status: ok,
            },
            soil: SoilReading {
                channels: [Some(soil), None, None, None],
                ts,
                status: ok,
            },
        }
    }

    /// Cache fed only through `install`.
    pub(crate) fn installed_cache(clock: Arc<dyn Clock>) -> SensorCache {
        SensorCache::new(
            Arc::new(Scripted::new(20.0, 50.0)),
            clock,
            Duration::from_millis(200),
        )
    }

    /// Fixed-value backend for components that own their cache.
    pub(crate) fn scripted(t: f64, h: f64) -> Arc<dyn SensorBackend> {
        Arc::new(Scripted::new(t, h))
    }

    /// Backend returning fixed values; the DHT22 read can be made to hang.
    struct Scripted {
        climate: Mutex<(f64, f64)>,
        dht_delay: Duration,
        dht_reads: AtomicUsize,
        panic_on_lux: bool,
    }

    impl Scripted {
        fn new(t: f64, h: f64) -> Self {
            Self {
                climate: Mutex::new((t, h)),
                dht_delay: Duration::ZERO,
                dht_reads: AtomicUsize::new(0),
                panic_on_lux: false,
            }
        }
    }

    impl SensorBackend for Scripted {
        fn read_dht22(&self, now: Timestamp) -> ClimateReading {
            self.dht_reads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.dht_delay);
            let (t, h) = *self.climate.lock().unwrap();
            ClimateReading {
                temperature: Some(t),
                humidity: Some(h),
                ts: now,
                status: SensorStatus::Ok,
            }
        }
        fn read_ds18b20(&self, now: Timestamp) -> ProbeReading {
            ProbeReading {
                temperature: Some(19.5),
                ts: now,
                status: SensorStatus::Ok,
            }
        }
        fn read_bh1750(&self, now: Timestamp) -> LightReading {
            if self.panic_on_lux {
                panic!("i2c bus exploded");
            }
            LightReading {
                lux: Some(420.0),
                ts: now,
                status: SensorStatus::Ok,
            }
        }
        fn read_soil(&self, now: Timestamp) -> SoilReading {
            SoilReading {
                channels: [Some(15000.0), None, None, None],
                ts: now,
                status: SensorStatus::Ok,
            }
        }
    }

    fn setup(backend: Scripted) -> (Arc<ManualClock>, Arc<Scripted>, SensorCache) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let backend = Arc::new(backend);
        let cache = SensorCache::new(backend.clone(), clock.clone(), Duration::from_millis(200));
        (clock, backend, cache)
    }

    // -- Polling ------------------------------------------------------------

    #[tokio::test]
    async fn read_all_replaces_latest() {
        let (clock, _, cache) = setup(Scripted::new(22.0, 55.0));
        assert!(cache.latest().await.is_none());

        let snap = cache.read_all().await;
        assert_eq!(snap.dht22.temperature, Some(22.0));
        assert_eq!(snap.soil.channel("ch0"), Some(15000.0));
        assert_eq!(cache.last_poll().await, Some(clock.now()));
        assert_eq!(cache.latest().await.unwrap(), snap);
    }

    #[tokio::test]
    async fn hung_read_degrades_to_error_status() {
        let mut backend = Scripted::new(22.0, 55.0);
        backend.dht_delay = Duration::from_millis(600);
        let (_, _, cache) = setup(backend);

        let snap = cache.read_all().await;
        assert_eq!(snap.dht22.status, SensorStatus::Error);
        assert_eq!(snap.dht22.temperature, None);
        assert_eq!(snap.bh1750.status, SensorStatus::Ok);
    }

    #[tokio::test]
    async fn hung_read_is_not_dispatched_again_while_running() {
        let mut backend = Scripted::new(22.0, 55.0);
        backend.dht_delay = Duration::from_millis(600);
        let (_, backend, cache) = setup(backend);

        cache.read_all().await;
        let snap = cache.read_all().await;
        assert_eq!(snap.dht22.status, SensorStatus::Error);
        assert_eq!(snap.bh1750.status, SensorStatus::Ok);
        assert_eq!(backend.dht_reads.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(700)).await;
        cache.read_all().await;
        assert_eq!(backend.dht_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_read_releases_its_sensor() {
        let mut backend = Scripted::new(22.0, 55.0);
        backend.panic_on_lux = true;
        let (_, _, cache) = setup(backend);

        cache.read_all().await;
        assert!(cache.busy.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn panicking_read_degrades_to_error_status() {
        let mut backend = Scripted::new(22.0, 55.0);
        backend.panic_on_lux = true;
        let (_, _, cache) = setup(backend);

        let snap = cache.read_all().await;
        assert_eq!(snap.bh1750.status, SensorStatus::Error);
        assert_eq!(snap.dht22.status, SensorStatus::Ok);
    }

    // -- Averages -----------------------------------------------------------

    #[tokio::test]
    async fn averages_over_windows() {
        let (clock, backend, cache) = setup(Scripted::new(20.0, 50.0));
        cache.read_all().await;

        clock.advance_secs(600);
        *backend.climate.lock().unwrap() = (24.0, 70.0);
        cache.read_all().await;

        clock.advance_secs(30);
        *backend.climate.lock().unwrap() = (26.0, 60.0);
        cache.read_all().await;

        let avg = cache.averages().await;
        assert_eq!(avg.m1.temperature, Some(25.0));
        assert_eq!(avg.m1.humidity, Some(65.0));
        assert_eq!(avg.m30.temperature, Some(23.3));
    }

    #[tokio::test]
    async fn averages_are_null_without_data() {
        let (clock, _, cache) = setup(Scripted::new(20.0, 50.0));
        cache.read_all().await;
        clock.advance_secs(120);
        let avg = cache.averages().await;
        assert_eq!(avg.m1, WindowAverage::default());
        assert_eq!(avg.m5.temperature, Some(20.0));
    }

    #[tokio::test]
    async fn history_trimmed_to_thirty_minutes() {
        let (clock, _, cache) = setup(Scripted::new(20.0, 50.0));
        cache.read_all().await;
        clock.advance_secs(31 * 60);
        let mut snap = SensorSnapshot::unavailable(clock.now());
        snap.dht22.status = SensorStatus::Error;
        cache.install(snap).await;
        assert_eq!(cache.averages().await.m30, WindowAverage::default());
    }

    #[tokio::test]
    async fn untrustworthy_climate_not_added_to_history() {
        let (clock, _, cache) = setup(Scripted::new(20.0, 50.0));
        let mut snap = SensorSnapshot::unavailable(clock.now());
        snap.dht22 = ClimateReading {
            temperature: Some(99.0),
            humidity: Some(99.0),
            ts: clock.now(),
            status: SensorStatus::CrcError,
        };
        cache.install(snap).await;
        assert_eq!(cache.averages().await.m1, WindowAverage::default());
    }

    // -- Helpers ------------------------------------------------------------

    #[test]
    fn soil_channel_names() {
        assert_eq!(soil_channel_index("ch0"), Some(0));
        assert_eq!(soil_channel_index("ch3"), Some(3));
        assert_eq!(soil_channel_index("ch4"), None);
        assert_eq!(soil_channel_index("a0"), None);
    }

    #[test]
    fn trusted_temperature_respects_status() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut snap = SensorSnapshot::unavailable(ts);
        snap.ds18b20 = ProbeReading {
            temperature: Some(21.0),
            ts,
            status: SensorStatus::Ok,
        };
        assert_eq!(snap.trusted_temperature(TempSource::Ds18b20), Some(21.0));
        assert_eq!(snap.trusted_temperature(TempSource::Dht22), None);
    }
}
