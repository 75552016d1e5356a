//! Sensor health monitor.
//!
//! Runs on its own interval next to the sensor poller and owns the
//! fail-safes that do not wait for an operator: a faulty temperature or
//! soil sensor latches the matching sensor-fault flag and switches the
//! dependent actuators off directly, without going through the safety gate.
//! A cache that stopped updating altogether switches every pump and heater
//! off.
//!
//! Everything else is alerting: per-sensor offline tracking, numeric
//! threshold breaches and the heater cutoff, all edge-triggered.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use crate::actuator::ActuatorRegistry;
use crate::alerts::{Alerts, Severity, SENSOR_ALERT_COOLDOWN_SECS};
use crate::catalog::{Catalog, Role};
use crate::clock::{plus_secs, secs_between, Clock, Timestamp};
use crate::db::Db;
use crate::remote::NodeProtocol;
use crate::sensors::{SensorCache, SensorKind, SensorSnapshot, SensorStatus};
use crate::state::{AlertThresholds, SensorFaults, SharedControl};

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct Seen {
    first_seen: Option<Timestamp>,
    last_ok: Option<Timestamp>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorHealth {
    pub label: String,
    pub status: SensorStatus,
    pub last_seen: Option<Timestamp>,
    pub last_ok: Option<Timestamp>,
    pub first_seen: Option<Timestamp>,
    /// 0 while healthy; `None` when there is nothing to measure from.
    pub offline_seconds: Option<f64>,
    pub offline_limit_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

fn reading_ts(snap: &SensorSnapshot, kind: SensorKind) -> Timestamp {
    match kind {
        SensorKind::Dht22 => snap.dht22.ts,
        SensorKind::Ds18b20 => snap.ds18b20.ts,
        SensorKind::Bh1750 => snap.bh1750.ts,
        SensorKind::Soil => snap.soil.ts,
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct HealthMonitor {
    registry: Arc<ActuatorRegistry>,
    sensors: Arc<SensorCache>,
    control: SharedControl,
    alerts: Arc<Alerts>,
    nodes: Arc<NodeProtocol>,
    db: Db,
    clock: Arc<dyn Clock>,
    stale_secs: u64,
    seen: Mutex<HashMap<String, Seen>>,
}

impl HealthMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ActuatorRegistry>,
        sensors: Arc<SensorCache>,
        control: SharedControl,
        alerts: Arc<Alerts>,
        nodes: Arc<NodeProtocol>,
        db: Db,
        clock: Arc<dyn Clock>,
        stale_secs: u64,
    ) -> Self {
        Self {
            registry,
            sensors,
            control,
            alerts,
            nodes,
            db,
            clock,
            stale_secs,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn seen(&self) -> std::sync::MutexGuard<'_, HashMap<String, Seen>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Periodic task. Intended to be `tokio::spawn`-ed from main.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        info!(interval_secs = interval.as_secs(), "sensor health monitor started");
        loop {
            ticker.tick().await;
            self.check().await;
            self.check_stale().await;
        }
    }

    /// Evaluate the latest snapshot: fault flags, fail-safes and alerts.
    pub async fn check(&self) {
        let Some(snap) = self.sensors.latest().await else {
            return;
        };
        let now = self.clock.now();
        let (heater_source, limits, thresholds, catalog) = {
            let control = self.control.read().await;
            (
                control.heater_sensor,
                control.limits.clone(),
                control.alert_thresholds.clone(),
                control.catalog.clone(),
            )
        };
        let heater_kind = heater_source.kind();
        let heater_error = !snap.status(heater_kind).is_trustworthy();
        let soil_error = !snap.status(SensorKind::Soil).is_trustworthy();
        self.control.write().await.sensor_faults = SensorFaults {
            heater: heater_error,
            pump: soil_error,
        };

        self.check_offline(&snap, &thresholds, now).await;

        if !heater_error && limits.heater_cutoff_temp > 0.0 {
            if let Some(temp) = snap.trusted_temperature(heater_source) {
                let cutoff = limits.heater_cutoff_temp;
                let over = temp >= cutoff;
                if over {
                    self.force_off(Role::Heater, "heater_cutoff", &catalog).await;
                }
                let message = format!(
                    "Heater cutoff: {} {temp:.1}C >= {cutoff:.1}C, heater switched off.",
                    heater_kind.label()
                );
                self.alerts
                    .threshold("heater_cutoff", over, &message, "Heater cutoff cleared.")
                    .await;
            }
        }

        for kind in SensorKind::ALL {
            let status = snap.status(kind);
            let dependent = if kind == heater_kind {
                Some((Role::Heater, "heater off"))
            } else if kind == SensorKind::Soil {
                Some((Role::Pump, "pump off"))
            } else {
                None
            };
            if status.is_trustworthy() {
                self.alerts.sensor_recovery(kind.key(), kind.label()).await;
                continue;
            }
            if let Some((role, _)) = dependent {
                self.force_off(role, "sensor_error", &catalog).await;
            }
            self.alerts
                .sensor_fault(kind.key(), kind.label(), status, dependent.map(|d| d.1))
                .await;
        }

        self.check_thresholds(&snap, &thresholds).await;
    }

    async fn check_offline(&self, snap: &SensorSnapshot, thresholds: &AlertThresholds, now: Timestamp) {
        let minutes = thresholds.sensor_offline_minutes;
        let limit = f64::from(minutes) * 60.0;
        let mut edges = Vec::new();
        {
            let mut seen = self.seen();
            for kind in SensorKind::ALL {
                let entry = seen.entry(kind.key().to_string()).or_default();
                if entry.first_seen.is_none() {
                    entry.first_seen = Some(now);
                }
                let status = snap.status(kind);
                if status.is_trustworthy() {
                    entry.last_ok = Some(now);
                }
                if minutes == 0 {
                    continue;
                }
                let reference = entry.last_ok.or(entry.first_seen).unwrap_or(now);
                let offline = !status.is_trustworthy() && secs_between(now, reference) >= limit;
                edges.push((kind, offline));
            }
        }
        for (kind, offline) in edges {
            let on = format!("{} unreadable for {minutes} min.", kind.label());
            let off = format!("{} OK again.", kind.label());
            self.alerts
                .threshold(&format!("{}_offline", kind.key()), offline, &on, &off)
                .await;
        }
    }

    async fn check_thresholds(&self, snap: &SensorSnapshot, t: &AlertThresholds) {
        let dht = &snap.dht22;
        if !dht.status.is_trustworthy() {
            return;
        }
        if let Some(temp) = dht.temperature {
            if t.temp_high_c > 0.0 {
                let msg = format!("Temperature high: {temp:.1}C >= {:.1}C.", t.temp_high_c);
                self.alerts
                    .threshold("temp_high", temp >= t.temp_high_c, &msg, "Temperature back to normal.")
                    .await;
            }
            if t.temp_low_c > 0.0 {
                let msg = format!("Temperature low: {temp:.1}C <= {:.1}C.", t.temp_low_c);
                self.alerts
                    .threshold("temp_low", temp <= t.temp_low_c, &msg, "Temperature back to normal.")
                    .await;
            }
        }
        if let Some(hum) = dht.humidity {
            if t.hum_high_pct > 0.0 {
                let msg = format!("Humidity high: {hum:.1}% >= {:.1}%.", t.hum_high_pct);
                self.alerts
                    .threshold("hum_high", hum >= t.hum_high_pct, &msg, "Humidity back to normal.")
                    .await;
            }
            if t.hum_low_pct > 0.0 {
                let msg = format!("Humidity low: {hum:.1}% <= {:.1}%.", t.hum_low_pct);
                self.alerts
                    .threshold("hum_low", hum <= t.hum_low_pct, &msg, "Humidity back to normal.")
                    .await;
            }
        }
    }

    /// Force every pump and heater off when the cache has not been refreshed
    /// within the stale threshold.
    pub async fn check_stale(&self) {
        let Some(last) = self.sensors.last_poll().await else {
            return;
        };
        let now = self.clock.now();
        if secs_between(now, last) <= self.stale_secs as f64 {
            return;
        }
        let catalog = self.control.read().await.catalog.clone();
        let mut switched = self.force_off(Role::Pump, "stale_sensors", &catalog).await;
        switched.extend(self.force_off(Role::Heater, "stale_sensors", &catalog).await);
        warn!(
            age_secs = secs_between(now, last),
            switched = switched.len(),
            "sensor data stale"
        );
        self.alerts
            .add_throttled(
                "sensor_stale",
                SENSOR_ALERT_COOLDOWN_SECS,
                Severity::Warning,
                "Sensor data stale; risky actuators turned off",
            )
            .await;
    }

    /// Direct registry shutdown of every running channel with `role`.
    async fn force_off(&self, role: Role, reason: &str, catalog: &Catalog) -> Vec<String> {
        let switched = self.registry.force_off_where(reason, |chan| {
            chan.is_role(role, catalog.find_actuator(&chan.name, Some(chan.gpio_pin)))
        });
        let now = self.clock.now();
        for name in &switched {
            warn!(actuator = %name, reason, "fail-safe shutdown");
            if let Err(e) = self.db.log_actuation(now, name, false, reason, None).await {
                warn!(actuator = %name, "actuation log write failed: {e:#}");
            }
        }
        switched
    }

    /// Per-sensor health for local sensors and remote catalog sensors.
    pub async fn snapshot(&self) -> BTreeMap<String, SensorHealth> {
        let now = self.clock.now();
        let limit = {
            let control = self.control.read().await;
            u64::from(control.alert_thresholds.sensor_offline_minutes) * 60
        };
        let latest = self.sensors.latest().await;
        let catalog = self.control.read().await.catalog.clone();
        let mut seen = self.seen();
        let mut out = BTreeMap::new();

        let offline = |status: SensorStatus, s: &Seen| {
            if status.is_trustworthy() {
                Some(0.0)
            } else {
                s.last_ok
                    .or(s.first_seen)
                    .map(|r| secs_between(now, r).max(0.0))
            }
        };

        for kind in SensorKind::ALL {
            let (status, last_seen) = match &latest {
                Some(snap) => (snap.status(kind), Some(reading_ts(snap, kind))),
                None => (SensorStatus::Missing, None),
            };
            let s = seen.get(kind.key()).copied().unwrap_or_default();
            let last_ok = if status.is_trustworthy() {
                last_seen.or(s.last_ok)
            } else {
                s.last_ok
            };
            out.insert(
                kind.key().to_string(),
                SensorHealth {
                    label: kind.label().to_string(),
                    status,
                    last_seen,
                    last_ok,
                    first_seen: s.first_seen.or(last_seen),
                    offline_seconds: offline(status, &s),
                    offline_limit_seconds: limit,
                    zone: None,
                    node_id: None,
                },
            );
        }

        for meta in catalog.remote_sensors() {
            if out.contains_key(&meta.id) {
                continue;
            }
            let remote = self.nodes.sensor_status(meta);
            let last_seen = remote.data_age_sec.map(|age| plus_secs(now, -age));
            let entry = seen.entry(meta.id.clone()).or_default();
            entry.first_seen = entry.first_seen.or(last_seen).or(Some(now));
            if remote.status.is_trustworthy() {
                entry.last_ok = last_seen.or(entry.last_ok).or(Some(now));
            }
            let s = *entry;
            out.insert(
                meta.id.clone(),
                SensorHealth {
                    label: meta.label.clone().unwrap_or_else(|| meta.id.clone()),
                    status: remote.status,
                    last_seen,
                    last_ok: s.last_ok,
                    first_seen: s.first_seen,
                    offline_seconds: offline(remote.status, &s),
                    offline_limit_seconds: limit,
                    zone: meta.zone.clone(),
                    node_id: meta.node_id.clone().or(remote.node_id),
                },
            );
        }
        out
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::tests::channel;
    use crate::alerts::tests::Recording;
    use crate::catalog::SensorMeta;
    use crate::safety::tests::Rig;
    use crate::sensors::tests::healthy;
    use crate::sensors::TempSource;

    struct HealthRig {
        rig: Rig,
        monitor: HealthMonitor,
        notes: Arc<Recording>,
    }

    impl HealthRig {
        async fn new() -> Self {
            let rig = Rig::new(vec![
                channel("R1_HEATER_FAN", 18, None),
                channel("R2_FAN_MAIN", 23, None),
                channel("R3_PUMP", 24, None),
            ])
            .await;
            let notes = Arc::new(Recording::default());
            let alerts = Arc::new(Alerts::new(rig.clock.clone(), Some(rig.db.clone()), notes.clone()));
            let monitor = HealthMonitor::new(
                rig.registry.clone(),
                rig.sensors.clone(),
                rig.control.clone(),
                alerts,
                rig.nodes.clone(),
                rig.db.clone(),
                rig.clock.clone(),
                15,
            );
            Self { rig, monitor, notes }
        }

        fn notes(&self) -> Vec<String> {
            self.notes
                .sent
                .lock()
                .unwrap()
                .iter()
                .map(|(_, m)| m.clone())
                .collect()
        }

        fn all_on(&self) {
            for name in ["R1_HEATER_FAN", "R2_FAN_MAIN", "R3_PUMP"] {
                self.rig.registry.set_state(name, true, "manual", None).unwrap();
            }
        }

        async fn install(&self, f: impl FnOnce(&mut SensorSnapshot)) {
            let mut snap = healthy(self.rig.clock.now(), 22.0, 50.0, 400.0, 15000.0);
            f(&mut snap);
            self.rig.sensors.install(snap).await;
        }
    }

    // -- faults ---------------------------------------------------------------

    #[tokio::test]
    async fn soil_fault_latches_and_stops_pump() {
        let hr = HealthRig::new().await;
        hr.all_on();
        hr.install(|s| s.soil.status = SensorStatus::Error).await;
        hr.monitor.check().await;

        assert!(hr.rig.control.read().await.sensor_faults.pump);
        assert!(!hr.rig.control.read().await.sensor_faults.heater);
        assert_eq!(hr.rig.registry.state("R3_PUMP").unwrap().reason, "sensor_error");
        assert!(hr.rig.registry.is_on("R1_HEATER_FAN"));
        assert!(hr.rig.registry.is_on("R2_FAN_MAIN"));
        assert!(hr.notes().contains(&"ADS1115 read error: error (pump off)".to_string()));

        let log = hr.rig.db.actuations_since(hr.rig.clock.now()).await.unwrap();
        assert!(log.iter().any(|r| r.name == "R3_PUMP" && !r.on && r.reason == "sensor_error"));

        hr.install(|_| {}).await;
        hr.monitor.check().await;
        assert!(!hr.rig.control.read().await.sensor_faults.pump);
    }

    #[tokio::test]
    async fn heater_fault_follows_selected_sensor() {
        let hr = HealthRig::new().await;
        hr.rig.control.write().await.heater_sensor = TempSource::Ds18b20;
        hr.all_on();
        hr.install(|s| s.dht22.status = SensorStatus::CrcError).await;
        hr.monitor.check().await;
        assert!(hr.rig.registry.is_on("R1_HEATER_FAN"));
        assert!(!hr.rig.control.read().await.sensor_faults.heater);

        hr.install(|s| s.ds18b20.status = SensorStatus::Missing).await;
        hr.monitor.check().await;
        assert!(!hr.rig.registry.is_on("R1_HEATER_FAN"));
        assert!(hr.rig.control.read().await.sensor_faults.heater);
    }

    #[tokio::test]
    async fn disabled_sensor_never_alerts() {
        let hr = HealthRig::new().await;
        hr.install(|s| s.bh1750.status = SensorStatus::Disabled).await;
        hr.monitor.check().await;
        assert!(!hr.notes().iter().any(|m| m.starts_with("BH1750")));
    }

    // -- cutoff / thresholds --------------------------------------------------

    #[tokio::test]
    async fn heater_cutoff_switches_heater_off_once() {
        let hr = HealthRig::new().await;
        hr.all_on();
        let mut snap = healthy(hr.rig.clock.now(), 30.0, 50.0, 400.0, 15000.0);
        snap.dht22.temperature = Some(30.0);
        hr.rig.sensors.install(snap).await;
        hr.monitor.check().await;
        hr.monitor.check().await;

        assert_eq!(hr.rig.registry.state("R1_HEATER_FAN").unwrap().reason, "heater_cutoff");
        let cutoffs = hr
            .notes()
            .iter()
            .filter(|m| m.starts_with("Heater cutoff: DHT22 30.0C"))
            .count();
        assert_eq!(cutoffs, 1);
    }

    #[tokio::test]
    async fn climate_thresholds_are_edge_triggered() {
        let hr = HealthRig::new().await;
        hr.install(|s| s.dht22.humidity = Some(90.0)).await;
        hr.monitor.check().await;
        hr.monitor.check().await;
        hr.install(|_| {}).await;
        hr.monitor.check().await;

        let notes = hr.notes();
        assert_eq!(notes.iter().filter(|m| m.starts_with("Humidity high")).count(), 1);
        assert!(notes.contains(&"Humidity back to normal.".to_string()));
    }

    // -- offline --------------------------------------------------------------

    #[tokio::test]
    async fn offline_alert_after_configured_minutes() {
        let hr = HealthRig::new().await;
        hr.install(|s| s.ds18b20.status = SensorStatus::Missing).await;
        hr.monitor.check().await;
        assert!(!hr.notes().contains(&"DS18B20 unreadable for 5 min.".to_string()));

        hr.rig.clock.advance_secs(5 * 60);
        hr.install(|s| s.ds18b20.status = SensorStatus::Missing).await;
        hr.monitor.check().await;
        assert!(hr.notes().contains(&"DS18B20 unreadable for 5 min.".to_string()));

        hr.install(|_| {}).await;
        hr.monitor.check().await;
        assert!(hr.notes().contains(&"DS18B20 OK again.".to_string()));

        let health = hr.monitor.snapshot().await;
        assert_eq!(health["ds18b20"].offline_seconds, Some(0.0));
        assert_eq!(health["ds18b20"].offline_limit_seconds, 300);
    }

    // -- stale ----------------------------------------------------------------

    #[tokio::test]
    async fn stale_cache_forces_pump_and_heater_off() {
        let hr = HealthRig::new().await;
        hr.install(|_| {}).await;
        hr.all_on();
        hr.monitor.check_stale().await;
        assert!(hr.rig.registry.is_on("R3_PUMP"));

        hr.rig.clock.advance_secs(16);
        hr.monitor.check_stale().await;
        assert_eq!(hr.rig.registry.state("R3_PUMP").unwrap().reason, "stale_sensors");
        assert_eq!(hr.rig.registry.state("R1_HEATER_FAN").unwrap().reason, "stale_sensors");
        assert!(hr.rig.registry.is_on("R2_FAN_MAIN"));
        assert!(hr
            .notes()
            .contains(&"Sensor data stale; risky actuators turned off".to_string()));
    }

    // -- snapshot -------------------------------------------------------------

    #[tokio::test]
    async fn snapshot_includes_remote_catalog_sensors() {
        let hr = HealthRig::new().await;
        hr.rig.control.write().await.catalog.sensors.push(SensorMeta {
            id: "tent_climate".into(),
            kind: Some("sht31".into()),
            label: Some("Tent climate".into()),
            zone: Some("tent".into()),
            backend: crate::catalog::Backend::Remote,
            node_id: Some("node-a".into()),
        });
        let health = hr.monitor.snapshot().await;
        let remote = &health["tent_climate"];
        assert_eq!(remote.status, SensorStatus::Missing);
        assert_eq!(remote.node_id.as_deref(), Some("node-a"));
        assert_eq!(remote.label, "Tent climate");
        assert_eq!(health["dht22"].status, SensorStatus::Missing);
    }
}
