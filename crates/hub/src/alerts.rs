//! Operator alerts: a bounded in-memory feed, the durable event log, and a
//! fire-and-forget notifier. Also tracks alert edges so sustained conditions
//! alert once on entry and once on recovery.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::clock::{secs_between, Clock, Timestamp};
use crate::db::Db;
use crate::sensors::SensorStatus;

/// Maximum number of alerts retained in the ring buffer.
const MAX_ALERTS: usize = 50;

/// Repeats of the same sensor fault within this window are suppressed.
pub const SENSOR_ALERT_COOLDOWN_SECS: f64 = 120.0;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub ts: Timestamp,
    pub severity: Severity,
    pub message: String,
}

/// Out-of-band delivery (chat bot, SMS, ...). Must return quickly and never
/// fail the caller.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, severity: Severity, message: &str);
}

/// Default notifier: the structured log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(alert = %message, "alert"),
            Severity::Warning => warn!(alert = %message, "alert"),
            Severity::Error => error!(alert = %message, "alert"),
        }
    }
}

#[derive(Debug, Clone)]
struct EdgeState {
    status: String,
    ts: Timestamp,
}

#[derive(Default)]
struct AlertsInner {
    recent: VecDeque<Alert>,
    edges: HashMap<String, EdgeState>,
    throttles: HashMap<String, Timestamp>,
}

// ---------------------------------------------------------------------------
// Alert hub
// ---------------------------------------------------------------------------

pub struct Alerts {
    clock: Arc<dyn Clock>,
    db: Option<Db>,
    notifier: Arc<dyn Notifier>,
    inner: Mutex<AlertsInner>,
}

impl Alerts {
    pub fn new(clock: Arc<dyn Clock>, db: Option<Db>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            clock,
            db,
            notifier,
            inner: Mutex::new(AlertsInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AlertsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an alert everywhere it goes. Never fails.
    pub async fn add(&self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        let ts = self.clock.now();
        {
            let mut inner = self.lock();
            if inner.recent.len() >= MAX_ALERTS {
                inner.recent.pop_front();
            }
            inner.recent.push_back(Alert {
                ts,
                severity,
                message: message.clone(),
            });
        }
        self.notifier.notify(severity, &message);
        if let Some(db) = &self.db {
            db.record_event(ts, "alert", severity.as_str(), &message, None)
                .await;
        }
    }

    /// Like `add`, but at most once per `cooldown_secs` for `key`. Returns
    /// whether the alert went out.
    pub async fn add_throttled(
        &self,
        key: &str,
        cooldown_secs: f64,
        severity: Severity,
        message: impl Into<String>,
    ) -> bool {
        let now = self.clock.now();
        {
            let mut inner = self.lock();
            if let Some(last) = inner.throttles.get(key) {
                if secs_between(now, *last) < cooldown_secs {
                    return false;
                }
            }
            inner.throttles.insert(key.to_string(), now);
        }
        self.add(severity, message).await;
        true
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<Alert> {
        self.lock().recent.iter().rev().cloned().collect()
    }

    // -- Edge tracking --------------------------------------------------------

    /// Alert when `active` turns true and again when it clears. Sustained
    /// conditions stay silent.
    pub async fn threshold(&self, key: &str, active: bool, message_on: &str, message_off: &str) {
        let now = self.clock.now();
        let previous = {
            let mut inner = self.lock();
            let previous = inner.edges.get(key).map(|e| e.status == "active");
            inner.edges.insert(
                key.to_string(),
                EdgeState {
                    status: if active { "active" } else { "ok" }.to_string(),
                    ts: now,
                },
            );
            previous.unwrap_or(false)
        };
        if active && !previous {
            self.add(Severity::Warning, message_on).await;
        } else if !active && previous {
            self.add(Severity::Info, message_off).await;
        }
    }

    pub fn edge_active(&self, key: &str) -> bool {
        self.lock()
            .edges
            .get(key)
            .is_some_and(|e| e.status == "active")
    }

    /// Sensor read failure. `disabled` never alerts; a repeat of the same
    /// status is throttled.
    pub async fn sensor_fault(
        &self,
        key: &str,
        label: &str,
        status: SensorStatus,
        action: Option<&str>,
    ) {
        if status == SensorStatus::Disabled {
            return;
        }
        let now = self.clock.now();
        {
            let mut inner = self.lock();
            if let Some(prev) = inner.edges.get(key) {
                if prev.status == status.as_str()
                    && secs_between(now, prev.ts) < SENSOR_ALERT_COOLDOWN_SECS
                {
                    return;
                }
            }
            inner.edges.insert(
                key.to_string(),
                EdgeState {
                    status: status.as_str().to_string(),
                    ts: now,
                },
            );
        }
        let suffix = action.map(|a| format!(" ({a})")).unwrap_or_default();
        self.add(
            Severity::Warning,
            format!("{label} read error: {}{suffix}", status.as_str()),
        )
        .await;
    }

    /// Sensor back to a trustworthy reading after a reported fault.
    pub async fn sensor_recovery(&self, key: &str, label: &str) {
        let now = self.clock.now();
        {
            let mut inner = self.lock();
            match inner.edges.get(key) {
                None => return,
                Some(prev) if prev.status == "ok" || prev.status == "simulated" => return,
                Some(_) => {}
            }
            inner.edges.insert(
                key.to_string(),
                EdgeState {
                    status: "ok".to_string(),
                    ts: now,
                },
            );
        }
        self.add(Severity::Info, format!("{label} back to normal.")).await;
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

    /// Notifier that keeps everything it was handed.
    #[derive(Default)]
    pub(crate) struct Recording {
        pub(crate) sent: Mutex<Vec<(Severity, String)>>,
    }

    impl Notifier for Recording {
        fn notify(&self, severity: Severity, message: &str) {
            self.sent
                .lock()
                .unwrap()
                .push((severity, message.to_string()));
        }
    }

    fn setup(db: Option<Db>) -> (Alerts, Arc<Recording>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let rec = Arc::new(Recording::default());
        let alerts = Alerts::new(clock.clone(), db, rec.clone());
        (alerts, rec, clock)
    }

    fn sent(rec: &Recording) -> Vec<String> {
        rec.sent.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }

    // -- feed -----------------------------------------------------------------

    #[tokio::test]
    async fn add_reaches_feed_notifier_and_event_log() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let (alerts, rec, clock) = setup(Some(db.clone()));

        alerts.add(Severity::Warning, "pump stuck").await;

        assert_eq!(alerts.recent()[0].message, "pump stuck");
        assert_eq!(sent(&rec), vec!["pump stuck"]);
        let events = db.events_since(clock.now(), Some("alert")).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, "warning");
    }

    #[tokio::test]
    async fn feed_is_bounded_newest_first() {
        let (alerts, _, _) = setup(None);
        for i in 0..(MAX_ALERTS + 5) {
            alerts.add(Severity::Info, format!("a{i}")).await;
        }
        let recent = alerts.recent();
        assert_eq!(recent.len(), MAX_ALERTS);
        assert_eq!(recent[0].message, format!("a{}", MAX_ALERTS + 4));
    }

    #[tokio::test]
    async fn throttled_alert_respects_cooldown() {
        let (alerts, rec, clock) = setup(None);
        assert!(alerts.add_throttled("lux", 120.0, Severity::Warning, "x").await);
        clock.advance_secs(60);
        assert!(!alerts.add_throttled("lux", 120.0, Severity::Warning, "x").await);
        clock.advance_secs(61);
        assert!(alerts.add_throttled("lux", 120.0, Severity::Warning, "x").await);
        assert_eq!(sent(&rec).len(), 2);
    }

    // -- edges ----------------------------------------------------------------

    #[tokio::test]
    async fn threshold_alerts_on_edges_only() {
        let (alerts, rec, _) = setup(None);
        alerts.threshold("temp_high", false, "hot", "normal").await;
        alerts.threshold("temp_high", true, "hot", "normal").await;
        alerts.threshold("temp_high", true, "hot", "normal").await;
        assert!(alerts.edge_active("temp_high"));
        alerts.threshold("temp_high", false, "hot", "normal").await;
        alerts.threshold("temp_high", false, "hot", "normal").await;
        assert_eq!(sent(&rec), vec!["hot", "normal"]);
    }

    #[tokio::test]
    async fn sensor_fault_throttles_same_status() {
        let (alerts, rec, clock) = setup(None);
        alerts
            .sensor_fault("soil", "ADS1115", SensorStatus::Error, Some("pump off"))
            .await;
        clock.advance_secs(30);
        alerts
            .sensor_fault("soil", "ADS1115", SensorStatus::Error, Some("pump off"))
            .await;
        alerts
            .sensor_fault("soil", "ADS1115", SensorStatus::Missing, None)
            .await;
        clock.advance_secs(121);
        alerts
            .sensor_fault("soil", "ADS1115", SensorStatus::Missing, None)
            .await;
        assert_eq!(
            sent(&rec),
            vec![
                "ADS1115 read error: error (pump off)",
                "ADS1115 read error: missing",
                "ADS1115 read error: missing",
            ]
        );
    }

    #[tokio::test]
    async fn disabled_sensor_never_alerts() {
        let (alerts, rec, _) = setup(None);
        alerts
            .sensor_fault("ds18b20", "DS18B20", SensorStatus::Disabled, None)
            .await;
        assert!(sent(&rec).is_empty());
    }

    #[tokio::test]
    async fn recovery_only_after_fault() {
        let (alerts, rec, _) = setup(None);
        alerts.sensor_recovery("dht22", "DHT22").await;
        alerts
            .sensor_fault("dht22", "DHT22", SensorStatus::Error, Some("heater off"))
            .await;
        alerts.sensor_recovery("dht22", "DHT22").await;
        alerts.sensor_recovery("dht22", "DHT22").await;
        assert_eq!(
            sent(&rec),
            vec!["DHT22 read error: error (heater off)", "DHT22 back to normal."]
        );
    }
}
