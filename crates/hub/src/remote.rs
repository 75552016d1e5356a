//! Remote node protocol state: node registry, per-node command queues with
//! TTL and ack semantics, and the inferred state of remote actuators and
//! sensors.
//!
//! All tables share one mutex held only for short bookkeeping; database
//! writes happen after it is released.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::catalog::{Catalog, SensorMeta};
use crate::clock::{plus_secs, secs_between, Clock, Timestamp};
use crate::config::NodeSettings;
use crate::db::{Db, TelemetryRow};
use crate::error::NodeError;
use crate::sensors::SensorStatus;
use crate::state::{Interlock, SharedControl};
use crate::wire::{
    parse_ack_ids, parse_sensor_entry, parse_ts, parse_ts_value, CommandAction, CommandSpec,
    NodeCommand, ProtocolIssue, Switch, TelemetryRequest,
};

/// `since` fallback window when no TTL is configured.
const DEFAULT_SINCE_WINDOW_SECS: f64 = 30.0;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct NodeEntry {
    pub node_id: String,
    pub zone: Option<String>,
    pub last_seen_ts: Option<Timestamp>,
    pub last_ip: Option<String>,
    pub status: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealthStatus {
    Ok,
    Missing,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub status: NodeHealthStatus,
    pub data_age_sec: Option<f64>,
    pub stale_threshold_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub entry: NodeEntry,
    pub health: NodeHealth,
    pub queue_size: usize,
}

/// Last acknowledged state of a remote actuator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteActuatorState {
    pub node_id: String,
    pub state: Switch,
    pub duty_pct: Option<f64>,
    pub last_change_ts: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub value: Option<f64>,
    pub quality: Option<String>,
    pub ts: Timestamp,
}

/// Last metrics reported for one remote sensor, keyed by lowercase metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteSensorState {
    pub node_id: String,
    pub zone: Option<String>,
    pub last_ts: Timestamp,
    pub metrics: BTreeMap<String, MetricSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteSensorStatus {
    pub status: SensorStatus,
    pub node_id: Option<String>,
    pub data_age_sec: Option<f64>,
}

#[derive(Default)]
struct Tables {
    registry: BTreeMap<String, NodeEntry>,
    queues: HashMap<String, VecDeque<NodeCommand>>,
    actuators: HashMap<String, RemoteActuatorState>,
    sensors: HashMap<String, RemoteSensorState>,
    telemetry_rate: HashMap<String, Timestamp>,
    command_rate: HashMap<String, Timestamp>,
}

/// Event-log entry produced under the lock and written after it.
type PendingEvent = (&'static str, &'static str, Value);

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryOutcome {
    Accepted,
    Partial,
    Rejected,
}

impl TelemetryOutcome {
    pub fn status_code(self) -> u16 {
        match self {
            Self::Accepted => 200,
            Self::Partial => 207,
            Self::Rejected => 400,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryReport {
    pub acks: Vec<String>,
    pub errors: Vec<ProtocolIssue>,
    pub rows: usize,
    pub outcome: TelemetryOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct Enqueued {
    pub cmd_id: String,
    pub queue_size: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastReport {
    pub queued: usize,
    pub cmd_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dropped: Vec<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn rate_limited(
    table: &mut HashMap<String, Timestamp>,
    node_id: &str,
    min_secs: f64,
    now: Timestamp,
) -> bool {
    if min_secs <= 0.0 {
        return false;
    }
    if let Some(last) = table.get(node_id) {
        if secs_between(now, *last) < min_secs {
            return true;
        }
    }
    table.insert(node_id.to_string(), now);
    false
}

/// Drop TTL-expired commands, returning one event per expiry.
fn prune(node_id: &str, queue: &mut VecDeque<NodeCommand>, now: Timestamp) -> Vec<PendingEvent> {
    let mut events = Vec::new();
    queue.retain(|cmd| {
        let expired = cmd.ttl_s > 0 && secs_between(now, cmd.created_ts) > f64::from(cmd.ttl_s);
        if expired {
            events.push((
                "warning",
                "Node command expired",
                json!({"node_id": node_id, "cmd_id": cmd.cmd_id}),
            ));
        }
        !expired
    });
    events
}

/// Telemetry quality tag to a sensor status.
pub fn quality_status(quality: Option<&str>) -> SensorStatus {
    match quality {
        None | Some("ok") | Some("simulated") => SensorStatus::Ok,
        Some("missing") => SensorStatus::Missing,
        Some("disabled") => SensorStatus::Disabled,
        Some(_) => SensorStatus::Error,
    }
}

/// Worst status wins: error, then missing, then disabled. No samples at all
/// counts as missing.
pub fn merge_statuses(statuses: &[SensorStatus]) -> SensorStatus {
    if statuses.is_empty() {
        return SensorStatus::Missing;
    }
    for worst in [SensorStatus::Error, SensorStatus::Missing, SensorStatus::Disabled] {
        if statuses.contains(&worst) {
            return worst;
        }
    }
    SensorStatus::Ok
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

pub struct NodeProtocol {
    settings: NodeSettings,
    simulation: bool,
    clock: Arc<dyn Clock>,
    db: Db,
    control: SharedControl,
    tables: Mutex<Tables>,
}

impl NodeProtocol {
    pub fn new(
        settings: NodeSettings,
        simulation: bool,
        clock: Arc<dyn Clock>,
        db: Db,
        control: SharedControl,
    ) -> Self {
        Self {
            settings,
            simulation,
            clock,
            db,
            control,
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn write_events(&self, events: Vec<PendingEvent>) {
        let now = self.clock.now();
        for (level, message, meta) in events {
            self.db
                .record_event(now, "node", level, message, Some(meta))
                .await;
        }
    }

    fn stale_secs(&self) -> Option<f64> {
        (self.settings.stale_secs > 0).then_some(self.settings.stale_secs as f64)
    }

    // -- Auth -----------------------------------------------------------------

    /// Shared-secret check. Simulation with no tokens configured is open.
    pub fn authenticate(&self, node_id: &str, token: Option<&str>) -> Result<(), NodeError> {
        if self.settings.tokens.is_empty() {
            return if self.simulation {
                Ok(())
            } else {
                Err(NodeError::AuthNotConfigured)
            };
        }
        match (self.settings.tokens.get(node_id), token) {
            (Some(expected), Some(given)) if expected == given => Ok(()),
            _ => Err(NodeError::AuthFailed),
        }
    }

    fn admit(&self, node_id: Option<&str>, token: Option<&str>) -> Result<String, NodeError> {
        let node_id = node_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(NodeError::MissingNodeId)?;
        if let Err(e) = self.authenticate(node_id, token) {
            warn!(node = %node_id, "node auth rejected: {e}");
            return Err(e);
        }
        Ok(node_id.to_string())
    }

    // -- Telemetry ------------------------------------------------------------

    /// Ingest one telemetry post. Acks are applied before any rows are
    /// written; malformed entries are reported individually.
    pub async fn post_telemetry(
        &self,
        req: TelemetryRequest,
        token: Option<&str>,
        remote_addr: Option<String>,
    ) -> Result<TelemetryReport, NodeError> {
        let node_id = self.admit(req.node_id.as_deref(), token)?;
        let now = self.clock.now();
        if rate_limited(
            &mut self.lock().telemetry_rate,
            &node_id,
            self.settings.rate_limit_secs,
            now,
        ) {
            return Err(NodeError::RateLimited);
        }

        let sensors: Vec<Value> = match req.sensors {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(_) => return Err(NodeError::InvalidPayload("sensors must be list".into())),
        };
        let ts = req.ts.as_ref().and_then(parse_ts_value).unwrap_or(now);
        let zone = req
            .zone
            .as_ref()
            .filter(|v| !v.is_null())
            .map(|v| match v {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty());

        // ── Acks ──────────────────────────────────────────────────
        let (acks, mut errors) = match parse_ack_ids(req.acks.as_ref()) {
            Ok(ids) => self.apply_acks(&node_id, &ids).await,
            Err(issue) => (Vec::new(), vec![issue]),
        };

        // ── Rows (durable sink, outside the lock) ──────────────────
        let mut rows = Vec::new();
        let mut entries = Vec::new();
        for (idx, raw) in sensors.iter().enumerate() {
            match parse_sensor_entry(idx, raw) {
                Ok(entry) => {
                    rows.push(TelemetryRow {
                        ts,
                        node_id: node_id.clone(),
                        zone: zone.clone(),
                        metric: entry.metric.clone(),
                        value: entry.value,
                        unit: entry.unit.clone(),
                        source: entry.source.clone(),
                        quality: entry.quality.clone(),
                    });
                    entries.push(entry);
                }
                Err(issue) => errors.push(issue),
            }
        }
        let written = if rows.is_empty() {
            0
        } else {
            match self.db.insert_telemetry(&rows).await {
                Ok(n) => n,
                Err(e) => {
                    errors.push(ProtocolIssue::new("db_error", format!("{e:#}")));
                    0
                }
            }
        };

        // ── Snapshot + registry ────────────────────────────────────
        {
            let mut tables = self.lock();
            for entry in &entries {
                let Some(source) = &entry.source else {
                    continue;
                };
                let snap = tables
                    .sensors
                    .entry(source.clone())
                    .or_insert_with(|| RemoteSensorState {
                        node_id: node_id.clone(),
                        zone: None,
                        last_ts: ts,
                        metrics: BTreeMap::new(),
                    });
                snap.node_id = node_id.clone();
                if zone.is_some() {
                    snap.zone = zone.clone();
                }
                snap.last_ts = ts;
                snap.metrics.insert(
                    entry.metric.to_ascii_lowercase(),
                    MetricSample {
                        value: entry.value,
                        quality: entry.quality.clone(),
                        ts,
                    },
                );
            }

            let node = tables
                .registry
                .entry(node_id.clone())
                .or_insert_with(|| NodeEntry {
                    node_id: node_id.clone(),
                    zone: None,
                    last_seen_ts: None,
                    last_ip: None,
                    status: None,
                });
            node.last_seen_ts = Some(ts);
            if zone.is_some() {
                node.zone = zone.clone();
            }
            if remote_addr.is_some() {
                node.last_ip = remote_addr;
            }
            if let Some(status @ Value::Object(_)) = req.status {
                node.status = Some(status);
            }
        }

        if !errors.is_empty() {
            warn!(node = %node_id, errors = errors.len(), rows = written, "telemetry errors");
            self.write_events(vec![(
                "warning",
                "Telemetry errors",
                json!({"node_id": node_id, "errors": errors}),
            )])
            .await;
        }

        let outcome = if errors.is_empty() {
            TelemetryOutcome::Accepted
        } else if written > 0 {
            TelemetryOutcome::Partial
        } else {
            TelemetryOutcome::Rejected
        };
        Ok(TelemetryReport {
            acks,
            errors,
            rows: written,
            outcome,
        })
    }

    /// Remove acknowledged commands and record the state each one implies.
    async fn apply_acks(&self, node_id: &str, ids: &[String]) -> (Vec<String>, Vec<ProtocolIssue>) {
        if ids.is_empty() {
            return (Vec::new(), Vec::new());
        }
        let now = self.clock.now();
        let mut accepted = Vec::new();
        let mut errors = Vec::new();
        let events = {
            let mut tables = self.lock();
            let mut queue = tables.queues.remove(node_id).unwrap_or_default();
            let events = prune(node_id, &mut queue, now);

            let mut acked = Vec::new();
            for id in ids {
                match queue.iter().position(|c| &c.cmd_id == id) {
                    Some(pos) => {
                        if let Some(cmd) = queue.remove(pos) {
                            acked.push(cmd);
                        }
                        accepted.push(id.clone());
                    }
                    None => errors.push(ProtocolIssue::new("unknown_ack", format!("unknown cmd_id {id}"))),
                }
            }
            tables.queues.insert(node_id.to_string(), queue);

            for cmd in acked {
                let on = match cmd.action {
                    CommandAction::SetPwm => match cmd.duty_pct {
                        Some(d) => d > 0.0,
                        None => continue,
                    },
                    CommandAction::SetState => cmd.state.is_on(),
                };
                tables.actuators.insert(
                    cmd.actuator_id.clone(),
                    RemoteActuatorState {
                        node_id: node_id.to_string(),
                        state: Switch::from_bool(on),
                        duty_pct: cmd.duty_pct,
                        last_change_ts: now,
                    },
                );
            }
            events
        };
        self.write_events(events).await;
        (accepted, errors)
    }

    // -- Command queue --------------------------------------------------------

    /// Queue a command. The oldest entries beyond the depth limit are
    /// dropped and reported.
    pub async fn enqueue(&self, node_id: &str, spec: CommandSpec) -> Enqueued {
        let now = self.clock.now();
        let cmd = NodeCommand {
            cmd_id: uuid::Uuid::new_v4().simple().to_string(),
            actuator_id: spec.actuator_id,
            action: spec.action,
            state: spec.state,
            duty_pct: spec.duty_pct,
            ttl_s: spec.ttl_s.unwrap_or(self.settings.command_ttl_secs),
            created_ts: now,
        };
        let (queue_size, dropped, mut events) = {
            let mut tables = self.lock();
            let queue = tables.queues.entry(node_id.to_string()).or_default();
            let events = prune(node_id, queue, now);
            queue.push_back(cmd.clone());
            let mut dropped = Vec::new();
            let max = self.settings.command_max_queue;
            while max > 0 && queue.len() > max {
                if let Some(old) = queue.pop_front() {
                    dropped.push(old.cmd_id);
                }
            }
            (queue.len(), dropped, events)
        };

        info!(node = %node_id, cmd_id = %cmd.cmd_id, actuator = %cmd.actuator_id, action = ?cmd.action, "node command queued");
        events.push((
            "info",
            "Node command queued",
            json!({
                "node_id": node_id,
                "cmd_id": cmd.cmd_id,
                "actuator_id": cmd.actuator_id,
                "action": cmd.action,
                "state": cmd.state,
                "duty_pct": cmd.duty_pct,
            }),
        ));
        if !dropped.is_empty() {
            warn!(node = %node_id, dropped = dropped.len(), "node command queue trimmed");
            events.push((
                "warning",
                "Node command queue trimmed",
                json!({"node_id": node_id, "dropped_ids": dropped}),
            ));
        }
        self.write_events(events).await;

        Enqueued {
            cmd_id: cmd.cmd_id,
            queue_size,
            dropped,
        }
    }

    /// Commands for a node created after `since` (default: one TTL window
    /// back). Under an interlock the node's queue is cleared and nothing is
    /// returned.
    pub async fn fetch_commands(
        &self,
        node_id: Option<&str>,
        token: Option<&str>,
        since: Option<&str>,
    ) -> Result<Vec<NodeCommand>, NodeError> {
        let node_id = self.admit(node_id, token)?;
        let now = self.clock.now();
        if rate_limited(
            &mut self.lock().command_rate,
            &node_id,
            self.settings.command_rate_limit_secs,
            now,
        ) {
            return Err(NodeError::RateLimited);
        }

        let interlock = self.control.read().await.interlock();
        if let Some(lock) = interlock {
            let reason = match lock {
                Interlock::EStop => "estop_active",
                Interlock::SafeMode => "safe_mode_active",
            };
            self.clear_queue(&node_id, reason).await;
            return Ok(Vec::new());
        }

        let since_ts = match since.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => parse_ts(raw)
                .ok_or_else(|| NodeError::InvalidPayload("invalid since timestamp".into()))?,
            None => {
                let window = if self.settings.command_ttl_secs > 0 {
                    f64::from(self.settings.command_ttl_secs)
                } else {
                    DEFAULT_SINCE_WINDOW_SECS
                };
                plus_secs(now, -window)
            }
        };

        let (commands, events) = {
            let mut tables = self.lock();
            let queue = tables.queues.entry(node_id.clone()).or_default();
            let events = prune(&node_id, queue, now);
            let commands: Vec<NodeCommand> = queue
                .iter()
                .filter(|c| c.created_ts > since_ts)
                .cloned()
                .collect();
            (commands, events)
        };
        self.write_events(events).await;
        Ok(commands)
    }

    pub async fn clear_queue(&self, node_id: &str, reason: &str) {
        let cleared = self
            .lock()
            .queues
            .insert(node_id.to_string(), VecDeque::new())
            .map_or(0, |q| q.len());
        warn!(node = %node_id, reason, cleared, "node command queue cleared");
        self.db
            .record_event(
                self.clock.now(),
                "node",
                "warning",
                "Node command queue cleared",
                Some(json!({"node_id": node_id, "reason": reason})),
            )
            .await;
    }

    /// Empty every queue. Returns the number of commands discarded.
    pub async fn clear_all(&self, reason: &str) -> usize {
        let cleared: usize = self
            .lock()
            .queues
            .values_mut()
            .map(|q| {
                let n = q.len();
                q.clear();
                n
            })
            .sum();
        if cleared > 0 {
            warn!(reason, cleared, "all node command queues cleared");
            self.db
                .record_event(
                    self.clock.now(),
                    "node",
                    "warning",
                    "All node command queues cleared",
                    Some(json!({"reason": reason, "cleared": cleared})),
                )
                .await;
        }
        cleared
    }

    /// Queue an "off" for every remote actuator in the catalog, clearing each
    /// affected node's queue first.
    pub async fn emergency_broadcast(&self, catalog: &Catalog) -> BTreeMap<String, BroadcastReport> {
        let mut report: BTreeMap<String, BroadcastReport> = BTreeMap::new();
        for meta in catalog.remote_actuators() {
            let Some(node_id) = meta.node_id.as_deref().map(str::trim).filter(|s| !s.is_empty())
            else {
                continue;
            };
            let actuator_id = meta.id.trim();
            if actuator_id.is_empty() {
                continue;
            }
            if !report.contains_key(node_id) {
                self.clear_queue(node_id, "emergency_stop").await;
            }
            let queued = self
                .enqueue(node_id, CommandSpec::off(actuator_id, meta.supports_pwm))
                .await;
            let entry = report.entry(node_id.to_string()).or_default();
            entry.queued += 1;
            entry.cmd_ids.push(queued.cmd_id);
            entry.dropped.extend(queued.dropped);
        }
        report
    }

    // -- Inferred remote state ------------------------------------------------

    pub fn actuator_state(&self, actuator_id: &str) -> Option<RemoteActuatorState> {
        self.lock().actuators.get(actuator_id).cloned()
    }

    /// Acked on and not older than the staleness window.
    pub fn actuator_on(&self, actuator_id: &str) -> bool {
        let Some(st) = self.actuator_state(actuator_id) else {
            return false;
        };
        if let Some(stale) = self.stale_secs() {
            if secs_between(self.clock.now(), st.last_change_ts) > stale {
                return false;
            }
        }
        st.state.is_on()
    }

    pub fn sensor_state(&self, sensor_id: &str) -> Option<RemoteSensorState> {
        self.lock().sensors.get(sensor_id).cloned()
    }

    /// Health of a remote catalog sensor from its latest quality tags.
    pub fn sensor_status(&self, meta: &SensorMeta) -> RemoteSensorStatus {
        let now = self.clock.now();
        let Some(snap) = self.sensor_state(&meta.id) else {
            return RemoteSensorStatus {
                status: SensorStatus::Missing,
                node_id: meta.node_id.clone(),
                data_age_sec: None,
            };
        };
        let age = secs_between(now, snap.last_ts).max(0.0);
        let stale = self.stale_secs().is_some_and(|s| age > s);
        let status = if stale {
            SensorStatus::Missing
        } else {
            let picked: Vec<SensorStatus> = meta
                .metric_aliases()
                .iter()
                .filter_map(|aliases| aliases.iter().find_map(|k| snap.metrics.get(*k)))
                .map(|m| quality_status(m.quality.as_deref()))
                .collect();
            merge_statuses(&picked)
        };
        RemoteSensorStatus {
            status,
            node_id: Some(snap.node_id),
            data_age_sec: Some(age),
        }
    }

    pub fn queue_len(&self, node_id: &str) -> usize {
        self.lock().queues.get(node_id).map_or(0, VecDeque::len)
    }

    /// Known nodes with freshness and queue depth.
    pub async fn registry_snapshot(&self) -> Vec<NodeView> {
        let now = self.clock.now();
        let stale = self.stale_secs();
        let (views, events) = {
            let mut tables = self.lock();
            let mut events = Vec::new();
            let mut sizes = HashMap::new();
            for (node_id, queue) in tables.queues.iter_mut() {
                events.extend(prune(node_id, queue, now));
                sizes.insert(node_id.clone(), queue.len());
            }
            let views: Vec<NodeView> = tables
                .registry
                .values()
                .map(|entry| {
                    let data_age = entry
                        .last_seen_ts
                        .map(|seen| secs_between(now, seen).max(0.0));
                    let status = match data_age {
                        None => NodeHealthStatus::Unknown,
                        Some(age) if stale.is_some_and(|s| age > s) => NodeHealthStatus::Missing,
                        Some(_) => NodeHealthStatus::Ok,
                    };
                    NodeView {
                        entry: entry.clone(),
                        health: NodeHealth {
                            status,
                            data_age_sec: data_age,
                            stale_threshold_sec: (self.settings.stale_secs > 0)
                                .then_some(self.settings.stale_secs),
                        },
                        queue_size: sizes.get(&entry.node_id).copied().unwrap_or(0),
                    }
                })
                .collect();
            (views, events)
        };
        self.write_events(events).await;
        views
    }
}

// ===========================================================================
// Tests
// ===========================================================================
