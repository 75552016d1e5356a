//! Wiring for the whole gateway: builds every component from one
//! configuration snapshot, owns the background tasks and exposes the
//! operator operations a transport layer would call.
//!
//! ```text
//!   sensor task ──> SensorCache ──┬──> HealthMonitor ──(force off)──┐
//!                                 │                                 v
//!                                 └──> Engine ──> SafetyGate ──> ActuatorRegistry ──> relays
//!                                                     ^
//!   operator ──> Gateway::command_actuator ───────────┤
//!                         │                           │
//!                         └──(remote actuator)──> NodeProtocol queue ──> node fetch
//! ```

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::actuator::{ActuatorRegistry, ActuatorState, ActuatorView, Channel, OutputBackend};
use crate::alerts::{Alert, Alerts, Notifier, Severity};
use crate::automation::{AutomationStatus, Engine};
use crate::catalog::{ActuatorMeta, Catalog};
use crate::clock::{secs_between, Clock, Timestamp};
use crate::config::{AutomationConfig, Config, RuntimeSettings};
use crate::db::Db;
use crate::error::{ActuationError, CommandError, NodeError};
use crate::health::{HealthMonitor, SensorHealth};
use crate::remote::{BroadcastReport, Enqueued, NodeProtocol, NodeView};
use crate::safety::SafetyGate;
use crate::sensors::{ClimateAverages, SensorBackend, SensorCache, SensorSnapshot};
use crate::state::{ControlSnapshot, ControlState, SharedControl};
use crate::wire::{parse_command, CommandAction, CommandRequest, CommandSpec, Switch};

/// A failing sensor pass raises at most one alert per this many seconds.
const SENSOR_LOOP_ALERT_SECS: f64 = 300.0;

// ---------------------------------------------------------------------------
// Operator command types
// ---------------------------------------------------------------------------

/// A manual actuator request as a transport would decode it.
#[derive(Debug, Clone, Default)]
pub struct ActuatorCommand {
    pub state: Option<bool>,
    pub seconds: Option<i64>,
    pub duty_pct: Option<f64>,
}

impl ActuatorCommand {
    pub fn on(seconds: Option<i64>) -> Self {
        Self {
            state: Some(true),
            seconds,
            duty_pct: None,
        }
    }

    pub fn off() -> Self {
        Self {
            state: Some(false),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Switched locally through the safety gate.
    Local {
        name: String,
        seconds: Option<u32>,
        state: Option<ActuatorState>,
    },
    /// Queued for the owning node.
    Queued {
        node_id: String,
        actuator_id: String,
        #[serde(flatten)]
        enqueued: Enqueued,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub ts: Timestamp,
    pub control: ControlSnapshot,
    pub actuators: Vec<ActuatorView>,
    pub sensors: Option<SensorSnapshot>,
    pub averages: ClimateAverages,
    pub health: BTreeMap<String, SensorHealth>,
    pub automation: AutomationStatus,
    pub nodes: Vec<NodeView>,
    pub alerts: Vec<Alert>,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct Gateway {
    pub clock: Arc<dyn Clock>,
    pub db: Db,
    pub registry: Arc<ActuatorRegistry>,
    pub sensors: Arc<SensorCache>,
    pub control: SharedControl,
    pub alerts: Arc<Alerts>,
    pub nodes: Arc<NodeProtocol>,
    pub gate: Arc<SafetyGate>,
    pub engine: Arc<Engine>,
    pub health: Arc<HealthMonitor>,
    runtime: RuntimeSettings,
}

impl Gateway {
    /// Build every component. Channels are claimed in the off position and
    /// the control state starts from the configured interlock.
    pub fn build(
        config: Config,
        db: Db,
        clock: Arc<dyn Clock>,
        outputs: Box<dyn OutputBackend>,
        sensor_backend: Arc<dyn SensorBackend>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let runtime = config.runtime.clone();

        let mut control = ControlState::new(runtime.start_in_safe_mode);
        control.limits = config.limits.clone();
        control.alert_thresholds = config.alerts.clone();
        control.heater_sensor = config.automation.heater.sensor;
        control.catalog = config.catalog.clone();
        let control = control.shared();

        let registry = Arc::new(ActuatorRegistry::new(outputs, clock.clone()));
        registry.configure(config.channels());

        let sensors = Arc::new(SensorCache::new(
            sensor_backend,
            clock.clone(),
            Duration::from_millis(runtime.sensor_read_timeout_ms),
        ));
        let alerts = Arc::new(Alerts::new(clock.clone(), Some(db.clone()), notifier));
        let nodes = Arc::new(NodeProtocol::new(
            config.nodes.clone(),
            runtime.simulation,
            clock.clone(),
            db.clone(),
            control.clone(),
        ));
        let gate = Arc::new(SafetyGate::new(
            registry.clone(),
            control.clone(),
            sensors.clone(),
            nodes.clone(),
            db.clone(),
            clock.clone(),
        ));
        let engine = Arc::new(Engine::new(
            config.automation.clone(),
            gate.clone(),
            registry.clone(),
            sensors.clone(),
            control.clone(),
            alerts.clone(),
            db.clone(),
            clock.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            sensors.clone(),
            control.clone(),
            alerts.clone(),
            nodes.clone(),
            db.clone(),
            clock.clone(),
            runtime.sensor_stale_secs,
        ));

        info!(
            channels = registry.channels().len(),
            safe_mode = runtime.start_in_safe_mode,
            simulation = runtime.simulation,
            "gateway ready"
        );

        Self {
            clock,
            db,
            registry,
            sensors,
            control,
            alerts,
            nodes,
            gate,
            engine,
            health,
            runtime,
        }
    }

    // -- Background tasks -----------------------------------------------------

    /// Spawn the sensor poller, health monitor, automation engine and the
    /// auto-off timer task.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let secs = |s: u64| Duration::from_secs(s.max(1));
        vec![
            tokio::spawn(self.clone().run_sensors(secs(self.runtime.sensor_interval_secs))),
            tokio::spawn(
                self.health
                    .clone()
                    .run(secs(self.runtime.health_interval_secs)),
            ),
            tokio::spawn(
                self.engine
                    .clone()
                    .run(secs(self.runtime.automation_interval_secs)),
            ),
            tokio::spawn(self.registry.clone().run_timers()),
        ]
    }

    async fn run_sensors(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        let mut last_log = None;
        info!(interval_secs = interval.as_secs(), "sensor poller started");
        loop {
            ticker.tick().await;
            self.poll_sensors(&mut last_log).await;
        }
    }

    /// One sensor pass: read everything, then persist the snapshot if the
    /// logging interval has elapsed since the last stored row.
    pub async fn poll_sensors(&self, last_log: &mut Option<Timestamp>) -> SensorSnapshot {
        let snap = self.sensors.read_all().await;
        let interval = self.runtime.sensor_log_interval_secs as f64;
        let due = last_log.map_or(true, |ts| secs_between(snap.ts, ts) >= interval);
        if due {
            match self.db.insert_sensor_log(&snap).await {
                Ok(true) => *last_log = Some(snap.ts),
                Ok(false) => {}
                Err(e) => {
                    warn!("sensor log write failed: {e:#}");
                    self.alerts
                        .add_throttled(
                            "sensor_loop",
                            SENSOR_LOOP_ALERT_SECS,
                            Severity::Error,
                            format!("Sensor loop error: {e}"),
                        )
                        .await;
                }
            }
        }
        snap
    }

    // -- Operator commands ----------------------------------------------------

    /// Manual actuator request. Catalog actuators bound to a node are queued
    /// for that node; everything else goes through the safety gate.
    pub async fn command_actuator(
        &self,
        name: &str,
        cmd: ActuatorCommand,
    ) -> Result<CommandOutcome, CommandError> {
        if let Some(duty) = cmd.duty_pct {
            if !(0.0..=100.0).contains(&duty) {
                return Err(CommandError::Invalid("duty_pct out of range"));
            }
        }
        let (catalog, interlock) = {
            let control = self.control.read().await;
            (control.catalog.clone(), control.interlock())
        };
        let meta = catalog.find_actuator(name, None);

        if let Some(duty) = cmd.duty_pct {
            let Some(m) = meta.filter(|m| m.supports_pwm) else {
                return Err(CommandError::Invalid("duty_pct not supported"));
            };
            match cmd.state {
                Some(false) if duty > 0.0 => {
                    return Err(CommandError::Invalid("state conflicts with duty_pct"))
                }
                Some(true) if duty == 0.0 => {
                    return Err(CommandError::Invalid("state conflicts with duty_pct"))
                }
                _ => {}
            }
            if !m.is_remote() {
                return Err(CommandError::Invalid("duty_pct backend not supported"));
            }
        }

        if let Some(m) = meta.filter(|m| m.is_remote()) {
            if let Some(lock) = interlock {
                return Err(ActuationError::InterlockActive(lock).into());
            }
            return self.queue_remote(m, name, &cmd).await;
        }

        let on = cmd
            .state
            .ok_or(CommandError::Invalid("state must be 'on' or 'off'"))?;
        let seconds = self.gate.apply(name, on, cmd.seconds, "manual").await?;
        let name = name.trim().to_ascii_uppercase();
        Ok(CommandOutcome::Local {
            state: self.registry.state(&name),
            name,
            seconds,
        })
    }

    async fn queue_remote(
        &self,
        meta: &ActuatorMeta,
        name: &str,
        cmd: &ActuatorCommand,
    ) -> Result<CommandOutcome, CommandError> {
        if cmd.seconds.is_some() {
            return Err(CommandError::Invalid("seconds not supported for remote actuators"));
        }
        let node_id = meta
            .node_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(NodeError::MissingNodeId)?
            .to_string();
        let actuator_id = match meta.id.trim() {
            "" => name.trim().to_string(),
            id => id.to_string(),
        };
        let (action, state) = match cmd.duty_pct {
            Some(duty) => (CommandAction::SetPwm, Switch::from_bool(duty > 0.0)),
            None => {
                let on = cmd
                    .state
                    .ok_or(CommandError::Invalid("state must be 'on' or 'off'"))?;
                (CommandAction::SetState, Switch::from_bool(on))
            }
        };
        let enqueued = self
            .nodes
            .enqueue(
                &node_id,
                CommandSpec {
                    actuator_id: actuator_id.clone(),
                    action,
                    state,
                    duty_pct: cmd.duty_pct,
                    ttl_s: None,
                },
            )
            .await;
        Ok(CommandOutcome::Queued {
            node_id,
            actuator_id,
            enqueued,
        })
    }

    /// Operator command addressed to a node directly. An actuator the
    /// catalog knows must be remote and bound to that same node; unknown
    /// actuator ids are passed through for the node to judge.
    pub async fn queue_node_command(&self, req: &CommandRequest) -> Result<Enqueued, NodeError> {
        let (node_id, spec) = parse_command(req)?;
        let (catalog, interlock) = {
            let control = self.control.read().await;
            (control.catalog.clone(), control.interlock())
        };
        if let Some(meta) = catalog.find_actuator(&spec.actuator_id, None) {
            if !meta.is_remote() {
                return Err(NodeError::InvalidCommand(
                    "actuator backend not supported".to_string(),
                ));
            }
            let expected = meta.node_id.as_deref().map(str::trim).unwrap_or("");
            if !expected.is_empty() && expected != node_id {
                return Err(NodeError::NodeMismatch {
                    actuator_id: spec.actuator_id,
                    expected: expected.to_string(),
                    requested: node_id,
                });
            }
        }
        if let Some(lock) = interlock {
            return Err(NodeError::InterlockActive(lock));
        }
        Ok(self.nodes.enqueue(&node_id, spec).await)
    }

    // -- Interlocks -----------------------------------------------------------

    /// Entering safe mode drives every output off and empties every node
    /// queue.
    pub async fn set_safe_mode(&self, enabled: bool) {
        self.control.write().await.safe_mode = enabled;
        if enabled {
            self.registry.all_off("safe_mode");
            self.nodes.clear_all("safe_mode").await;
        }
        self.interlock_event("SAFE MODE", enabled).await;
    }

    pub async fn set_estop(&self, enabled: bool) {
        self.control.write().await.estop = enabled;
        if enabled {
            self.registry.all_off("estop");
            self.nodes.clear_all("estop").await;
        }
        self.interlock_event("E-STOP", enabled).await;
    }

    async fn interlock_event(&self, label: &str, enabled: bool) {
        let (level, word) = if enabled {
            ("warning", "ON")
        } else {
            ("info", "OFF")
        };
        if enabled {
            warn!(interlock = label, "interlock engaged");
        } else {
            info!(interlock = label, "interlock released");
        }
        self.db
            .record_event(
                self.clock.now(),
                "system",
                level,
                &format!("{label} {word}"),
                None,
            )
            .await;
    }

    /// Everything off now, locally and on every node. Does not latch an
    /// interlock; see [`Gateway::set_estop`] for that.
    pub async fn emergency_stop(&self) -> BTreeMap<String, BroadcastReport> {
        let now = self.clock.now();
        self.registry.all_off("emergency_stop");
        if let Err(e) = self
            .db
            .log_actuation(now, "ALL", false, "emergency_stop", None)
            .await
        {
            warn!("actuation log write failed: {e:#}");
        }
        let catalog = self.control.read().await.catalog.clone();
        let report = self.nodes.emergency_broadcast(&catalog).await;
        warn!(nodes = report.len(), "emergency stop");
        report
    }

    /// Drive every output off before the process exits.
    pub async fn shutdown(&self) {
        self.registry.all_off("shutdown");
        self.db
            .record_event(self.clock.now(), "system", "info", "Gateway stopped", None)
            .await;
        info!("all outputs off, gateway stopped");
    }

    // -- Reloads --------------------------------------------------------------

    pub async fn reload_channels(&self, channels: Vec<Channel>) {
        let count = channels.len();
        self.registry.configure(channels);
        self.db
            .record_event(
                self.clock.now(),
                "system",
                "info",
                "Channels reloaded",
                Some(serde_json::json!({ "channels": count })),
            )
            .await;
    }

    pub async fn reload_catalog(&self, catalog: Catalog) {
        info!(
            actuators = catalog.actuators.len(),
            sensors = catalog.sensors.len(),
            "catalog reloaded"
        );
        self.control.write().await.catalog = catalog;
    }

    pub async fn reload_automation(&self, config: AutomationConfig) {
        self.control.write().await.heater_sensor = config.heater.sensor;
        self.engine.set_config(config).await;
    }

    /// Re-apply a freshly loaded configuration: limits, alert thresholds,
    /// catalog, automation parameters and the channel list. Reconfiguring
    /// the channels drives every output off. Runtime and node settings only
    /// take effect on restart.
    pub async fn apply_config(&self, config: Config) {
        {
            let mut control = self.control.write().await;
            control.limits = config.limits.clone();
            control.alert_thresholds = config.alerts.clone();
        }
        self.reload_catalog(config.catalog.clone()).await;
        self.reload_automation(config.automation.clone()).await;
        self.reload_channels(config.channels()).await;
    }

    // -- Status ---------------------------------------------------------------

    pub async fn status(&self) -> GatewayStatus {
        let control = self.control.read().await.snapshot();
        GatewayStatus {
            ts: self.clock.now(),
            control,
            actuators: self.registry.snapshot(),
            sensors: self.sensors.latest().await,
            averages: self.sensors.averages().await,
            health: self.health.snapshot().await,
            automation: self.engine.status().await,
            nodes: self.nodes.registry_snapshot().await,
            alerts: self.alerts.recent(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
