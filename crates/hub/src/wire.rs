//! Remote node payloads: telemetry in, commands out. Parsing is lenient
//! per entry so one malformed sensor never sinks the whole batch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{from_unix, Timestamp};
use crate::error::NodeError;

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Body a node posts with its readings and command acknowledgements.
/// Loosely typed: validation happens per field so errors can be reported
/// individually.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryRequest {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub zone: Option<Value>,
    #[serde(default)]
    pub ts: Option<Value>,
    #[serde(default)]
    pub sensors: Option<Value>,
    #[serde(default)]
    pub status: Option<Value>,
    #[serde(default)]
    pub acks: Option<Value>,
}

/// One per-entry problem in a telemetry batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolIssue {
    pub code: String,
    pub detail: String,
}

impl ProtocolIssue {
    pub fn new(code: &str, detail: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            detail: detail.into(),
        }
    }
}

/// A validated sensor entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorEntry {
    pub source: Option<String>,
    pub metric: String,
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub quality: Option<String>,
}

/// Numbers pass through; numeric strings are accepted too.
fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn optional_string(value: Option<&Value>) -> Result<Option<String>, ()> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(()),
    }
}

/// Validate `sensors[idx]`.
pub fn parse_sensor_entry(idx: usize, entry: &Value) -> Result<SensorEntry, ProtocolIssue> {
    let invalid = |what: &str| ProtocolIssue::new("invalid_sensor", format!("sensors[{idx}] {what}"));

    let Value::Object(obj) = entry else {
        return Err(invalid("not object"));
    };
    let metric = match obj.get("metric") {
        Some(Value::String(m)) if !m.trim().is_empty() => m.trim().to_string(),
        _ => return Err(invalid("missing metric")),
    };
    let value = match obj.get("value") {
        None | Some(Value::Null) => None,
        Some(v) => Some(coerce_f64(v).ok_or_else(|| invalid("value not number"))?),
    };
    let unit = optional_string(obj.get("unit")).map_err(|_| invalid("unit not string"))?;
    let quality = optional_string(obj.get("quality")).map_err(|_| invalid("quality not string"))?;
    let source = obj
        .get("id")
        .filter(|v| !v.is_null())
        .or_else(|| obj.get("source").filter(|v| !v.is_null()))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });

    Ok(SensorEntry {
        source,
        metric,
        value,
        unit,
        quality,
    })
}

/// Ack ids from the `acks` field. Blank ids are ignored.
pub fn parse_ack_ids(acks: Option<&Value>) -> Result<Vec<String>, ProtocolIssue> {
    match acks {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect()),
        Some(_) => Err(ProtocolIssue::new("invalid_ack", "acks must be list")),
    }
}

/// Unix seconds (number or numeric string) or an RFC 3339 / ISO 8601
/// datetime.
pub fn parse_ts(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<f64>() {
        return from_unix(secs);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&chrono::Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(crate::clock::from_local)
}

pub fn parse_ts_value(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_unix),
        Value::String(s) => parse_ts(s),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Auth header helpers
// ---------------------------------------------------------------------------

/// Node token from the `X-Node-Token` header, falling back to
/// `Authorization: Bearer <token>`.
pub fn node_token(x_node_token: Option<&str>, authorization: Option<&str>) -> Option<String> {
    let raw = x_node_token
        .filter(|v| !v.trim().is_empty())
        .or(authorization)?
        .trim_start();
    let token = match raw.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => raw[7..].trim(),
        _ => raw.trim(),
    };
    (!token.is_empty()).then(|| token.to_string())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    SetState,
    SetPwm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    pub fn from_bool(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }

    /// `true`/`false` or `"on"`/`"off"` (any case).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::from_bool(*b)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "on" => Some(Self::On),
                "off" => Some(Self::Off),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Operator request to queue a command for a node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub actuator_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub state: Option<Value>,
    #[serde(default)]
    pub duty_pct: Option<Value>,
    #[serde(default)]
    pub ttl_s: Option<Value>,
}

/// A validated command, ready to queue.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub actuator_id: String,
    pub action: CommandAction,
    pub state: Switch,
    pub duty_pct: Option<f64>,
    pub ttl_s: Option<u32>,
}

impl CommandSpec {
    /// Off command used by the emergency broadcast.
    pub fn off(actuator_id: &str, pwm: bool) -> Self {
        Self {
            actuator_id: actuator_id.to_string(),
            action: if pwm {
                CommandAction::SetPwm
            } else {
                CommandAction::SetState
            },
            state: Switch::Off,
            duty_pct: pwm.then_some(0.0),
            ttl_s: None,
        }
    }
}

/// Validate an operator command. The action defaults to `set_pwm` when a
/// duty is given and `set_state` otherwise.
pub fn parse_command(req: &CommandRequest) -> Result<(String, CommandSpec), NodeError> {
    let invalid = |msg: &str| NodeError::InvalidCommand(msg.to_string());

    let node_id = req
        .node_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(NodeError::MissingNodeId)?
        .to_string();
    let actuator_id = req
        .actuator_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("actuator_id required"))?
        .to_string();

    let duty_raw = req.duty_pct.as_ref().filter(|v| !v.is_null());
    let action = match req.action.as_deref().map(|a| a.trim().to_ascii_lowercase()) {
        None => None,
        Some(a) if a.is_empty() => None,
        Some(a) => Some(a),
    };
    let action = match action.as_deref() {
        None if duty_raw.is_some() => CommandAction::SetPwm,
        None => CommandAction::SetState,
        Some("set_state") => CommandAction::SetState,
        Some("set_pwm") => CommandAction::SetPwm,
        Some(_) => return Err(invalid("invalid action")),
    };

    let (state, duty_pct) = match action {
        CommandAction::SetState => {
            let state = req
                .state
                .as_ref()
                .and_then(Switch::from_value)
                .ok_or_else(|| invalid("state required"))?;
            (state, None)
        }
        CommandAction::SetPwm => {
            let duty = coerce_f64(duty_raw.ok_or_else(|| invalid("duty_pct required"))?)
                .ok_or_else(|| invalid("invalid duty_pct"))?;
            if !(0.0..=100.0).contains(&duty) {
                return Err(invalid("duty_pct out of range"));
            }
            (Switch::from_bool(duty > 0.0), Some(duty))
        }
    };

    let ttl_s = match req.ttl_s.as_ref().filter(|v| !v.is_null()) {
        None => None,
        Some(v) => {
            let ttl = v.as_i64().ok_or_else(|| invalid("invalid ttl_s"))?;
            Some(u32::try_from(ttl).map_err(|_| invalid("invalid ttl_s"))?)
        }
    };

    Ok((
        node_id,
        CommandSpec {
            actuator_id,
            action,
            state,
            duty_pct,
            ttl_s,
        },
    ))
}

/// A queued command as delivered to the node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeCommand {
    pub cmd_id: String,
    pub actuator_id: String,
    pub action: CommandAction,
    pub state: Switch,
    pub duty_pct: Option<f64>,
    pub ttl_s: u32,
    #[serde(skip)]
    pub created_ts: Timestamp,
}

// ===========================================================================
// Tests
// ===========================================================================
