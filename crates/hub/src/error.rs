//! Domain error types. Every variant is a recoverable, caller-facing
//! condition; infrastructure failures travel as `anyhow::Error` instead.

use thiserror::Error;

use crate::state::Interlock;

/// Why the safety gate (or the registry beneath it) refused a request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActuationError {
    #[error("Unknown actuator: {0}")]
    UnknownActuator(String),

    #[error("{0} active")]
    InterlockActive(Interlock),

    #[error("{locked} locked: {sensor} sensor error")]
    SensorFaultLocked {
        locked: &'static str,
        sensor: &'static str,
    },

    #[error("Fan required by safety policy")]
    DependencyUnmet,

    #[error("Already on")]
    AlreadyOn,

    #[error("{0}")]
    InvalidDuration(&'static str),

    #[error("{} {remaining_secs}s", cooldown_label(.pump))]
    CooldownActive { remaining_secs: u64, pump: bool },

    #[error("Daily limit reached")]
    DailyBudgetExhausted,

    #[error("Heater blocked: temperature {temp:.1}C >= cutoff {cutoff:.1}C")]
    HeaterCutoffExceeded { temp: f64, cutoff: f64 },
}

fn cooldown_label(pump: &bool) -> &'static str {
    if *pump {
        "Pump cooldown"
    } else {
        "Cooldown"
    }
}

impl ActuationError {
    /// Short machine-readable code for logs and event metadata.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownActuator(_) => "unknown_actuator",
            Self::InterlockActive(_) => "interlock_active",
            Self::SensorFaultLocked { .. } => "sensor_fault_locked",
            Self::DependencyUnmet => "dependency_unmet",
            Self::AlreadyOn => "already_on",
            Self::InvalidDuration(_) => "invalid_duration",
            Self::CooldownActive { .. } => "cooldown_active",
            Self::DailyBudgetExhausted => "daily_budget_exhausted",
            Self::HeaterCutoffExceeded { .. } => "heater_cutoff_exceeded",
        }
    }
}

/// Rejections from the remote node protocol.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NodeError {
    #[error("node_id required")]
    MissingNodeId,

    #[error("node_auth_not_configured")]
    AuthNotConfigured,

    #[error("unauthorized")]
    AuthFailed,

    #[error("rate_limited")]
    RateLimited,

    #[error("{0}")]
    InvalidCommand(String),

    #[error("{0}")]
    InvalidPayload(String),

    #[error("actuator {actuator_id} is bound to node {expected}, not {requested}")]
    NodeMismatch {
        actuator_id: String,
        expected: String,
        requested: String,
    },

    #[error("{0} active")]
    InterlockActive(Interlock),
}

impl NodeError {
    /// HTTP-style status a transport layer would map this to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingNodeId
            | Self::InvalidCommand(_)
            | Self::InvalidPayload(_)
            | Self::NodeMismatch { .. } => 400,
            Self::AuthNotConfigured | Self::AuthFailed => 401,
            Self::InterlockActive(_) => 409,
            Self::RateLimited => 429,
        }
    }
}

/// Rejections from an operator actuator command, which may be routed either
/// through the safety gate or into a remote node's queue.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("{0}")]
    Invalid(&'static str),

    #[error(transparent)]
    Actuation(#[from] ActuationError),

    #[error(transparent)]
    Node(#[from] NodeError),
}

impl CommandError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Invalid(_) => 400,
            Self::Actuation(_) => 403,
            Self::Node(e) => e.status_code(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
