mod actuator;
mod alerts;
mod automation;
mod catalog;
mod clock;
mod config;
mod db;
mod error;
mod gateway;
mod hardware;
mod health;
mod remote;
mod safety;
mod sensors;
mod sim;
mod state;
mod wire;

use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use actuator::{OutputBackend, SimulatedOutputs};
use alerts::LogNotifier;
use clock::SystemClock;
use db::Db;
use gateway::Gateway;
use hardware::HardwareSensors;
use sensors::SensorBackend;
use sim::{Scenario, SimulatedSensors};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file + env overrides ─────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = load_config(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:greenhouse.db?mode=rwc".to_string());
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    info!(db = %db_url, "db ready");

    // ── Hardware (or simulation) ────────────────────────────────────
    let simulation = cfg.runtime.simulation;
    let sensor_backend: Arc<dyn SensorBackend> = if simulation {
        let scenario = Scenario::from_str_lossy(&cfg.sensors.sim_scenario);
        info!(%scenario, "simulated sensors");
        Arc::new(SimulatedSensors::new(scenario, cfg.sensors.ds18b20_enabled))
    } else {
        Arc::new(HardwareSensors::new(cfg.sensors.clone()))
    };
    let outputs = output_backend(simulation)?;

    // ── Gateway + background tasks ──────────────────────────────────
    let gw = Arc::new(Gateway::build(
        cfg,
        db,
        Arc::new(SystemClock),
        outputs,
        sensor_backend,
        Arc::new(LogNotifier),
    ));
    let tasks = gw.spawn();
    info!(tasks = tasks.len(), "greenhouse hub running");

    // ── Reload on SIGHUP, stop on ctrl-c ────────────────────────────
    let mut hangup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for ctrl-c")?;
                break;
            }
            _ = hangup.recv() => match load_config(&config_path) {
                Ok(cfg) => {
                    gw.apply_config(cfg).await;
                    info!(path = %config_path, "config reloaded");
                }
                Err(e) => warn!("config reload rejected, keeping current settings: {e:#}"),
            },
        }
    }
    warn!("shutdown requested");
    for task in &tasks {
        task.abort();
    }
    gw.shutdown().await;
    Ok(())
}

fn load_config(path: &str) -> Result<config::Config> {
    let mut cfg = config::load(path)?;
    config::apply_env(&mut cfg, |key| env::var(key).ok());
    cfg.validate()
        .with_context(|| format!("invalid config after env overrides: {path}"))?;
    Ok(cfg)
}

#[cfg(feature = "gpio")]
fn output_backend(simulation: bool) -> Result<Box<dyn OutputBackend>> {
    if simulation {
        return Ok(Box::new(SimulatedOutputs::new()));
    }
    let gpio = actuator::GpioOutputs::new().context("failed to open GPIO")?;
    Ok(Box::new(gpio))
}

#[cfg(not(feature = "gpio"))]
fn output_backend(simulation: bool) -> Result<Box<dyn OutputBackend>> {
    if !simulation {
        warn!("built without the gpio feature; relays are simulated");
    }
    Ok(Box::new(SimulatedOutputs::new()))
}
