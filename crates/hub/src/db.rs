use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;

use crate::clock::{from_unix, to_unix, Timestamp};
use crate::sensors::SensorSnapshot;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuationRecord {
    pub ts: Timestamp,
    pub name: String,
    pub on: bool,
    pub reason: String,
    pub seconds: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub ts: Timestamp,
    pub category: String,
    pub level: String,
    pub message: String,
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRow {
    pub ts: Timestamp,
    pub node_id: String,
    pub zone: Option<String>,
    pub metric: String,
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub source: Option<String>,
    pub quality: Option<String>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/greenhouse/greenhouse.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" opens its own empty database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Actuation log
    // ----------------------------

    pub async fn log_actuation(
        &self,
        ts: Timestamp,
        name: &str,
        on: bool,
        reason: &str,
        seconds: Option<u32>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO actuator_log (ts, name, state, reason, seconds)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_unix(ts))
        .bind(name)
        .bind(if on { "on" } else { "off" })
        .bind(reason)
        .bind(seconds.map(i64::from))
        .execute(&self.pool)
        .await
        .context("log_actuation failed")?;
        Ok(())
    }

    /// Seconds of "on" time logged for `name` since `since`.
    pub async fn on_seconds_since(&self, name: &str, since: Timestamp) -> Result<f64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(seconds), 0) AS total
            FROM actuator_log
            WHERE name = ? AND state = 'on' AND seconds IS NOT NULL AND ts >= ?
            "#,
        )
        .bind(name)
        .bind(to_unix(since))
        .fetch_one(&self.pool)
        .await
        .context("on_seconds_since failed")?;
        let total: i64 = row.try_get("total").context("on_seconds_since: bad row")?;
        Ok(total as f64)
    }

    /// Same as `on_seconds_since`, grouped by actuator.
    pub async fn on_seconds_by_actuator(&self, since: Timestamp) -> Result<HashMap<String, f64>> {
        let rows = sqlx::query(
            r#"
            SELECT name, SUM(seconds) AS total
            FROM actuator_log
            WHERE state = 'on' AND seconds IS NOT NULL AND ts >= ?
            GROUP BY name
            "#,
        )
        .bind(to_unix(since))
        .fetch_all(&self.pool)
        .await
        .context("on_seconds_by_actuator failed")?;

        let mut totals = HashMap::new();
        for row in rows {
            let name: String = row.try_get("name")?;
            let total: i64 = row.try_get("total")?;
            totals.insert(name, total as f64);
        }
        Ok(totals)
    }

    pub async fn actuations_since(&self, since: Timestamp) -> Result<Vec<ActuationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT ts, name, state, reason, seconds
            FROM actuator_log
            WHERE ts >= ?
            ORDER BY id
            "#,
        )
        .bind(to_unix(since))
        .fetch_all(&self.pool)
        .await
        .context("actuations_since failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let ts: f64 = row.try_get("ts")?;
            let state: String = row.try_get("state")?;
            let seconds: Option<i64> = row.try_get("seconds")?;
            out.push(ActuationRecord {
                ts: from_unix(ts).unwrap_or_default(),
                name: row.try_get("name")?,
                on: state == "on",
                reason: row.try_get("reason")?,
                seconds: seconds.and_then(|s| u32::try_from(s).ok()),
            });
        }
        Ok(out)
    }

    // ----------------------------
    // Event log
    // ----------------------------

    pub async fn log_event(
        &self,
        ts: Timestamp,
        category: &str,
        level: &str,
        message: &str,
        meta: Option<&serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO event_log (ts, category, level, message, meta)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_unix(ts))
        .bind(category)
        .bind(level)
        .bind(message)
        .bind(meta.map(|m| m.to_string()))
        .execute(&self.pool)
        .await
        .context("log_event failed")?;
        Ok(())
    }

    /// Best-effort event logging: a failing sink never fails the caller.
    pub async fn record_event(
        &self,
        ts: Timestamp,
        category: &str,
        level: &str,
        message: &str,
        meta: Option<serde_json::Value>,
    ) {
        if let Err(e) = self
            .log_event(ts, category, level, message, meta.as_ref())
            .await
        {
            tracing::warn!(category, "event log write failed: {e:#}");
        }
    }

    pub async fn events_since(
        &self,
        since: Timestamp,
        category: Option<&str>,
    ) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT ts, category, level, message, meta
            FROM event_log
            WHERE ts >= ? AND (? IS NULL OR category = ?)
            ORDER BY id
            "#,
        )
        .bind(to_unix(since))
        .bind(category)
        .bind(category)
        .fetch_all(&self.pool)
        .await
        .context("events_since failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let ts: f64 = row.try_get("ts")?;
            let meta: Option<String> = row.try_get("meta")?;
            out.push(EventRecord {
                ts: from_unix(ts).unwrap_or_default(),
                category: row.try_get("category")?,
                level: row.try_get("level")?,
                message: row.try_get("message")?,
                meta: meta.and_then(|m| serde_json::from_str(&m).ok()),
            });
        }
        Ok(out)
    }

    // ----------------------------
    // Telemetry
    // ----------------------------

    /// Append rows in one transaction. Returns the number written.
    pub async fn insert_telemetry(&self, rows: &[TelemetryRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .context("insert_telemetry: begin failed")?;
        for r in rows {
            sqlx::query(
                r#"
                INSERT INTO telemetry_log (ts, node_id, zone, metric, value, unit, source, quality)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(to_unix(r.ts))
            .bind(&r.node_id)
            .bind(&r.zone)
            .bind(&r.metric)
            .bind(r.value)
            .bind(&r.unit)
            .bind(&r.source)
            .bind(&r.quality)
            .execute(&mut *tx)
            .await
            .context("insert_telemetry failed")?;
        }
        tx.commit().await.context("insert_telemetry: commit failed")?;
        Ok(rows.len())
    }

    pub async fn telemetry_between(
        &self,
        from: Timestamp,
        to: Timestamp,
        zone: Option<&str>,
        metric: Option<&str>,
    ) -> Result<Vec<TelemetryRow>> {
        let rows = sqlx::query(
            r#"
            SELECT ts, node_id, zone, metric, value, unit, source, quality
            FROM telemetry_log
            WHERE ts >= ? AND ts <= ?
              AND (? IS NULL OR zone = ?)
              AND (? IS NULL OR metric = ?)
            ORDER BY ts, id
            "#,
        )
        .bind(to_unix(from))
        .bind(to_unix(to))
        .bind(zone)
        .bind(zone)
        .bind(metric)
        .bind(metric)
        .fetch_all(&self.pool)
        .await
        .context("telemetry_between failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let ts: f64 = row.try_get("ts")?;
            out.push(TelemetryRow {
                ts: from_unix(ts).unwrap_or_default(),
                node_id: row.try_get("node_id")?,
                zone: row.try_get("zone")?,
                metric: row.try_get("metric")?,
                value: row.try_get("value")?,
                unit: row.try_get("unit")?,
                source: row.try_get("source")?,
                quality: row.try_get("quality")?,
            });
        }
        Ok(out)
    }

    // ----------------------------
    // Sensor log
    // ----------------------------

    /// Persist one snapshot. Skipped (returns false) when no reading in it
    /// is trustworthy.
    pub async fn insert_sensor_log(&self, snap: &SensorSnapshot) -> Result<bool> {
        if !snap.any_trustworthy() {
            return Ok(false);
        }
        let soil = &snap.soil.channels;
        sqlx::query(
            r#"
            INSERT INTO sensor_log (
                ts, dht_temp, dht_hum, ds18_temp, lux, soil_ch0, soil_ch1, soil_ch2, soil_ch3
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_unix(snap.ts))
        .bind(snap.dht22.temperature)
        .bind(snap.dht22.humidity)
        .bind(snap.ds18b20.temperature)
        .bind(snap.bh1750.lux)
        .bind(soil[0])
        .bind(soil[1])
        .bind(soil[2])
        .bind(soil[3])
        .execute(&self.pool)
        .await
        .context("insert_sensor_log failed")?;
        Ok(true)
    }

    pub async fn sensor_log_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sensor_log")
            .fetch_one(&self.pool)
            .await
            .context("sensor_log_count failed")?;
        Ok(row.try_get("n")?)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
