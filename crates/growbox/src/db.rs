use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

use crate::telemetry::TelemetrySnapshot;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub ts: DateTime<Utc>,
    pub temperature: f64,
    pub heat_duration: f64,
    pub lights: u8,
    pub water: u8,
    pub air: u8,
    pub heat: u8,
}

type MetricRow = (i64, f64, f64, i64, i64, i64, i64);

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .with_context(|| format!("timestamp out of range: {ms}"))
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/growbox/growbox.db"
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
    // Last watering
    // ----------------------------

    pub async fn save_water_state(&self, ts: DateTime<Utc>, secs: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO water_state (id, last_water_ts, last_water_secs)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              last_water_ts=excluded.last_water_ts,
              last_water_secs=excluded.last_water_secs
            "#,
        )
        .bind(ts.timestamp_millis())
        .bind(secs)
        .execute(&self.pool)
        .await
        .context("save_water_state failed")?;
        Ok(())
    }

    pub async fn load_water_state(&self) -> Result<Option<(DateTime<Utc>, f64)>> {
        let row: Option<(i64, f64)> = sqlx::query_as(
            r#"
            SELECT last_water_ts, last_water_secs
            FROM water_state
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("load_water_state failed")?;

        match row {
            Some((ms, secs)) => Ok(Some((from_millis(ms)?, secs))),
            None => Ok(None),
        }
    }

    // ----------------------------
    // Telemetry
    // ----------------------------

    pub async fn insert_metric_point(&self, snap: &TelemetrySnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metric_points (ts, temperature, heat_duration, lights, water, air, heat)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(snap.ts.timestamp_millis())
        .bind(snap.temperature)
        .bind(snap.heat_duration)
        .bind(i64::from(snap.lights))
        .bind(i64::from(snap.water))
        .bind(i64::from(snap.air))
        .bind(i64::from(snap.heat))
        .execute(&self.pool)
        .await
        .context("insert_metric_point failed")?;
        Ok(())
    }

    /// Delete metric points older than `before`. Returns the number removed.
    pub async fn prune_metric_points(&self, before: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM metric_points WHERE ts < ?")
            .bind(before.timestamp_millis())
            .execute(&self.pool)
            .await
            .context("prune_metric_points failed")?;
        Ok(res.rows_affected())
    }

    /// Newest `limit` metric points, newest first.
    pub async fn recent_metric_points(&self, limit: i64) -> Result<Vec<MetricPoint>> {
        let rows: Vec<MetricRow> = sqlx::query_as(
            r#"
            SELECT ts, temperature, heat_duration, lights, water, air, heat
            FROM metric_points
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_metric_points failed")?;

        rows.into_iter()
            .map(|(ts, temperature, heat_duration, lights, water, air, heat)| -> Result<MetricPoint> {
                Ok(MetricPoint {
                    ts: from_millis(ts)?,
                    temperature,
                    heat_duration,
                    lights: lights as u8,
                    water: water as u8,
                    air: air as u8,
                    heat: heat as u8,
                })
            })
            .collect()
    }
}
