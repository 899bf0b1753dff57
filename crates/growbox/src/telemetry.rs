//! Metrics cycle and the telemetry hook.
//!
//! Every metrics tick reads the temperature sensor, builds a
//! [`TelemetrySnapshot`] and broadcasts it. Sinks (database, MQTT) subscribe
//! to the channel; the control loop doesn't know or care where snapshots go.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::relay::Channel;
use crate::sensor::TemperatureSource;
use crate::state::{ConfigState, SharedState};

/// Snapshots buffered per subscriber before a slow sink starts losing them.
pub const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub ts: DateTime<Utc>,
    pub temperature: f64,
    pub heat_duration: f64,
    pub lights: u8,
    pub water: u8,
    pub air: u8,
    pub heat: u8,
    pub last_water_ts: Option<DateTime<Utc>>,
    pub last_water_secs: f64,
}

impl TelemetrySnapshot {
    pub fn capture(st: &ConfigState, ts: DateTime<Utc>) -> Self {
        let m = &st.relay_metrics;
        Self {
            ts,
            temperature: st.curr_temperature,
            heat_duration: st.settings.control.heat_duration,
            lights: m[Channel::Lights.index()],
            water: m[Channel::Water.index()],
            air: m[Channel::Air.index()],
            heat: m[Channel::Heat.index()],
            last_water_ts: st.last_water_ts,
            last_water_secs: st.last_water_secs,
        }
    }
}

pub struct MetricsCycle {
    shared: SharedState,
    sensor: TemperatureSource,
    tx: broadcast::Sender<TelemetrySnapshot>,
}

impl MetricsCycle {
    pub fn new(
        shared: SharedState,
        sensor: TemperatureSource,
        tx: broadcast::Sender<TelemetrySnapshot>,
    ) -> Self {
        Self { shared, sensor, tx }
    }

    /// Refresh the temperature and publish a snapshot. Returns the snapshot
    /// and the delay before the next tick.
    pub async fn tick(&self) -> (TelemetrySnapshot, Duration) {
        self.sensor.read(&self.shared).await;

        let (snap, interval_secs) = {
            let st = self.shared.read().await;
            (
                TelemetrySnapshot::capture(&st, Utc::now()),
                st.settings.control.metric_interval_secs,
            )
        };

        // No subscribers is fine: nobody asked for telemetry.
        if self.tx.send(snap.clone()).is_err() {
            debug!("telemetry snapshot dropped, no sinks subscribed");
        }

        (snap, Duration::from_secs(interval_secs.max(1)))
    }

    /// Self-rescheduling loop. Intended to be `tokio::spawn`-ed by the supervisor.
    pub async fn run(self, initial_delay: Duration) {
        sleep(initial_delay).await;
        info!("metrics cycle started");
        loop {
            let (_, delay) = self.tick().await;
            sleep(delay).await;
        }
    }
}

/// Receive the next snapshot, skipping over any this sink fell behind on.
pub async fn next_snapshot(
    rx: &mut broadcast::Receiver<TelemetrySnapshot>,
    sink: &str,
) -> Option<TelemetrySnapshot> {
    loop {
        match rx.recv().await {
            Ok(snap) => return Some(snap),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(sink, skipped = n, "telemetry sink lagging");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Metric points older than this are deleted by the database sink.
pub const METRIC_RETENTION_DAYS: i64 = 30;

/// Inserts between retention passes (an hour at the default cadence).
const PRUNE_EVERY: u32 = 120;

async fn prune_old_points(db: &Db, now: DateTime<Utc>) {
    match db
        .prune_metric_points(now - chrono::Duration::days(METRIC_RETENTION_DAYS))
        .await
    {
        Ok(0) => {}
        Ok(n) => info!(removed = n, retention_days = METRIC_RETENTION_DAYS, "pruned metric points"),
        Err(e) => warn!("db: prune_metric_points failed: {e:#}"),
    }
}

/// Persist every snapshot as a metric point (best-effort). Expired points
/// are pruned on start and then every [`PRUNE_EVERY`] inserts.
pub async fn run_db_sink(mut rx: broadcast::Receiver<TelemetrySnapshot>, db: Db) {
    prune_old_points(&db, Utc::now()).await;

    let mut since_prune = 0;
    while let Some(snap) = next_snapshot(&mut rx, "db").await {
        if let Err(e) = db.insert_metric_point(&snap).await {
            warn!("db: insert_metric_point failed: {e:#}");
        }
        since_prune += 1;
        if since_prune >= PRUNE_EVERY {
            since_prune = 0;
            prune_old_points(&db, snap.ts).await;
        }
    }
}
