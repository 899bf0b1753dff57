//! Wires the cycles to the shared state and starts them once the relay board
//! is up. Each cycle runs in its own task and only ever talks to the others
//! through the shared state and the relay board.

use anyhow::anyhow;
use chrono::Local;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config;
use crate::db::Db;
use crate::heat::HeatRegulator;
use crate::irrigation::IrrigationScheduler;
use crate::relay::SharedRelays;
use crate::sensor::TemperatureSource;
use crate::stage;
use crate::state::{ConfigState, SharedState};
use crate::telemetry::{MetricsCycle, TelemetrySnapshot};
use crate::ventilation::VentilationCycle;

// Staggered first ticks so the relays don't all switch at once on boot.
const VENTILATION_START: Duration = Duration::from_secs(5);
const HEAT_START: Duration = Duration::from_secs(6);
const IRRIGATION_START: Duration = Duration::from_secs(8);
const METRICS_START: Duration = Duration::from_secs(10);

/// Build the boot state: settings, derived water plan and the persisted last
/// watering (if any).
pub async fn boot_state(settings: config::Config, db: Option<&Db>) -> ConfigState {
    let water = stage::water_plan(&settings, Local::now().date_naive());
    let mut st = ConfigState::new(settings, water);

    if let Some(db) = db {
        match db.load_water_state().await {
            Ok(Some((ts, secs))) => {
                info!(last_water_ts = %ts, last_water_secs = secs, "restored last watering");
                st.last_water_ts = Some(ts);
                st.last_water_secs = secs;
            }
            Ok(None) => info!("no watering on record"),
            Err(e) => {
                warn!("failed to load last watering: {e:#}");
                st.record_error(format!("load last watering failed: {e}"));
            }
        }
    }

    st.record_system(format!(
        "booted: water {}s every {}h",
        st.water_duration, st.water_interval
    ));
    st
}

pub struct Supervisor {
    shared: SharedState,
    relays: SharedRelays,
    db: Option<Db>,
    config_path: String,
    telemetry: broadcast::Sender<TelemetrySnapshot>,
}

impl Supervisor {
    pub fn new(
        shared: SharedState,
        relays: SharedRelays,
        db: Option<Db>,
        config_path: String,
        telemetry: broadcast::Sender<TelemetrySnapshot>,
    ) -> Self {
        Self {
            shared,
            relays,
            db,
            config_path,
            telemetry,
        }
    }

    /// Hardware is ready: force every relay off and start all cycles. Each
    /// task yields its cycle name if it ever returns; see [`watch_cycles`].
    pub async fn start(&self) -> JoinSet<&'static str> {
        self.relays.lock().await.all_off();

        let (sensor_path, check_secs) = {
            let st = self.shared.read().await;
            (
                st.settings.hardware.temperature_file.clone(),
                st.settings.control.config_check_interval_secs,
            )
        };

        let ventilation = VentilationCycle::new(self.shared.clone(), self.relays.clone());
        let heat = HeatRegulator::new(self.shared.clone(), self.relays.clone());
        let irrigation =
            IrrigationScheduler::new(self.shared.clone(), self.relays.clone(), self.db.clone());
        let metrics = MetricsCycle::new(
            self.shared.clone(),
            TemperatureSource::new(sensor_path),
            self.telemetry.clone(),
        );

        let mut cycles = JoinSet::new();
        cycles.spawn(async move {
            ventilation.run(VENTILATION_START).await;
            "ventilation"
        });
        cycles.spawn(async move {
            heat.run(HEAT_START).await;
            "heat"
        });
        cycles.spawn(async move {
            irrigation.run(IRRIGATION_START).await;
            "irrigation"
        });
        cycles.spawn(async move {
            metrics.run(METRICS_START).await;
            "metrics"
        });
        let (shared, path) = (self.shared.clone(), self.config_path.clone());
        cycles.spawn(async move {
            run_config_refresh(shared, path, Duration::from_secs(check_secs.max(1))).await;
            "config refresh"
        });

        self.shared
            .write()
            .await
            .record_system("control cycles started".to_string());
        info!(cycles = cycles.len(), "control cycles started");

        cycles
    }

    /// Best-effort relay shutdown on termination.
    pub async fn shutdown(&self) {
        info!("setting relays OFF");
        self.relays.lock().await.all_off();
    }
}

/// Resolves once any control cycle stops. The cycles loop forever, so any
/// exit (a return or a panic) is fatal and comes back as the error to
/// report at the process boundary.
pub async fn watch_cycles(cycles: &mut JoinSet<&'static str>) -> anyhow::Error {
    let err = match cycles.join_next().await {
        Some(Ok(name)) => anyhow!("{name} cycle exited unexpectedly"),
        Some(Err(e)) if e.is_panic() => anyhow!("control cycle panicked: {e}"),
        Some(Err(e)) => anyhow!("control cycle stopped: {e}"),
        None => anyhow!("no control cycles running"),
    };
    error!("{err:#}");
    err
}

/// Re-read the config file. A valid file replaces the authored settings; a
/// missing or invalid one keeps the previous settings. Runtime fields are
/// left to their owning cycles (irrigation picks up a new stage table at its
/// next watering). Returns whether anything changed.
pub async fn refresh_config(shared: &SharedState, path: &str) -> bool {
    let cfg = match config::load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("config refresh failed, keeping previous settings: {e:#}");
            return false;
        }
    };

    let mut st = shared.write().await;
    if st.settings == cfg {
        return false;
    }
    if st.settings.hardware != cfg.hardware {
        warn!("hardware settings changed; relay wiring applies after restart");
    }
    st.settings = cfg;
    st.record_system("config reloaded".to_string());
    info!(path, "config reloaded");
    true
}

async fn run_config_refresh(shared: SharedState, path: String, first_delay: Duration) {
    let mut delay = first_delay;
    loop {
        sleep(delay).await;
        refresh_config(&shared, &path).await;
        let secs = shared.read().await.settings.control.config_check_interval_secs;
        delay = Duration::from_secs(secs.max(1));
    }
}

/// Resolves on Ctrl-C or SIGTERM (a service manager stopping us).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
