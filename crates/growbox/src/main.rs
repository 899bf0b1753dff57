mod clock;
mod config;
mod db;
mod heat;
mod irrigation;
mod mqtt;
mod relay;
mod sensor;
mod stage;
mod state;
mod supervisor;
mod telemetry;
mod ventilation;
mod web;

use anyhow::Result;
use std::env;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use relay::RelayBoard;
use supervisor::Supervisor;
use telemetry::CHANNEL_CAPACITY;
use web::AppState;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:growbox.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let mqtt_host = env::var("MQTT_HOST").ok();
    let mqtt_port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "growbox".to_string());

    // ── Config file ─────────────────────────────────────────────────
    let cfg = config::load_or_default(&config_path);

    // ── Database (optional) ─────────────────────────────────────────
    let db = match open_db(&db_url).await {
        Ok(db) => Some(db),
        Err(e) => {
            warn!("database unavailable, running without persistence: {e:#}");
            None
        }
    };

    // ── Relay board ─────────────────────────────────────────────────
    let board = RelayBoard::new(&cfg.relay_pins(), cfg.hardware.active_low);
    let relays = relay::shared(board);

    // ── Shared state ────────────────────────────────────────────────
    let shared = supervisor::boot_state(cfg, db.as_ref()).await.shared();

    // ── Telemetry sinks ─────────────────────────────────────────────
    let (telemetry_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
    if let Some(db) = db.clone() {
        tokio::spawn(telemetry::run_db_sink(telemetry_tx.subscribe(), db));
    }
    if let Some(host) = mqtt_host {
        let client = mqtt::connect(&host, mqtt_port, &device_id);
        let topic = mqtt::metrics_topic(&device_id);
        info!(host = %host, port = mqtt_port, topic = %topic, "mqtt sink enabled");
        tokio::spawn(mqtt::run_sink(telemetry_tx.subscribe(), client, topic));
    }

    // ── Web server ──────────────────────────────────────────────────
    let web_state = AppState {
        shared: shared.clone(),
        relays: relays.clone(),
        db: db.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("web api stopped: {e:#}");
        }
    });

    // ── Control loop ────────────────────────────────────────────────
    let sup = Supervisor::new(shared, relays, db, config_path, telemetry_tx);
    let mut cycles = sup.start().await;

    tokio::select! {
        _ = supervisor::shutdown_signal() => {
            sup.shutdown().await;
            info!("growbox stopped");
            Ok(())
        }
        err = supervisor::watch_cycles(&mut cycles) => {
            sup.shutdown().await;
            Err(err.context("control loop failed"))
        }
    }
}

async fn open_db(db_url: &str) -> Result<Db> {
    let db = Db::connect(db_url).await?;
    db.migrate().await?;
    Ok(db)
}
