use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::relay::{Channel, METRIC_OFF};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<ConfigState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Last commanded state of a relay channel. Mirrors the hardware only as far
/// as the hardware obeyed; nothing reads the pins back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelayState {
    On,
    #[default]
    Off,
}

impl RelayState {
    pub fn is_on(self) -> bool {
        self == RelayState::On
    }
}

impl From<bool> for RelayState {
    fn from(on: bool) -> Self {
        if on {
            RelayState::On
        } else {
            RelayState::Off
        }
    }
}

/// Process-wide configuration and control state.
///
/// `settings` is authored configuration; it is only replaced wholesale by
/// the config refresh. Every runtime field below has exactly one writer:
/// temperature by the metrics cycle, air and lights by ventilation, heat by
/// the heat regulator, water fields by irrigation.
pub struct ConfigState {
    pub started_at: Instant,
    pub settings: Config,

    pub curr_temperature: f64,

    /// Seconds of water per event, derived from the stage table.
    pub water_duration: f64,
    /// Hours between water events, derived from the stage table.
    pub water_interval: f64,
    pub last_water_ts: Option<DateTime<Utc>>,
    pub last_water_secs: f64,

    pub curr_air_val: RelayState,
    pub curr_heat_val: RelayState,
    pub curr_lights_val: RelayState,
    pub relay_metrics: [u8; 4],

    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Relay,
    Heat,
    Water,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub settings: Config,
    pub curr_temperature: f64,
    pub water_duration: f64,
    pub water_interval: f64,
    pub last_water_ts: Option<DateTime<Utc>>,
    pub last_water_secs: f64,
    pub lights: RelayState,
    pub air: RelayState,
    pub heat: RelayState,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl ConfigState {
    /// Fresh state for boot. The temperature starts at the target so the
    /// heat regulator sits in its dead band until the first real reading.
    pub fn new(settings: Config, water: (f64, f64)) -> Self {
        let curr_temperature = settings.control.target_temperature;
        Self {
            started_at: Instant::now(),
            settings,
            curr_temperature,
            water_duration: water.0,
            water_interval: water.1,
            last_water_ts: None,
            last_water_secs: 0.0,
            curr_air_val: RelayState::Off,
            curr_heat_val: RelayState::Off,
            curr_lights_val: RelayState::Off,
            relay_metrics: [METRIC_OFF; 4],
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }

    /// Record a relay command and the telemetry marker it produced.
    pub fn record_relay(&mut self, channel: Channel, on: bool, metric: u8) {
        self.relay_metrics[channel.index()] = metric;
        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Relay, format!("{channel} set {state_str}"));
    }

    pub fn record_heat(&mut self, detail: String) {
        self.push_event(EventKind::Heat, detail);
    }

    pub fn record_water(&mut self, detail: String) {
        self.push_event(EventKind::Water, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            settings: self.settings.clone(),
            curr_temperature: self.curr_temperature,
            water_duration: self.water_duration,
            water_interval: self.water_interval,
            last_water_ts: self.last_water_ts,
            last_water_secs: self.last_water_secs,
            lights: self.curr_lights_val,
            air: self.curr_air_val,
            heat: self.curr_heat_val,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}
