//! Ventilation cycle: alternates the air relay between "on for
//! `air_duration`" and "off for `air_interval`", and switches the grow light
//! by time of day on every tick.
//!
//! ```text
//! AIR_OFF ──[tick]──▶ AIR_ON ──[air_duration]──▶ tick ──▶ AIR_OFF ──[air_interval]──▶ …
//! ```

use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

use crate::clock::{current_hour, minutes_delay};
use crate::relay::{Channel, SharedRelays};
use crate::state::{RelayState, SharedState};

/// Lights stay on from midnight through hour `light_duration - 1`.
/// With 18 hours of light: on for hours 0..=17, off from 18.
pub fn light_should_be_on(hour: u32, light_duration: f64) -> bool {
    f64::from(hour) <= light_duration - 1.0
}

pub struct VentilationCycle {
    shared: SharedState,
    relays: SharedRelays,
}

impl VentilationCycle {
    pub fn new(shared: SharedState, relays: SharedRelays) -> Self {
        Self { shared, relays }
    }

    /// Run one step and return how long to wait before the next one.
    pub async fn tick(&self, hour: u32) -> Duration {
        let (air_val, lights_val, air_interval, air_duration, light_duration) = {
            let st = self.shared.read().await;
            let c = &st.settings.control;
            (
                st.curr_air_val,
                st.curr_lights_val,
                c.air_interval,
                c.air_duration,
                c.light_duration,
            )
        };

        let air_on = !air_val.is_on();
        let delay_min = if air_on { air_duration } else { air_interval };
        self.switch(Channel::Air, air_on).await;

        let lights_on = light_should_be_on(hour, light_duration);
        if lights_on != lights_val.is_on() {
            info!(hour, light_duration, "turning lights {}", if lights_on { "ON" } else { "OFF" });
            self.switch(Channel::Lights, lights_on).await;
        }

        minutes_delay(delay_min)
    }

    async fn switch(&self, channel: Channel, on: bool) {
        let metric = self.relays.lock().await.set(channel, on);
        let mut st = self.shared.write().await;
        match channel {
            Channel::Air => st.curr_air_val = RelayState::from(on),
            Channel::Lights => st.curr_lights_val = RelayState::from(on),
            _ => {}
        }
        st.record_relay(channel, on, metric);
    }

    /// Self-rescheduling loop. Intended to be `tokio::spawn`-ed by the supervisor.
    pub async fn run(self, initial_delay: Duration) {
        sleep(initial_delay).await;
        info!("ventilation cycle started");
        loop {
            let delay = self.tick(current_hour()).await;
            sleep(delay).await;
        }
    }
}
