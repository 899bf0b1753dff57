//! Adaptive duty-cycle heat regulator.
//!
//! The heater alternates between an ON duration and an OFF interval. Each
//! tick nudges whichever of the two is about to start according to how far
//! the last temperature reading sits from the target. The bands are
//! asymmetric and widen with the error; between -0.5 and +0.4 nothing is
//! adjusted.
//!
//! | error         | duration adj | interval adj |
//! |---------------|--------------|--------------|
//! | > 1.5         | -0.5         | +0.3         |
//! | > 1.0         | -0.4         | +0.1         |
//! | > 0.4         | -0.3         |  0           |
//! | < -1.5        | +0.7         | -0.2         |
//! | < -1.0        | +0.5         | -0.1         |
//! | < -0.5        | +0.4         |  0           |
//!
//! On the cold side a dark box gets another +0.2 minutes of heat.

use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

use crate::clock::minutes_delay;
use crate::relay::{Channel, SharedRelays};
use crate::state::{RelayState, SharedState};

/// Extra heating minutes added on the cold side while the lights are off.
const DARK_HEAT_BONUS: f64 = 0.2;

/// Minutes added to the next ON duration / OFF interval.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Adjustment {
    pub duration: f64,
    pub interval: f64,
}

/// Banded correction for `error = current - target` (°F).
pub fn adjustment(error: f64, lights_on: bool) -> Adjustment {
    if error > 0.4 {
        let (duration, interval) = if error > 1.5 {
            (-0.5, 0.3)
        } else if error > 1.0 {
            (-0.4, 0.1)
        } else {
            (-0.3, 0.0)
        };
        Adjustment { duration, interval }
    } else if error < -0.5 {
        let (mut duration, interval) = if error < -1.5 {
            (0.7, -0.2)
        } else if error < -1.0 {
            (0.5, -0.1)
        } else {
            (0.4, 0.0)
        };
        if !lights_on {
            duration += DARK_HEAT_BONUS;
        }
        Adjustment { duration, interval }
    } else {
        Adjustment::default()
    }
}

pub struct HeatRegulator {
    shared: SharedState,
    relays: SharedRelays,
}

impl HeatRegulator {
    pub fn new(shared: SharedState, relays: SharedRelays) -> Self {
        Self { shared, relays }
    }

    /// Toggle the heater and return the adjusted delay until the next toggle.
    pub async fn tick(&self) -> Duration {
        let (heat_val, lights_val, current, target, heat_duration, heat_interval) = {
            let st = self.shared.read().await;
            let c = &st.settings.control;
            (
                st.curr_heat_val,
                st.curr_lights_val,
                st.curr_temperature,
                c.target_temperature,
                c.heat_duration,
                c.heat_interval,
            )
        };

        let error = current - target;
        let adj = adjustment(error, lights_val.is_on());

        let heat_on = !heat_val.is_on();
        let delay_min = if heat_on {
            heat_duration + adj.duration
        } else {
            heat_interval + adj.interval
        };

        let metric = self.relays.lock().await.set(Channel::Heat, heat_on);

        info!(
            target,
            current,
            delay_min,
            duration_adj = adj.duration,
            interval_adj = adj.interval,
            "heat {}",
            if heat_on { "ON" } else { "OFF" }
        );

        let mut st = self.shared.write().await;
        st.curr_heat_val = RelayState::from(heat_on);
        st.record_relay(Channel::Heat, heat_on, metric);
        st.record_heat(format!(
            "target {target:.2}, current {current:.2}, next toggle in {delay_min:.2} min"
        ));

        minutes_delay(delay_min)
    }

    /// Self-rescheduling loop. Intended to be `tokio::spawn`-ed by the supervisor.
    pub async fn run(self, initial_delay: Duration) {
        sleep(initial_delay).await;
        info!("heat regulator started");
        loop {
            let delay = self.tick().await;
            sleep(delay).await;
        }
    }
}
