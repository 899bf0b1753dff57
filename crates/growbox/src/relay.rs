//! Relay control via GPIO. The `gpio` feature gates the real rppal driver;
//! without it, a mock board logs state changes.
//!
//! Relay commands never fail from the caller's point of view: a missing pin
//! or GPIO controller is logged and the command is dropped, so the control
//! cycles keep advancing their commanded state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};
#[cfg(feature = "gpio")]
use tracing::{error, warn};
#[cfg(not(feature = "gpio"))]
use tracing::{debug, warn};

/// Telemetry marker reported for any channel that is OFF.
pub const METRIC_OFF: u8 = 70;
/// Telemetry marker for the first channel when ON; later channels add their index.
pub const METRIC_ON_BASE: u8 = 71;

pub type SharedRelays = Arc<Mutex<RelayBoard>>;

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Lights,
    Water,
    Air,
    Heat,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Lights, Channel::Water, Channel::Air, Channel::Heat];

    pub fn index(self) -> usize {
        match self {
            Channel::Lights => 0,
            Channel::Water => 1,
            Channel::Air => 2,
            Channel::Heat => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Channel::Lights => "lights",
            Channel::Water => "water",
            Channel::Air => "air",
            Channel::Heat => "heat",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Marker value pushed to telemetry for a channel's commanded state.
/// Distinct per channel when ON so the lines don't overlap on a chart.
pub fn metric_value(channel: Channel, on: bool) -> u8 {
    if on {
        METRIC_ON_BASE + channel.index() as u8
    } else {
        METRIC_OFF
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (production: rppal on Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct RelayBoard {
    pins: HashMap<Channel, OutputPin>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub fn new(channel_pins: &[(Channel, u8)], active_low: bool) -> Self {
        let mut pins = HashMap::new();

        match Gpio::new() {
            Ok(gpio) => {
                for (channel, pin_num) in channel_pins {
                    match gpio.get(*pin_num) {
                        Ok(pin) => {
                            let mut pin = pin.into_output();
                            // Fail-safe: ensure "OFF" at startup
                            if active_low {
                                pin.set_high();
                            } else {
                                pin.set_low();
                            }
                            pins.insert(*channel, pin);
                        }
                        Err(e) => {
                            error!(%channel, gpio = pin_num, "relay pin unavailable: {e}");
                        }
                    }
                }
            }
            Err(e) => error!("gpio controller unavailable, relay commands will be dropped: {e}"),
        }

        Self { pins, active_low }
    }

    pub fn set(&mut self, channel: Channel, on: bool) -> u8 {
        if let Some(pin) = self.pins.get_mut(&channel) {
            // active-low relay: LOW = ON, HIGH = OFF
            if on == self.active_low {
                pin.set_low();
            } else {
                pin.set_high();
            }
            tracing::debug!(%channel, "relay set {}", on_off(on));
        } else {
            warn!(%channel, "relay not wired, {} command dropped", on_off(on));
        }
        metric_value(channel, on)
    }

    pub fn all_off(&mut self) {
        for channel in Channel::ALL {
            self.set(channel, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development: no hardware, logs state changes)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct RelayBoard {
    pub(crate) channels: HashMap<Channel, bool>,
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub fn new(channel_pins: &[(Channel, u8)], _active_low: bool) -> Self {
        let mut channels = HashMap::new();
        for (channel, pin_num) in channel_pins {
            debug!("[mock-gpio] registered relay={channel} (gpio {pin_num} not wired)");
            channels.insert(*channel, false);
        }
        debug!("[mock-gpio] relay board initialised (no hardware)");
        Self { channels }
    }

    pub fn set(&mut self, channel: Channel, on: bool) -> u8 {
        if let Some(state) = self.channels.get_mut(&channel) {
            *state = on;
            debug!("[mock-gpio] relay={channel} set {}", on_off(on));
        } else {
            warn!("[mock-gpio] relay={channel} not registered, {} dropped", on_off(on));
        }
        metric_value(channel, on)
    }

    pub fn all_off(&mut self) {
        for channel in Channel::ALL {
            self.set(channel, false);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_on(&self, channel: Channel) -> bool {
        self.channels.get(&channel).copied().unwrap_or(false)
    }
}

/// Build a board behind the shared handle the cycles use.
pub fn shared(board: RelayBoard) -> SharedRelays {
    Arc::new(Mutex::new(board))
}

// ===========================================================================
// Tests
// ===========================================================================
