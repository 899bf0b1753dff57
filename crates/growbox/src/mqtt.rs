//! Optional MQTT telemetry sink: publishes each snapshot as JSON to
//! `tele/<device_id>/metrics`.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::telemetry::{next_snapshot, TelemetrySnapshot};

/// Telemetry topic for a device.
pub(crate) fn metrics_topic(device_id: &str) -> String {
    format!("tele/{device_id}/metrics")
}

/// Serialize a snapshot as the MQTT payload.
pub(crate) fn encode(snap: &TelemetrySnapshot) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(snap)
}

/// Create the client and keep its event loop polled in the background.
pub(crate) fn connect(host: &str, port: u16, device_id: &str) -> AsyncClient {
    let mut mqttoptions = MqttOptions::new(format!("growbox-{device_id}"), host, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    // We only publish, but the event loop still has to run to keep the
    // connection alive and flush outgoing packets.
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("mqtt connected"),
                Ok(Event::Incoming(Packet::Disconnect)) => warn!("mqtt disconnected"),
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. reconnecting...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    client
}

/// Forward snapshots to the broker. Publish failures are logged and dropped.
pub(crate) async fn run_sink(
    mut rx: broadcast::Receiver<TelemetrySnapshot>,
    client: AsyncClient,
    topic: String,
) {
    while let Some(snap) = next_snapshot(&mut rx, "mqtt").await {
        let payload = match encode(&snap) {
            Ok(p) => p,
            Err(e) => {
                warn!("mqtt: snapshot encode failed: {e}");
                continue;
            }
        };
        if let Err(e) = client
            .publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
        {
            warn!(topic = %topic, "mqtt: publish failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn snapshot() -> TelemetrySnapshot {
        TelemetrySnapshot {
            ts: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            temperature: 75.25,
            heat_duration: 1.8,
            lights: 71,
            water: 70,
            air: 73,
            heat: 74,
            last_water_ts: None,
            last_water_secs: 0.0,
        }
    }

    #[test]
    fn topic_includes_device_id() {
        assert_eq!(metrics_topic("growbox"), "tele/growbox/metrics");
        assert_eq!(metrics_topic("tent-2"), "tele/tent-2/metrics");
    }

    #[test]
    fn payload_carries_temperature_and_relay_markers() {
        let json: serde_json::Value = serde_json::from_slice(&encode(&snapshot()).unwrap()).unwrap();
        assert_eq!(json["temperature"], 75.25);
        assert_eq!(json["heat_duration"], 1.8);
        assert_eq!(json["lights"], 71);
        assert_eq!(json["heat"], 74);
        assert!(json["last_water_ts"].is_null());
        assert_eq!(json["ts"], "2023-11-14T22:13:20Z");
    }

    #[tokio::test]
    async fn sink_exits_when_channel_closes() {
        // Client with an event loop nobody polls: publishes just queue up.
        let opts = MqttOptions::new("test-sink", "127.0.0.1", 1883);
        let (client, _el) = AsyncClient::new(opts, 10);

        let (tx, rx) = broadcast::channel(4);
        tx.send(snapshot()).unwrap();
        drop(tx);

        run_sink(rx, client, metrics_topic("test")).await;
    }
}
