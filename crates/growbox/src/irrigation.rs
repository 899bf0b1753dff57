//! Restart-safe irrigation.
//!
//! The time to the next watering is always computed from the persisted
//! last-watered timestamp, never from process start, so a restart neither
//! resets the interval nor waters twice.
//!
//! ```text
//! wait ms_to_next_watering ──▶ water ON ──[water_duration s]──▶ water OFF
//!      ▲                                                          │
//!      └── re-derive stage, persist last_water_ts ◀───────────────┘
//! ```
//!
//! Manual "water for N seconds" requests are separate pulses and never touch
//! this cycle's timer or its timestamp.

use chrono::{DateTime, Local, Utc};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use crate::config::MAX_WATER_SECS;
use crate::db::Db;
use crate::relay::{Channel, SharedRelays};
use crate::stage;
use crate::state::SharedState;

/// Lower bound for the wait before a watering, in milliseconds. Covers
/// overdue schedules and clock skew without re-trigger storms.
pub const MIN_WATER_DELAY_MS: u64 = 5000;

const HOURS_TO_MS: f64 = 60.0 * 60.0 * 1000.0;

/// Milliseconds until the next watering is due.
pub fn ms_to_next_watering(
    last_water_ts: DateTime<Utc>,
    water_interval_hours: f64,
    now: DateTime<Utc>,
) -> u64 {
    let elapsed_ms = (now - last_water_ts).num_milliseconds() as f64;
    let remaining = water_interval_hours * HOURS_TO_MS - elapsed_ms;
    if remaining < MIN_WATER_DELAY_MS as f64 {
        MIN_WATER_DELAY_MS
    } else {
        remaining as u64
    }
}

/// How long the valve stays open for a requested pulse. Capped at
/// [`MAX_WATER_SECS`]; negative or NaN requests open it for no time at all.
pub fn pulse_duration(seconds: f64) -> Duration {
    if seconds > 0.0 {
        Duration::try_from_secs_f64(seconds.min(MAX_WATER_SECS)).unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    }
}

/// Run the water relay for `seconds`, then switch it off.
pub async fn pulse(shared: &SharedState, relays: &SharedRelays, seconds: f64, reason: &str) {
    let open_for = pulse_duration(seconds);

    let metric = relays.lock().await.set(Channel::Water, true);
    {
        let mut st = shared.write().await;
        st.record_relay(Channel::Water, true, metric);
        st.record_water(format!("{reason} watering started for {seconds}s"));
    }

    sleep(open_for).await;

    let metric = relays.lock().await.set(Channel::Water, false);
    shared
        .write()
        .await
        .record_relay(Channel::Water, false, metric);
}

/// Out-of-band "water for N seconds" request. Spawned so the caller never
/// waits for the pulse to finish.
pub fn manual_water(shared: SharedState, relays: SharedRelays, seconds: f64) {
    info!(seconds, "manual watering requested");
    tokio::spawn(async move {
        pulse(&shared, &relays, seconds, "manual").await;
        info!(seconds, "manual watering done");
    });
}

pub struct IrrigationScheduler {
    shared: SharedState,
    relays: SharedRelays,
    db: Option<Db>,
}

impl IrrigationScheduler {
    pub fn new(shared: SharedState, relays: SharedRelays, db: Option<Db>) -> Self {
        Self { shared, relays, db }
    }

    /// Wait before the next watering. Without any watering on record the
    /// full interval runs from now.
    pub async fn next_delay(&self, now: DateTime<Utc>) -> Duration {
        let st = self.shared.read().await;
        let last = st.last_water_ts.unwrap_or(now);
        Duration::from_millis(ms_to_next_watering(last, st.water_interval, now))
    }

    /// One watering event: pulse, record, persist, re-derive the stage.
    pub async fn water(&self) {
        let seconds = self.shared.read().await.water_duration;
        info!(seconds, "watering the plants");

        pulse(&self.shared, &self.relays, seconds, "scheduled").await;

        let now = Utc::now();
        let (duration, interval) = {
            let mut st = self.shared.write().await;
            st.last_water_ts = Some(now);
            st.last_water_secs = seconds;

            let (duration, interval) = stage::water_plan(&st.settings, Local::now().date_naive());
            st.water_duration = duration;
            st.water_interval = interval;
            st.record_water(format!(
                "watered {seconds}s; next {duration}s every {interval}h"
            ));
            (duration, interval)
        };
        info!(water_duration = duration, water_interval = interval, "watering done");

        if let Some(db) = &self.db {
            if let Err(e) = db.save_water_state(now, seconds).await {
                error!("failed to persist last watering: {e:#}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("persist last watering failed: {e}"));
            }
        }
    }

    /// Self-rescheduling loop. Intended to be `tokio::spawn`-ed by the supervisor.
    pub async fn run(self, initial_delay: Duration) {
        sleep(initial_delay).await;
        loop {
            let delay = self.next_delay(Utc::now()).await;
            info!(delay_ms = delay.as_millis() as u64, "next watering scheduled");
            sleep(delay).await;
            self.water().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::relay::{self, tests::all_channels, RelayBoard};
    use crate::stage::Stage;
    use crate::state::ConfigState;
    use chrono::Duration as ChronoDuration;

    const HOUR_MS: u64 = 3_600_000;

    fn setup(water_duration: f64, db: Option<Db>) -> (IrrigationScheduler, SharedState, SharedRelays) {
        let shared = ConfigState::new(Config::default(), (water_duration, 4.0)).shared();
        let relays = relay::shared(RelayBoard::new(&all_channels(), true));
        (
            IrrigationScheduler::new(shared.clone(), relays.clone(), db),
            shared,
            relays,
        )
    }

    async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    // -- ms_to_next_watering -------------------------------------------------

    #[test]
    fn restart_waits_only_the_remaining_time() {
        let now = Utc::now();
        let ms = ms_to_next_watering(now - ChronoDuration::hours(3), 4.0, now);
        assert_eq!(ms, HOUR_MS);
    }

    #[test]
    fn overdue_watering_uses_floor() {
        let now = Utc::now();
        let ms = ms_to_next_watering(now - ChronoDuration::hours(10), 4.0, now);
        assert_eq!(ms, MIN_WATER_DELAY_MS);
    }

    #[test]
    fn just_under_floor_is_raised_to_floor() {
        let now = Utc::now();
        let last = now - ChronoDuration::milliseconds(4 * HOUR_MS as i64 - 1000);
        assert_eq!(ms_to_next_watering(last, 4.0, now), MIN_WATER_DELAY_MS);
    }

    #[test]
    fn future_timestamp_waits_longer_than_interval() {
        let now = Utc::now();
        let ms = ms_to_next_watering(now + ChronoDuration::minutes(30), 1.0, now);
        assert_eq!(ms, HOUR_MS + HOUR_MS / 2);
    }

    #[test]
    fn pulse_duration_never_panics() {
        assert_eq!(pulse_duration(2.5), Duration::from_millis(2500));
        assert_eq!(pulse_duration(f64::INFINITY), Duration::from_secs(3600));
        assert_eq!(pulse_duration(1e300), Duration::from_secs(3600));
        assert_eq!(pulse_duration(-1.0), Duration::ZERO);
        assert_eq!(pulse_duration(f64::NAN), Duration::ZERO);
    }

    // -- Scheduler -----------------------------------------------------------

    #[tokio::test]
    async fn no_history_waits_full_interval() {
        let (sched, _shared, _relays) = setup(4.0, None);
        assert_eq!(
            sched.next_delay(Utc::now()).await,
            Duration::from_millis(4 * HOUR_MS)
        );
    }

    #[tokio::test]
    async fn persisted_timestamp_drives_next_delay() {
        let (sched, shared, _relays) = setup(4.0, None);
        let now = Utc::now();
        shared.write().await.last_water_ts = Some(now - ChronoDuration::hours(3));

        assert_eq!(sched.next_delay(now).await, Duration::from_millis(HOUR_MS));
    }

    #[tokio::test]
    async fn water_event_records_and_turns_relay_off() {
        let (sched, shared, relays) = setup(0.02, None);
        let before = Utc::now();

        sched.water().await;

        let st = shared.read().await;
        assert!(st.last_water_ts.unwrap() >= before);
        assert_eq!(st.last_water_secs, 0.02);
        assert!(!relays.lock().await.is_on(Channel::Water));
        assert!(st.events.iter().any(|e| e.detail == "water set ON"));
        assert_eq!(st.events.back().unwrap().detail, "watered 0.02s; next 4s every 12h");
    }

    #[tokio::test]
    async fn water_event_rederives_stage() {
        let (sched, shared, _relays) = setup(0.01, None);
        {
            let mut st = shared.write().await;
            st.settings.grow.planting_date =
                Some(Local::now().date_naive() - ChronoDuration::days(40));
            st.settings.grow.stages = vec![
                Stage { day_threshold: 0, water_duration: 0.01, water_interval: 12.0 },
                Stage { day_threshold: 21, water_duration: 9.0, water_interval: 6.0 },
            ];
        }

        sched.water().await;

        let st = shared.read().await;
        assert_eq!(st.water_duration, 9.0);
        assert_eq!(st.water_interval, 6.0);
        assert_eq!(st.last_water_secs, 0.01);
        drop(st);

        // next wait uses the freshly derived interval
        let delay = sched.next_delay(Utc::now()).await;
        assert!(delay <= Duration::from_millis(6 * HOUR_MS));
        assert!(delay > Duration::from_millis(6 * HOUR_MS - 60_000));
    }

    #[tokio::test]
    async fn water_event_persists_last_watering() {
        let db = memory_db().await;
        let (sched, shared, _relays) = setup(0.01, Some(db.clone()));

        sched.water().await;

        let (ts, secs) = db.load_water_state().await.unwrap().unwrap();
        let recorded = shared.read().await.last_water_ts.unwrap();
        assert_eq!(ts.timestamp_millis(), recorded.timestamp_millis());
        assert_eq!(secs, 0.01);
    }

    #[tokio::test]
    async fn unusable_pulse_length_still_turns_water_off() {
        let (_sched, shared, relays) = setup(4.0, None);

        pulse(&shared, &relays, f64::NAN, "manual").await;

        assert!(!relays.lock().await.is_on(Channel::Water));
        assert_eq!(
            shared.read().await.relay_metrics[Channel::Water.index()],
            crate::relay::METRIC_OFF
        );
    }

    #[tokio::test]
    async fn manual_pulse_leaves_schedule_alone() {
        let (_sched, shared, relays) = setup(4.0, None);

        pulse(&shared, &relays, 0.01, "manual").await;

        let st = shared.read().await;
        assert!(st.last_water_ts.is_none());
        assert_eq!(st.last_water_secs, 0.0);
        assert!(!relays.lock().await.is_on(Channel::Water));
        assert!(st
            .events
            .iter()
            .any(|e| e.detail == "manual watering started for 0.01s"));
    }
}
