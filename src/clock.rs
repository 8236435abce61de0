// clock.rs

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::DateTime;
use log::*;

use crate::MyState;

const SYNC_RETRIES: u32 = 3;
const SYNC_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Source of wall-clock time, e.g. an NTP exchange. The wire protocol is
/// not this crate's business.
pub trait TimeSource {
    async fn fetch_epoch(&mut self) -> anyhow::Result<i64>;
}

struct WallInner {
    base_instant: Instant,
    base_epoch: i64,
    synced: bool,
    last_sync: Option<Instant>,
}

/// Mapping from the monotonic clock to epoch seconds.
///
/// Until the first sync the epoch base is zero, so converted timestamps
/// degrade to seconds-since-boot instead of being wrong by decades.
/// Monotonic timestamps stored elsewhere (the sensor cache) are unaffected
/// by resyncs; only their epoch rendering shifts.
pub struct WallClock {
    inner: RwLock<WallInner>,
    tz_offset_secs: i64,
}

impl WallClock {
    pub fn new(timezone_offset_hours: f32) -> Self {
        Self {
            inner: RwLock::new(WallInner {
                base_instant: Instant::now(),
                base_epoch: 0,
                synced: false,
                last_sync: None,
            }),
            tz_offset_secs: (timezone_offset_hours * 3600.0) as i64,
        }
    }

    /// Anchor the epoch mapping: at monotonic `now` the wall time was
    /// `epoch` seconds.
    pub fn set_epoch(&self, now: Instant, epoch: i64) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.base_instant = now;
        inner.base_epoch = epoch;
        inner.synced = true;
        inner.last_sync = Some(now);
    }

    pub fn to_epoch(&self, t: Instant) -> i64 {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if t >= inner.base_instant {
            inner.base_epoch + t.duration_since(inner.base_instant).as_secs() as i64
        } else {
            inner.base_epoch - inner.base_instant.duration_since(t).as_secs() as i64
        }
    }

    pub fn now_epoch(&self) -> i64 {
        self.to_epoch(Instant::now())
    }

    pub fn is_synced(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .synced
    }

    pub fn needs_resync(&self, now: Instant, interval: Duration) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        match inner.last_sync {
            Some(at) => now.duration_since(at) > interval,
            None => true,
        }
    }

    /// Local time string like "Mon 2024-11-03 17:24:13", for display and
    /// the system info endpoint.
    pub fn now_local(&self) -> String {
        match DateTime::from_timestamp(self.now_epoch() + self.tz_offset_secs, 0) {
            Some(dt) => dt.format("%a %Y-%m-%d %H:%M:%S").to_string(),
            None => "-".into(),
        }
    }
}

/// Periodic wall-clock resynchronization.
pub async fn clock_sync_task<T: TimeSource>(
    state: Arc<MyState>,
    mut source: T,
) -> anyhow::Result<()> {
    let cfg = &state.config.clock;
    if !cfg.enabled {
        info!("Clock sync is disabled.");
        state.stop.wait().await;
        return Ok(());
    }

    let interval = Duration::from_secs(cfg.sync_interval_s.max(60));
    info!("Clock sync task started (interval: {}s)", interval.as_secs());

    sync_with_retries(&state, &mut source).await;

    loop {
        if state.stop.sleep_or_stop(interval).await {
            return Ok(());
        }
        if state.wall_clock.needs_resync(Instant::now(), interval) {
            sync_with_retries(&state, &mut source).await;
        }
    }
}

async fn sync_with_retries<T: TimeSource>(state: &MyState, source: &mut T) {
    for attempt in 1..=SYNC_RETRIES {
        match source.fetch_epoch().await {
            Ok(epoch) => {
                state.wall_clock.set_epoch(Instant::now(), epoch);
                info!("Clock synced: {}", state.wall_clock.now_local());
                return;
            }
            Err(e) => warn!("Clock sync attempt {attempt}/{SYNC_RETRIES} failed: {e:#}"),
        }
        if attempt < SYNC_RETRIES && state.stop.sleep_or_stop(SYNC_RETRY_DELAY).await {
            return;
        }
    }
    warn!("Clock sync failed after {SYNC_RETRIES} attempts");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsynced_clock_counts_from_boot() {
        let t0 = Instant::now();
        let clock = WallClock::new(0.0);
        assert!(!clock.is_synced());
        // within the same test the mapping stays near zero
        assert!(clock.to_epoch(t0 + Duration::from_secs(42)) <= 43);
    }

    #[test]
    fn epoch_mapping_follows_the_anchor() {
        let clock = WallClock::new(0.0);
        let now = Instant::now();
        clock.set_epoch(now, 1_700_000_000);

        assert!(clock.is_synced());
        assert_eq!(clock.to_epoch(now + Duration::from_secs(30)), 1_700_000_030);
        assert_eq!(clock.to_epoch(now - Duration::from_secs(10)), 1_699_999_990);
    }

    #[test]
    fn resync_due_only_after_interval() {
        let clock = WallClock::new(0.0);
        let now = Instant::now();
        let interval = Duration::from_secs(3600);

        assert!(clock.needs_resync(now, interval));
        clock.set_epoch(now, 1_700_000_000);
        assert!(!clock.needs_resync(now + interval, interval));
        assert!(clock.needs_resync(now + interval + Duration::from_secs(1), interval));
    }

    #[test]
    fn timezone_offset_shifts_rendering() {
        let clock = WallClock::new(2.0);
        clock.set_epoch(Instant::now(), 1_700_000_000);
        // 2023-11-14 22:13:20 UTC + 2h
        assert!(clock.now_local().contains("2023-11-15"));
    }
}

// EOF
