// state.rs

use std::sync::{Arc, atomic::AtomicU64};
use std::time::{Duration, Instant};

use crate::{
    MyConfig, PowerController, PowerSwitch, PublisherStatus, SessionTable, SharedCache, StopFlag,
    WallClock,
};

/// Everything the tasks share, built once at startup and handed to each
/// task as `Arc<MyState>`. No task-visible state lives in statics.
pub struct MyState {
    pub config: MyConfig,
    pub cache: Arc<SharedCache>,
    pub sessions: SessionTable,
    pub power: PowerController,
    pub wall_clock: WallClock,
    pub stop: StopFlag,
    pub api_cnt: AtomicU64,
    pub started_at: Instant,
    pub publisher: PublisherStatus,
}

impl MyState {
    pub fn new(config: MyConfig, switch: Box<dyn PowerSwitch>) -> Self {
        let now = Instant::now();
        MyState {
            cache: Arc::new(SharedCache::new()),
            sessions: SessionTable::new(
                Duration::from_secs(config.web.session_timeout_s),
                config.web.max_connections,
            ),
            power: PowerController::new(&config.power, config.mode, switch, now),
            wall_clock: WallClock::new(config.clock.timezone_offset_hours),
            stop: StopFlag::new(),
            api_cnt: AtomicU64::new(0),
            started_at: now,
            publisher: PublisherStatus::new(),
            config,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

// EOF
