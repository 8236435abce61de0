// power.rs

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::*;
use serde::Serialize;
use thiserror::Error;

use crate::{MyState, OperatingMode, PowerConfig};

#[derive(Debug, Error)]
pub enum PowerError {
    #[error("hardware power toggle failed: {0}")]
    HardwarePowerToggleFailed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeSource {
    Physical,
    Web,
}

/// Hardware power rails the controller drives. The display driver and the
/// APC1 SET/RESET lines live behind this seam.
pub trait PowerSwitch: Send {
    fn set_display_power(&mut self, on: bool) -> Result<(), PowerError>;
    fn set_sensor_power(&mut self, on: bool) -> Result<(), PowerError>;
}

/// Named power state, derived from the two rails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Active,
    DisplayAsleep,
    /// Display and APC1 both off; only reachable in mobile mode.
    SensorAsleep,
}

struct PowerInner {
    display_on: bool,
    sensor_powered: bool,
    last_physical_activity: Instant,
    switch: Box<dyn PowerSwitch>,
}

/// Decides display/APC1 power from idle time, operating mode and web
/// session activity.
///
/// Transitions are evaluated on a fixed poll, never on events; the poll
/// interval bounds the worst-case sleep/wake latency. Toggle failures are
/// logged and retried on the next poll.
pub struct PowerController {
    inner: Mutex<PowerInner>,
    mode: OperatingMode,
    display_sleep: Duration,
    sensor_sleep: Duration,
}

impl PowerController {
    pub fn new(
        config: &PowerConfig,
        mode: OperatingMode,
        switch: Box<dyn PowerSwitch>,
        now: Instant,
    ) -> Self {
        Self {
            inner: Mutex::new(PowerInner {
                display_on: true,
                sensor_powered: true,
                last_physical_activity: now,
                switch,
            }),
            mode,
            display_sleep: Duration::from_secs(config.display_sleep_s),
            sensor_sleep: Duration::from_secs(config.apc1_sleep_s),
        }
    }

    /// Register activity and restore the active state. Called from the
    /// physical input path and from `POST /api/wake`.
    pub fn wake(&self, source: WakeSource, now: Instant) {
        let mut inner = self.lock();
        inner.last_physical_activity = now;
        let mut changed = false;

        if !inner.display_on {
            match inner.switch.set_display_power(true) {
                Ok(()) => {
                    inner.display_on = true;
                    changed = true;
                }
                Err(e) => warn!("Display wake failed: {e}"),
            }
        }

        // station-mode APC1 power belongs to the duty-cycle task
        if self.mode == OperatingMode::Mobile && !inner.sensor_powered {
            match inner.switch.set_sensor_power(true) {
                Ok(()) => {
                    inner.sensor_powered = true;
                    changed = true;
                }
                Err(e) => warn!("APC1 wake failed: {e}"),
            }
        }

        if changed {
            info!("Wake-up triggered ({source:?})");
        }
    }

    /// One poll of the idle/sleep state machine. `web_active` is whether
    /// the session table currently has live sessions; in mobile mode that
    /// suppresses the APC1 sleep axis entirely.
    pub fn evaluate(&self, now: Instant, web_active: bool) {
        let mut inner = self.lock();
        let idle = now.duration_since(inner.last_physical_activity);
        let effective_idle = if web_active && self.mode == OperatingMode::Mobile {
            Duration::ZERO
        } else {
            idle
        };

        if !self.display_sleep.is_zero() && inner.display_on && idle > self.display_sleep {
            match inner.switch.set_display_power(false) {
                Ok(()) => {
                    inner.display_on = false;
                    info!("Display off");
                }
                Err(e) => warn!("Display sleep failed: {e}"),
            }
        }

        if self.mode != OperatingMode::Mobile || self.sensor_sleep.is_zero() {
            return;
        }
        if inner.sensor_powered && effective_idle > self.sensor_sleep {
            match inner.switch.set_sensor_power(false) {
                Ok(()) => {
                    inner.sensor_powered = false;
                    info!("APC1 sleep");
                }
                Err(e) => warn!("APC1 sleep failed: {e}"),
            }
        } else if !inner.sensor_powered && (web_active || effective_idle <= self.sensor_sleep) {
            match inner.switch.set_sensor_power(true) {
                Ok(()) => {
                    inner.sensor_powered = true;
                    info!("APC1 wake");
                }
                Err(e) => warn!("APC1 wake failed: {e}"),
            }
        }
    }

    /// Direct APC1 rail control for the station-mode duty cycle task.
    pub fn set_sensor_power(&self, on: bool) -> Result<(), PowerError> {
        let mut inner = self.lock();
        if inner.sensor_powered == on {
            return Ok(());
        }
        inner.switch.set_sensor_power(on)?;
        inner.sensor_powered = on;
        Ok(())
    }

    pub fn display_on(&self) -> bool {
        self.lock().display_on
    }

    pub fn sensor_powered(&self) -> bool {
        self.lock().sensor_powered
    }

    pub fn state(&self) -> PowerState {
        let inner = self.lock();
        match (inner.display_on, inner.sensor_powered) {
            (true, _) => PowerState::Active,
            (false, true) => PowerState::DisplayAsleep,
            (false, false) => PowerState::SensorAsleep,
        }
    }

    pub fn idle_time(&self, now: Instant) -> Duration {
        now.duration_since(self.lock().last_physical_activity)
    }

    fn lock(&self) -> MutexGuard<'_, PowerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Periodic power management loop.
pub async fn power_task(state: std::sync::Arc<MyState>) -> anyhow::Result<()> {
    let poll = Duration::from_secs(state.config.power.poll_interval_s.max(1));
    info!(
        "Power mgmt started (display: {}s, apc1: {}s)",
        state.config.power.display_sleep_s, state.config.power.apc1_sleep_s
    );

    loop {
        let now = Instant::now();
        let web_active = state.sessions.has_active_sessions(now);
        state.power.evaluate(now, web_active);

        if state.stop.sleep_or_stop(poll).await {
            return Ok(());
        }
    }
}


// EOF
