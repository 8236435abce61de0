// display.rs

use std::sync::Arc;
use std::time::Duration;

use log::*;

use crate::{CacheSnapshot, MyState, WallClock};

/// Screen renderer. The pixel/font pipeline lives behind this seam; the
/// task only hands it a consistent cache snapshot per frame.
pub trait Render {
    fn render(&mut self, snapshot: &CacheSnapshot, clock: &WallClock) -> anyhow::Result<()>;
}

/// Periodic display refresh from cached sensor data. Frames are skipped
/// while the display is powered down.
pub async fn display_task<R: Render>(state: Arc<MyState>, mut renderer: R) -> anyhow::Result<()> {
    let fps = state.config.display.fps.max(1);
    let interval = Duration::from_millis(1000 / u64::from(fps));
    info!("Display task started ({fps} FPS)");

    loop {
        if state.power.display_on() {
            let snapshot = state.cache.snapshot();
            if let Err(e) = renderer.render(&snapshot, &state.wall_clock) {
                warn!("Display error: {e:#}");
            }
        }
        if state.stop.sleep_or_stop(interval).await {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HostPowerSwitch, MyConfig};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingRenderer(Arc<AtomicU32>);

    impl Render for CountingRenderer {
        fn render(&mut self, _snapshot: &CacheSnapshot, _clock: &WallClock) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn frames_stop_while_display_sleeps() {
        let mut config = MyConfig::default();
        config.display.fps = 10;
        // sleep the display on the first evaluation
        config.power.display_sleep_s = 1;
        let state = Arc::new(MyState::new(config, Box::new(HostPowerSwitch::new())));

        let frames = Arc::new(AtomicU32::new(0));
        let task = tokio::spawn(display_task(state.clone(), CountingRenderer(frames.clone())));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let while_on = frames.load(Ordering::Relaxed);
        assert!(while_on > 0);

        state
            .power
            .evaluate(std::time::Instant::now() + Duration::from_secs(5), false);
        assert!(!state.power.display_on());
        let at_sleep = frames.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(frames.load(Ordering::Relaxed), at_sleep);

        state.stop.stop();
        task.await.unwrap().unwrap();
    }
}

// EOF
