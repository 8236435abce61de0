// publisher.rs

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::*;
use serde::Serialize;
use thiserror::Error;

use crate::MyState;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker connection failed: {0}")]
    ConnectionFailed(String),
    #[error("publish failed: {0}")]
    PublishFailed(String),
}

/// Cloud broker connection. Implementations own the wire protocol (MQTT,
/// TLS, auth); the publisher task only drives connect/publish/disconnect.
pub trait BrokerClient {
    async fn connect(&mut self) -> Result<(), PublishError>;
    async fn publish(&mut self, datastream: &str, value: f32) -> Result<(), PublishError>;
    async fn disconnect(&mut self);
}

/// Exponential backoff between connection attempts. The delay doubles per
/// failure up to the ceiling and snaps back to the base on success.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(base);
        Self {
            base,
            ceiling,
            current: base,
            attempts: 0,
        }
    }

    /// Delay to wait before the attempt that just failed is retried.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempts += 1;
        self.current = (self.current * 2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherState {
    Disconnected,
    Connecting,
    RetryWait,
    Connected,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct PublisherReport {
    pub state: PublisherState,
    pub publish_count: u64,
    pub error_count: u64,
    pub last_publish: Option<i64>,
}

/// Connection state and counters, shared with the system info endpoint.
pub struct PublisherStatus {
    inner: Mutex<PublisherReport>,
}

impl PublisherStatus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PublisherReport {
                state: PublisherState::Disconnected,
                publish_count: 0,
                error_count: 0,
                last_publish: None,
            }),
        }
    }

    fn set_state(&self, state: PublisherState) {
        self.lock().state = state;
    }

    fn record_publish(&self, epoch: i64) {
        let mut inner = self.lock();
        inner.publish_count += 1;
        inner.last_publish = Some(epoch);
    }

    fn record_error(&self) {
        self.lock().error_count += 1;
    }

    pub fn report(&self) -> PublisherReport {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PublisherReport> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PublisherStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloud publishing loop: connect with exponential backoff, then push the
/// configured datastreams from the cache every publish interval. A publish
/// failure drops back to the reconnect path; nothing here ever takes the
/// rest of the system down with it.
pub async fn run_publisher<C: BrokerClient>(
    state: Arc<MyState>,
    mut client: C,
) -> anyhow::Result<()> {
    let cfg = &state.config.publisher;
    if !cfg.enabled {
        info!("Cloud publishing is disabled.");
        state.stop.wait().await;
        return Ok(());
    }

    let interval = Duration::from_secs(cfg.publish_interval_s.max(1));
    let mut backoff = Backoff::new(
        Duration::from_secs(cfg.backoff_base_s.max(1)),
        Duration::from_secs(cfg.backoff_ceiling_s),
    );
    info!(
        "Publisher task started ({} -> {} streams, interval: {}s)",
        cfg.broker_url,
        cfg.datastreams.len(),
        interval.as_secs()
    );

    loop {
        if state.stop.is_stopped() {
            return Ok(());
        }

        info!("Broker connecting...");
        state.publisher.set_state(PublisherState::Connecting);
        match client.connect().await {
            Ok(()) => {
                info!("Broker connected.");
                backoff.reset();
                state.publisher.set_state(PublisherState::Connected);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                state.publisher.record_error();
                state.publisher.set_state(PublisherState::RetryWait);
                warn!(
                    "Broker connection failed (attempt {}): {e}, retrying in {}s",
                    backoff.attempts(),
                    delay.as_secs()
                );
                if state.stop.sleep_or_stop(delay).await {
                    return Ok(());
                }
                continue;
            }
        }

        // connected: periodic publishing until a failure or shutdown
        loop {
            if state.stop.sleep_or_stop(interval).await {
                client.disconnect().await;
                return Ok(());
            }

            let snapshot = state.cache.snapshot();
            let mut sent = 0usize;
            let mut failed = false;
            for &q in &cfg.datastreams {
                let Some(value) = snapshot.value(q) else {
                    continue;
                };
                match client.publish(q.datastream(), value).await {
                    Ok(()) => {
                        sent += 1;
                        state.publisher.record_publish(state.wall_clock.now_epoch());
                    }
                    Err(e) => {
                        error!("Publish error ({}): {e}", q.datastream());
                        state.publisher.record_error();
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                state.publisher.set_state(PublisherState::Disconnected);
                client.disconnect().await;
                break;
            }
            if sent > 0 {
                debug!("Published {sent} datastreams");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HostPowerSwitch, MyConfig, MyState, Quantity};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[test]
    fn backoff_ladder_doubles_to_ceiling() {
        let mut b = Backoff::new(Duration::from_secs(5), Duration::from_secs(120));
        let delays: Vec<u64> = (0..6).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 120]);
        // stays clamped no matter how many more failures pile up
        assert_eq!(b.next_delay().as_secs(), 120);
    }

    #[test]
    fn backoff_resets_to_base_on_success() {
        let mut b = Backoff::new(Duration::from_secs(5), Duration::from_secs(120));
        for _ in 0..4 {
            b.next_delay();
        }
        b.reset();
        assert_eq!(b.attempts(), 0);
        assert_eq!(b.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn backoff_ceiling_never_below_base() {
        let mut b = Backoff::new(Duration::from_secs(30), Duration::from_secs(10));
        assert_eq!(b.next_delay(), Duration::from_secs(30));
        assert_eq!(b.next_delay(), Duration::from_secs(30));
    }

    struct ScriptedBroker {
        connect_failures: Arc<AtomicU32>,
        published: Arc<Mutex<Vec<(String, f32)>>>,
    }

    impl BrokerClient for ScriptedBroker {
        async fn connect(&mut self) -> Result<(), PublishError> {
            if self.connect_failures.load(Ordering::Relaxed) > 0 {
                self.connect_failures.fetch_sub(1, Ordering::Relaxed);
                return Err(PublishError::ConnectionFailed("refused".into()));
            }
            Ok(())
        }

        async fn publish(&mut self, datastream: &str, value: f32) -> Result<(), PublishError> {
            self.published
                .lock()
                .unwrap()
                .push((datastream.to_string(), value));
            Ok(())
        }

        async fn disconnect(&mut self) {}
    }

    fn test_state() -> Arc<MyState> {
        let mut config = MyConfig::default();
        config.publisher.enabled = true;
        config.publisher.publish_interval_s = 1;
        config.publisher.backoff_base_s = 1;
        config.publisher.backoff_ceiling_s = 4;
        Arc::new(MyState::new(config, Box::new(HostPowerSwitch::new())))
    }

    #[tokio::test(start_paused = true)]
    async fn publisher_retries_then_publishes_cache_values() {
        let state = test_state();
        let t = Instant::now();
        state
            .cache
            .clone()
            .take_writer(Quantity::Temperature)
            .unwrap()
            .write(21.5, t);
        state
            .cache
            .clone()
            .take_writer(Quantity::Pm25)
            .unwrap()
            .write(8.0, t);

        let failures = Arc::new(AtomicU32::new(2));
        let published = Arc::new(Mutex::new(Vec::new()));
        let broker = ScriptedBroker {
            connect_failures: failures.clone(),
            published: published.clone(),
        };

        let task = tokio::spawn(run_publisher(state.clone(), broker));

        // two failed attempts (1s + 2s backoff), connect, then one interval
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(failures.load(Ordering::Relaxed), 0);
        assert_eq!(state.publisher.report().state, PublisherState::Connected);
        {
            let seen = published.lock().unwrap();
            assert!(seen.contains(&("Temperature".to_string(), 21.5)));
            assert!(seen.contains(&("PM2_5".to_string(), 8.0)));
            // never-sampled streams are skipped, not sent as nulls
            assert!(!seen.iter().any(|(name, _)| name == "TVOC"));
        }

        state.stop.stop();
        task.await.unwrap().unwrap();
        let report = state.publisher.report();
        assert_eq!(report.error_count, 2);
        assert!(report.publish_count >= 2);
    }
}

// EOF
