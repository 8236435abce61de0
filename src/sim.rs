// sim.rs
//
// Host-side stand-ins for the hardware collaborators, so the firmware loop
// can be run and poked end-to-end on a development machine. The real
// device wires I2C/ADC drivers, the OLED renderer and an MQTT client into
// the same traits.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use log::*;

use crate::{
    AirQualityReading, BatteryMonitor, BatteryReading, BrokerClient, CacheSnapshot, ClimateReading,
    ClimateSensor, ParticulateSensor, PowerError, PowerSwitch, PublishError, Quantity, Render,
    TimeSource, WallClock,
};

/// Power rail switch that only logs. Stands in for the SSD1306 power
/// commands and the APC1 SET/RESET lines.
pub struct HostPowerSwitch;

impl HostPowerSwitch {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HostPowerSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerSwitch for HostPowerSwitch {
    fn set_display_power(&mut self, on: bool) -> Result<(), PowerError> {
        debug!("display power -> {}", if on { "on" } else { "off" });
        Ok(())
    }

    fn set_sensor_power(&mut self, on: bool) -> Result<(), PowerError> {
        debug!("APC1 power -> {}", if on { "on" } else { "off" });
        Ok(())
    }
}

/// Slowly wandering temperature/humidity.
pub struct SimClimate {
    tick: f32,
}

impl SimClimate {
    pub fn new() -> Self {
        Self { tick: 0.0 }
    }
}

impl Default for SimClimate {
    fn default() -> Self {
        Self::new()
    }
}

impl ClimateSensor for SimClimate {
    async fn measure(&mut self) -> anyhow::Result<ClimateReading> {
        self.tick += 1.0;
        Ok(ClimateReading {
            temperature_c: 21.0 + 2.0 * (self.tick / 20.0).sin(),
            humidity_pct: 45.0 + 8.0 * (self.tick / 33.0).sin(),
        })
    }
}

/// Particulate/gas levels around typical indoor values.
pub struct SimParticulate {
    tick: f32,
}

impl SimParticulate {
    pub fn new() -> Self {
        Self { tick: 0.0 }
    }
}

impl Default for SimParticulate {
    fn default() -> Self {
        Self::new()
    }
}

impl ParticulateSensor for SimParticulate {
    async fn read_all(&mut self) -> anyhow::Result<AirQualityReading> {
        self.tick += 1.0;
        let pm25 = 8.0 + 4.0 * (self.tick / 15.0).sin().abs();
        Ok(AirQualityReading {
            pm1: pm25 * 0.7,
            pm25,
            pm10: pm25 * 1.4,
            tvoc: 120.0 + 60.0 * (self.tick / 25.0).sin().abs(),
            eco2: 480.0 + 150.0 * (self.tick / 40.0).sin().abs(),
            aqi_tvoc: 2.0,
        })
    }
}

/// Battery that drains a little per sample.
pub struct SimBattery {
    voltage: f32,
}

impl SimBattery {
    pub fn new() -> Self {
        Self { voltage: 4.05 }
    }
}

impl Default for SimBattery {
    fn default() -> Self {
        Self::new()
    }
}

impl BatteryMonitor for SimBattery {
    async fn read(&mut self) -> anyhow::Result<BatteryReading> {
        self.voltage = (self.voltage - 0.0002).max(3.2);
        let percent = ((self.voltage - 3.3) / (4.2 - 3.3) * 100.0).clamp(0.0, 100.0);
        Ok(BatteryReading {
            voltage: self.voltage,
            percent,
        })
    }
}

/// Renderer that prints a one-line summary instead of driving pixels.
/// Rate-limited so a 20 FPS refresh does not flood the log.
pub struct LogRenderer {
    last_log: Option<Instant>,
}

impl LogRenderer {
    pub fn new() -> Self {
        Self { last_log: None }
    }
}

impl Default for LogRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Render for LogRenderer {
    fn render(&mut self, snapshot: &CacheSnapshot, clock: &WallClock) -> anyhow::Result<()> {
        let now = Instant::now();
        if let Some(at) = self.last_log {
            if now.duration_since(at) < Duration::from_secs(5) {
                return Ok(());
            }
        }
        self.last_log = Some(now);

        let fmt = |q: Quantity| match snapshot.value(q) {
            Some(v) => format!("{v:.1}"),
            None => "-".into(),
        };
        info!(
            "[{}] T={} RH={} PM2.5={} AQI={} Batt={}%",
            clock.now_local(),
            fmt(Quantity::Temperature),
            fmt(Quantity::Humidity),
            fmt(Quantity::Pm25),
            fmt(Quantity::AqiPm25),
            fmt(Quantity::BatteryPercent),
        );
        Ok(())
    }
}

/// Wall clock source backed by the host's system clock.
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    async fn fetch_epoch(&mut self) -> anyhow::Result<i64> {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock before epoch")?;
        Ok(epoch.as_secs() as i64)
    }
}

/// Broker client that logs instead of speaking MQTT.
pub struct LogBroker;

impl LogBroker {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerClient for LogBroker {
    async fn connect(&mut self) -> Result<(), PublishError> {
        info!("LogBroker connected");
        Ok(())
    }

    async fn publish(&mut self, datastream: &str, value: f32) -> Result<(), PublishError> {
        debug!("LogBroker publish ds/{datastream} = {value}");
        Ok(())
    }

    async fn disconnect(&mut self) {
        info!("LogBroker disconnected");
    }
}

// EOF
