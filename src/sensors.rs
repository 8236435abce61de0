// sensors.rs

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::*;

use crate::{CacheWriter, MyState, OperatingMode, Quantity};

#[derive(Clone, Copy, Debug)]
pub struct ClimateReading {
    pub temperature_c: f32,
    pub humidity_pct: f32,
}

/// Full APC1 register read.
#[derive(Clone, Copy, Debug, Default)]
pub struct AirQualityReading {
    pub pm1: f32,
    pub pm25: f32,
    pub pm10: f32,
    pub tvoc: f32,
    pub eco2: f32,
    pub aqi_tvoc: f32,
}

#[derive(Clone, Copy, Debug)]
pub struct BatteryReading {
    pub voltage: f32,
    pub percent: f32,
}

/// SHTC3 temperature/humidity sensor behind its I2C driver.
pub trait ClimateSensor {
    async fn measure(&mut self) -> anyhow::Result<ClimateReading>;
}

/// APC1 particulate/gas sensor behind its I2C driver.
pub trait ParticulateSensor {
    async fn read_all(&mut self) -> anyhow::Result<AirQualityReading>;
}

/// Battery voltage divider behind the ADC.
pub trait BatteryMonitor {
    async fn read(&mut self) -> anyhow::Result<BatteryReading>;
}

/// US EPA AQI from a PM2.5 concentration in µg/m³, by breakpoint-based
/// linear interpolation. Clamps to 500.
pub fn compute_aqi_pm25(pm25: f32) -> f32 {
    if pm25 <= 12.0 {
        50.0 * pm25 / 12.0
    } else if pm25 <= 35.4 {
        50.0 + (pm25 - 12.1) * (100.0 - 51.0) / (35.4 - 12.1)
    } else if pm25 <= 55.4 {
        101.0 + (pm25 - 35.5) * (150.0 - 101.0) / (55.4 - 35.5)
    } else if pm25 <= 150.4 {
        151.0 + (pm25 - 55.5) * (200.0 - 151.0) / (150.4 - 55.5)
    } else if pm25 <= 250.4 {
        201.0 + (pm25 - 150.5) * (300.0 - 201.0) / (250.4 - 150.5)
    } else if pm25 <= 350.4 {
        301.0 + (pm25 - 250.5) * (400.0 - 301.0) / (350.4 - 250.5)
    } else if pm25 <= 500.4 {
        401.0 + (pm25 - 350.5) * (500.0 - 401.0) / (500.4 - 350.5)
    } else {
        500.0
    }
}

fn take_writer(state: &MyState, q: Quantity) -> anyhow::Result<CacheWriter> {
    state
        .cache
        .clone()
        .take_writer(q)
        .with_context(|| format!("cache writer for {q:?} already taken"))
}

/// Periodic SHTC3 sampling into the cache.
pub async fn read_climate_task<S: ClimateSensor>(
    state: Arc<MyState>,
    mut sensor: S,
) -> anyhow::Result<()> {
    let interval = Duration::from_secs(state.config.sensors.shtc3_interval_s.max(1));
    let temp = take_writer(&state, Quantity::Temperature)?;
    let humidity = take_writer(&state, Quantity::Humidity)?;
    info!("SHTC3 task started (interval: {}s)", interval.as_secs());

    loop {
        match sensor.measure().await {
            Ok(r) => {
                let now = Instant::now();
                temp.write(r.temperature_c, now);
                humidity.write(r.humidity_pct, now);
                debug!("SHTC3: {:.1}°C, {:.1}%", r.temperature_c, r.humidity_pct);
            }
            // keep the last good reading; staleness shows up in timestamps
            Err(e) => warn!("SHTC3 read error: {e:#}"),
        }
        if state.stop.sleep_or_stop(interval).await {
            return Ok(());
        }
    }
}

struct ParticulateWriters {
    pm1: CacheWriter,
    pm25: CacheWriter,
    pm10: CacheWriter,
    tvoc: CacheWriter,
    eco2: CacheWriter,
    aqi_pm25: CacheWriter,
    aqi_tvoc: CacheWriter,
}

impl ParticulateWriters {
    fn take(state: &MyState) -> anyhow::Result<Self> {
        Ok(Self {
            pm1: take_writer(state, Quantity::Pm1)?,
            pm25: take_writer(state, Quantity::Pm25)?,
            pm10: take_writer(state, Quantity::Pm10)?,
            tvoc: take_writer(state, Quantity::Tvoc)?,
            eco2: take_writer(state, Quantity::Eco2)?,
            aqi_pm25: take_writer(state, Quantity::AqiPm25)?,
            aqi_tvoc: take_writer(state, Quantity::AqiTvoc)?,
        })
    }

    fn store(&self, r: &AirQualityReading, now: Instant) {
        self.pm1.write(r.pm1, now);
        self.pm25.write(r.pm25, now);
        self.pm10.write(r.pm10, now);
        self.tvoc.write(r.tvoc, now);
        self.eco2.write(r.eco2, now);
        self.aqi_pm25.write(compute_aqi_pm25(r.pm25), now);
        self.aqi_tvoc.write(r.aqi_tvoc, now);
    }
}

/// APC1 sampling task: mobile mode polls on a fixed interval, station mode
/// duty-cycles the sensor power to save the battery.
pub async fn run_particulate<S: ParticulateSensor>(
    state: Arc<MyState>,
    sensor: S,
) -> anyhow::Result<()> {
    match state.config.mode {
        OperatingMode::Mobile => read_particulate_task(state, sensor).await,
        OperatingMode::Station => station_cycle_task(state, sensor).await,
    }
}

async fn read_particulate_task<S: ParticulateSensor>(
    state: Arc<MyState>,
    mut sensor: S,
) -> anyhow::Result<()> {
    let interval = Duration::from_secs(state.config.sensors.apc1_interval_s.max(1));
    let writers = ParticulateWriters::take(&state)?;
    info!("APC1 task started (interval: {}s)", interval.as_secs());

    loop {
        // unpowered sensor: keep the cache as-is and wait for a wake
        if state.power.sensor_powered() {
            match sensor.read_all().await {
                Ok(r) => {
                    writers.store(&r, Instant::now());
                    debug!("APC1: PM2.5={:.0} µg/m³", r.pm25);
                }
                Err(e) => warn!("APC1 read error: {e:#}"),
            }
        }
        if state.stop.sleep_or_stop(interval).await {
            return Ok(());
        }
    }
}

/// Station mode: the APC1 is normally off; each cycle powers it up, waits
/// out the warmup, takes one reading and powers it back down.
async fn station_cycle_task<S: ParticulateSensor>(
    state: Arc<MyState>,
    mut sensor: S,
) -> anyhow::Result<()> {
    let cfg = &state.config.station;
    let cycle = Duration::from_secs(cfg.cycle_period_s.max(1));
    let warmup = Duration::from_secs(cfg.warmup_s);
    let read_delay = Duration::from_millis(cfg.read_delay_ms);
    let writers = ParticulateWriters::take(&state)?;
    info!(
        "APC1 station cycle started (period: {}s, warmup: {}s)",
        cycle.as_secs(),
        warmup.as_secs()
    );

    if let Err(e) = state.power.set_sensor_power(false) {
        warn!("APC1 initial power-down failed: {e}");
    }

    loop {
        if state.stop.sleep_or_stop(cycle).await {
            return Ok(());
        }

        if let Err(e) = state.power.set_sensor_power(true) {
            warn!("APC1 power-up failed: {e}, skipping cycle");
            continue;
        }
        if state.stop.sleep_or_stop(warmup).await {
            return Ok(());
        }

        match sensor.read_all().await {
            Ok(r) => {
                writers.store(&r, Instant::now());
                info!("APC1 cycle: PM2.5={:.0}, PM10={:.0} µg/m³", r.pm25, r.pm10);
            }
            Err(e) => warn!("APC1 cycle read error: {e:#}"),
        }

        if state.stop.sleep_or_stop(read_delay).await {
            return Ok(());
        }
        if let Err(e) = state.power.set_sensor_power(false) {
            warn!("APC1 power-down failed: {e}");
        }
    }
}

/// Periodic battery sampling into the cache.
pub async fn read_battery_task<B: BatteryMonitor>(
    state: Arc<MyState>,
    mut monitor: B,
) -> anyhow::Result<()> {
    let interval = Duration::from_secs(state.config.sensors.battery_interval_s.max(1));
    let voltage = take_writer(&state, Quantity::BatteryVoltage)?;
    let percent = take_writer(&state, Quantity::BatteryPercent)?;
    info!("Battery task started (interval: {}s)", interval.as_secs());

    loop {
        match monitor.read().await {
            Ok(r) => {
                let now = Instant::now();
                voltage.write(r.voltage, now);
                percent.write(r.percent, now);
                debug!("Battery: {:.2}V ({:.0}%)", r.voltage, r.percent);
            }
            Err(e) => warn!("Battery read error: {e:#}"),
        }
        if state.stop.sleep_or_stop(interval).await {
            return Ok(());
        }
    }
}


// EOF
