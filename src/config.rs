// config.rs

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::Quantity;

const DEFAULT_WEB_PORT: u16 = 80;
const DEFAULT_SESSION_TIMEOUT: u64 = 300;
const DEFAULT_REFRESH_INTERVAL: u64 = 20;
const DEFAULT_MAX_CONNECTIONS: usize = 2;
const DEFAULT_RESPONSE_TIMEOUT: u64 = 30;
const DEFAULT_CHUNK_SIZE: usize = 512;

const DEFAULT_DISPLAY_SLEEP: u64 = 30;
const DEFAULT_APC1_SLEEP: u64 = 300;
const DEFAULT_POWER_POLL: u64 = 5;

/// Operating mode, persisted separately from the static settings so the
/// device can flip between them without rewriting its main config.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Carried around: display and sensors follow user activity.
    Mobile,
    /// Parked at a fixed site: the particulate sensor is duty-cycled.
    Station,
}

impl Default for OperatingMode {
    fn default() -> Self {
        OperatingMode::Mobile
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub port: u16,
    pub session_timeout_s: u64,
    pub refresh_interval_s: u64,
    pub max_connections: usize,
    pub response_timeout_s: u64,
    pub chunk_size: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_WEB_PORT,
            session_timeout_s: DEFAULT_SESSION_TIMEOUT,
            refresh_interval_s: DEFAULT_REFRESH_INTERVAL,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            response_timeout_s: DEFAULT_RESPONSE_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Seconds of inactivity before the display sleeps. Zero disables.
    pub display_sleep_s: u64,
    /// Seconds of inactivity before the APC1 is unpowered. Zero disables.
    pub apc1_sleep_s: u64,
    pub poll_interval_s: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            display_sleep_s: DEFAULT_DISPLAY_SLEEP,
            apc1_sleep_s: DEFAULT_APC1_SLEEP,
            poll_interval_s: DEFAULT_POWER_POLL,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub shtc3_interval_s: u64,
    pub apc1_interval_s: u64,
    pub battery_interval_s: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            shtc3_interval_s: 5,
            apc1_interval_s: 10,
            battery_interval_s: 15,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub fps: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self { fps: 20 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub enabled: bool,
    pub broker_url: String,
    pub auth_token: String,
    pub publish_interval_s: u64,
    pub backoff_base_s: u64,
    pub backoff_ceiling_s: u64,
    /// Which cached quantities get pushed to the cloud.
    pub datastreams: Vec<Quantity>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker_url: "mqtts://blynk.cloud:8883".into(),
            auth_token: String::new(),
            publish_interval_s: 30,
            backoff_base_s: 5,
            backoff_ceiling_s: 120,
            datastreams: vec![
                Quantity::Temperature,
                Quantity::Humidity,
                Quantity::Pm1,
                Quantity::Pm25,
                Quantity::Tvoc,
                Quantity::Eco2,
                Quantity::AqiPm25,
            ],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub enabled: bool,
    pub sync_interval_s: u64,
    pub timezone_offset_hours: f32,
    pub servers: Vec<String>,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_interval_s: 3600,
            timezone_offset_hours: 0.0,
            servers: vec!["pool.ntp.org".into()],
        }
    }
}

/// Station-mode duty cycle for the APC1: off most of the time, powered up
/// long enough to warm up and take one reading per cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub cycle_period_s: u64,
    pub warmup_s: u64,
    pub read_delay_ms: u64,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            cycle_period_s: 300,
            warmup_s: 60,
            read_delay_ms: 500,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MyConfig {
    pub mode: OperatingMode,
    pub web: WebConfig,
    pub power: PowerConfig,
    pub sensors: SensorConfig,
    pub display: DisplayConfig,
    pub publisher: PublisherConfig,
    pub clock: ClockConfig,
    pub station: StationConfig,
}

impl MyConfig {
    /// Parse a settings.json document. Unknown keys are ignored and missing
    /// sections fall back to defaults, so a partial file is always usable.
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        serde_json::from_str(s).context("cannot parse settings")
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("cannot encode settings")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip() {
        let config = MyConfig::default();
        let json = config.to_json().unwrap();
        let back = MyConfig::from_json(&json).unwrap();
        assert_eq!(back.web.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(back.power.apc1_sleep_s, DEFAULT_APC1_SLEEP);
        assert_eq!(back.mode, OperatingMode::Mobile);
    }

    #[test]
    fn partial_settings_use_defaults() {
        let config = MyConfig::from_json(r#"{"mode": "station", "web": {"port": 8080}}"#).unwrap();
        assert_eq!(config.mode, OperatingMode::Station);
        assert_eq!(config.web.port, 8080);
        assert_eq!(config.web.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.power.display_sleep_s, DEFAULT_DISPLAY_SLEEP);
    }

    #[test]
    fn garbage_settings_fail() {
        assert!(MyConfig::from_json("not json").is_err());
    }
}

// EOF
