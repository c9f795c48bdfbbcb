//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `CSI_CAPTURE_`, nested keys
//!    separated by `__` (e.g. `CSI_CAPTURE_CAPTURE__STOP_TIMEOUT_MS=250`)
//!
//! # Example
//! ```no_run
//! use csi_capture::config::CaptureConfig;
//!
//! let config = CaptureConfig::load_from("config/capture.toml")?;
//! config.validate()?;
//! for sensor in &config.sensors {
//!     println!("{} on CSI{}", sensor.name, sensor.instance);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::csi::{PixelFormat, CHANNEL_COUNT, MAX_DIMENSION, MAX_SETTLE};
use crate::deferred::DEFAULT_QUEUE_DEPTH;
use crate::error::{CaptureError, Result};
use crate::phy::{ResetSelector, DEFAULT_PHY_COUNT};
use crate::publisher::MAX_INSTANCES;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Capture engine tuning
    #[serde(default)]
    pub capture: CaptureSettings,
    /// One entry per physical sensor
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Capture engine tuning shared by every instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Quiescence wait used by `close` when it has to stop a running stream
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
    /// Capacity of each device's deferred-work queue
    #[serde(default = "default_queue_depth")]
    pub work_queue_depth: usize,
    /// Bound on waiting for the shared PHY register lock
    #[serde(default = "default_phy_lock_timeout")]
    pub phy_lock_timeout_us: u64,
    /// D-PHY lanes sharing the control register
    #[serde(default = "default_phy_lanes")]
    pub phy_lanes: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            stop_timeout_ms: default_stop_timeout(),
            work_queue_depth: default_queue_depth(),
            phy_lock_timeout_us: default_phy_lock_timeout(),
            phy_lanes: default_phy_lanes(),
        }
    }
}

impl CaptureSettings {
    /// Stop timeout as a [`Duration`].
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// PHY lock bound as a [`Duration`].
    pub fn phy_lock_timeout(&self) -> Duration {
        Duration::from_micros(self.phy_lock_timeout_us)
    }
}

/// Description of one sensor and how its CSI instance is programmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Human-readable sensor name
    pub name: String,
    /// CSI instance the sensor is wired to
    pub instance: u32,
    /// D-PHY lane; defaults to the instance number
    #[serde(default)]
    pub phy_lane: Option<u32>,
    /// Reset line pulsed when the PHY is (re)configured
    #[serde(default)]
    pub phy_reset: ResetSelector,
    /// Active data lanes (1..=4)
    #[serde(default = "default_data_lanes")]
    pub data_lanes: u32,
    /// D-PHY HS settle time
    #[serde(default = "default_settle")]
    pub settle: u32,
    /// CSI virtual channel
    #[serde(default)]
    pub channel: u32,
    /// CSI-2 data type code
    #[serde(default = "default_pixel_format")]
    pub pixel_format: PixelFormat,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Forward frames on the fly to this downstream group instead of buffering
    #[serde(default)]
    pub otf_group: Option<u32>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_stop_timeout() -> u64 {
    1000
}

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

fn default_phy_lock_timeout() -> u64 {
    500
}

fn default_phy_lanes() -> u32 {
    DEFAULT_PHY_COUNT
}

fn default_data_lanes() -> u32 {
    4
}

fn default_settle() -> u32 {
    0x12
}

fn default_pixel_format() -> PixelFormat {
    PixelFormat::RAW10
}

impl SensorConfig {
    /// Sensor with default lane/settle/format settings.
    pub fn new(name: impl Into<String>, instance: u32, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            instance,
            phy_lane: None,
            phy_reset: ResetSelector::default(),
            data_lanes: default_data_lanes(),
            settle: default_settle(),
            channel: 0,
            pixel_format: default_pixel_format(),
            width,
            height,
            otf_group: None,
        }
    }

    /// D-PHY lane used by this sensor.
    pub fn phy_lane(&self) -> u32 {
        self.phy_lane.unwrap_or(self.instance)
    }

    /// Check every register-bound parameter, so `open` can fail before any write.
    pub fn validate(&self, phy_lanes: u32) -> Result<()> {
        let invalid = |message: String| Err(CaptureError::invalid_argument(format!("sensor '{}': {message}", self.name)));

        if self.instance as usize >= MAX_INSTANCES {
            return invalid(format!("instance {} exceeds {}", self.instance, MAX_INSTANCES - 1));
        }
        if self.phy_lane() >= phy_lanes {
            return invalid(format!("PHY lane {} out of range: {phy_lanes} lanes", self.phy_lane()));
        }
        if !(1..=4).contains(&self.data_lanes) {
            return invalid(format!("data lane count {} not in 1..=4", self.data_lanes));
        }
        if self.settle > MAX_SETTLE {
            return invalid(format!("settle time {} exceeds {MAX_SETTLE}", self.settle));
        }
        if self.channel >= CHANNEL_COUNT {
            return invalid(format!("channel {} out of range", self.channel));
        }
        if self.pixel_format.0 > 0x3F {
            return invalid(format!("pixel format {:#x} is not a 6-bit data type", self.pixel_format.0));
        }
        if !(1..=MAX_DIMENSION).contains(&self.width) || !(1..=MAX_DIMENSION).contains(&self.height) {
            return invalid(format!("geometry {}x{} outside 1..={MAX_DIMENSION}", self.width, self.height));
        }
        Ok(())
    }
}

impl CaptureConfig {
    /// Load configuration from a TOML file and `CSI_CAPTURE_` environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> std::result::Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CSI_CAPTURE_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(CaptureError::invalid_argument(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(CaptureError::invalid_argument(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.capture.stop_timeout_ms == 0 {
            return Err(CaptureError::invalid_argument("stop_timeout_ms must be greater than 0"));
        }
        if self.capture.work_queue_depth == 0 {
            return Err(CaptureError::invalid_argument("work_queue_depth must be greater than 0"));
        }
        if self.capture.phy_lanes == 0 || self.capture.phy_lanes > 8 {
            return Err(CaptureError::invalid_argument(format!(
                "phy_lanes {} not in 1..=8",
                self.capture.phy_lanes
            )));
        }

        let mut instances = HashSet::new();
        let mut lanes = HashSet::new();
        for sensor in &self.sensors {
            sensor.validate(self.capture.phy_lanes)?;
            if !instances.insert(sensor.instance) {
                return Err(CaptureError::invalid_argument(format!(
                    "Duplicate sensor instance: {}",
                    sensor.instance
                )));
            }
            if !lanes.insert(sensor.phy_lane()) {
                return Err(CaptureError::invalid_argument(format!(
                    "PHY lane {} assigned to more than one sensor",
                    sensor.phy_lane()
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
log_level = "debug"

[capture]
stop_timeout_ms = 250

[[sensors]]
name = "rear"
instance = 0
width = 1920
height = 1080

[[sensors]]
name = "front"
instance = 1
data_lanes = 2
pixel_format = 0x2A
width = 1280
height = 720
otf_group = 3
"#;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = CaptureConfig::load_from(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.log_format, "pretty");
        assert_eq!(config.capture.stop_timeout(), Duration::from_millis(250));
        assert_eq!(config.capture.work_queue_depth, DEFAULT_QUEUE_DEPTH);

        let front = &config.sensors[1];
        assert_eq!(front.phy_lane(), 1);
        assert_eq!(front.data_lanes, 2);
        assert_eq!(front.pixel_format, PixelFormat::RAW8);
        assert_eq!(front.otf_group, Some(3));
        assert_eq!(config.sensors[0].pixel_format, PixelFormat::RAW10);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = CaptureConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_format_case_insensitive() {
        let mut config = CaptureConfig::default();
        config.application.log_format = "JSON".to_string();
        assert!(config.validate().is_ok());

        config.application.log_format = "Yaml".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_format 'Yaml'"));
    }

    #[test]
    fn test_duplicate_instances() {
        let config = CaptureConfig {
            sensors: vec![
                SensorConfig::new("a", 0, 640, 480),
                SensorConfig {
                    phy_lane: Some(1),
                    ..SensorConfig::new("b", 0, 640, 480)
                },
            ],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate sensor instance"));
    }

    #[test]
    fn test_sensor_ranges() {
        let ok = SensorConfig::new("cam", 2, 1920, 1080);
        assert!(ok.validate(3).is_ok());
        assert!(ok.validate(2).is_err());

        let lanes = SensorConfig { data_lanes: 5, ..ok.clone() };
        assert!(lanes.validate(3).is_err());

        let geometry = SensorConfig { width: 0, ..ok.clone() };
        assert!(geometry.validate(3).is_err());

        let instance = SensorConfig { instance: MAX_INSTANCES as u32, phy_lane: Some(0), ..ok };
        assert!(instance.validate(3).is_err());
    }
}
