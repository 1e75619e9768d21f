//! Tunables handed to the components at construction
//!
//! The struct is TOML (de)serializable so an owner can embed it in its own
//! config file. Every field is optional; missing values fall back to the
//! defaults below.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub grabber: GrabberConfig,
    pub pointing_motion: PointingMotionConfig,
}

/// Per-device handle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Input report buffer size when the device does not advertise one
    pub default_report_buffer_size: usize,
    /// Capacity of the platform value queue
    pub value_queue_depth: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            default_report_buffer_size: 32,
            value_queue_depth: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrabberConfig {
    /// Delay between grab attempts (the first attempt is immediate)
    pub retry_interval_ms: u64,
    /// Delay between shared-open attempts while observing
    pub observe_interval_ms: u64,
}

impl Default for GrabberConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 1000,
            observe_interval_ms: 3000,
        }
    }
}

impl GrabberConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn observe_interval(&self) -> Duration {
        Duration::from_millis(self.observe_interval_ms)
    }
}

/// Scaling applied to decoded pointing motion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointingMotionConfig {
    pub xy_multiplier: f64,
    pub wheels_multiplier: f64,
}

impl Default for PointingMotionConfig {
    fn default() -> Self {
        Self {
            xy_multiplier: 1.0,
            wheels_multiplier: 1.0,
        }
    }
}

impl Config {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("grabber.retry_interval_ms", self.grabber.retry_interval_ms),
            ("grabber.observe_interval_ms", self.grabber.observe_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.device.value_queue_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "device.value_queue_depth",
                reason: "must be greater than zero".into(),
            });
        }
        for (field, value) in [
            ("pointing_motion.xy_multiplier", self.pointing_motion.xy_multiplier),
            ("pointing_motion.wheels_multiplier", self.pointing_motion.wheels_multiplier),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} is not a finite number"),
                });
            }
        }
        Ok(())
    }
}
