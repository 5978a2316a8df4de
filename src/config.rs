//! Engine configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/spectro.toml` by default)
//! 2. environment variables prefixed with `SPECTRO_`
//!
//! Every field has a default, so an empty file (or no file) yields a working
//! configuration.
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! SPECTRO_APPLICATION__LOG_LEVEL=debug
//! SPECTRO_SCAN__PASS_TIMEOUT_MS=30000
//! SPECTRO_SESSION__EVENT_QUEUE_CAPACITY=128
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    #[error("Configuration serialization error: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpectroConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Device session and event delivery
    #[serde(default)]
    pub session: SessionConfig,
    /// Calibration validity and tolerances
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Scan validation and recognition
    #[serde(default)]
    pub scan: ScanConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Device session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Capacity of the event queue feeding the dispatcher
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// How long a trigger waits for its event to reach the handler
    #[serde(default = "default_event_ack_timeout")]
    pub event_ack_timeout_ms: u64,
}

/// Calibration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Validity of reflective and emissive calibrations
    #[serde(default = "default_reflective_validity")]
    pub reflective_validity_secs: u64,
    /// Validity of ambient light calibrations
    #[serde(default = "default_ambient_validity")]
    pub ambient_validity_secs: u64,
    /// Relative lamp drift that triggers a lamp restore
    #[serde(default = "default_lamp_drift_tolerance")]
    pub lamp_drift_tolerance: f64,
    /// Wavelength shift (nm) above which the sensor is considered faulty
    #[serde(default = "default_wavelength_shift_tolerance")]
    pub wavelength_shift_tolerance_nm: f64,
    /// Minimum mean white-reference level; darker references are corrupt
    #[serde(default = "default_min_white_level")]
    pub min_white_level: f64,
}

/// Scan validation and recognition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Time the operator must wait after the trigger before moving
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Minimum travel on the ruler
    #[serde(default = "default_min_travel")]
    pub min_travel_mm: f64,
    /// Maximum duration of one scan pass
    #[serde(default = "default_pass_timeout")]
    pub pass_timeout_ms: u64,
    /// Maximum idle time between forward and backward pass
    #[serde(default = "default_backward_idle")]
    pub backward_idle_timeout_ms: u64,
    /// Position change that counts as movement
    #[serde(default = "default_motion_threshold")]
    pub motion_threshold_mm: f64,
    /// RMS spectral step that marks a patch edge (basic recognition)
    #[serde(default = "default_edge_threshold")]
    pub edge_threshold: f64,
    /// Minimum samples inside a recognized patch
    #[serde(default = "default_min_patch_samples")]
    pub min_patch_samples: usize,
    /// Minimum correlation coefficient for chart correlation
    #[serde(default = "default_correlation_threshold")]
    pub correlation_threshold: f64,
    /// Irradiance ratio over the baseline that counts as a flash
    #[serde(default = "default_flash_ratio")]
    pub flash_ratio: f64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "spectro_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_event_queue_capacity() -> usize {
    64
}

fn default_event_ack_timeout() -> u64 {
    2000
}

fn default_reflective_validity() -> u64 {
    4 * 60 * 60
}

fn default_ambient_validity() -> u64 {
    31 * 24 * 60 * 60
}

fn default_lamp_drift_tolerance() -> f64 {
    0.02
}

fn default_wavelength_shift_tolerance() -> f64 {
    1.0
}

fn default_min_white_level() -> f64 {
    0.05
}

fn default_settle_delay() -> u64 {
    500
}

fn default_min_travel() -> f64 {
    10.0
}

fn default_pass_timeout() -> u64 {
    20_000
}

fn default_backward_idle() -> u64 {
    10_000
}

fn default_motion_threshold() -> f64 {
    0.5
}

fn default_edge_threshold() -> f64 {
    0.05
}

fn default_min_patch_samples() -> usize {
    3
}

fn default_correlation_threshold() -> f64 {
    0.8
}

fn default_flash_ratio() -> f64 {
    3.0
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: default_event_queue_capacity(),
            event_ack_timeout_ms: default_event_ack_timeout(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            reflective_validity_secs: default_reflective_validity(),
            ambient_validity_secs: default_ambient_validity(),
            lamp_drift_tolerance: default_lamp_drift_tolerance(),
            wavelength_shift_tolerance_nm: default_wavelength_shift_tolerance(),
            min_white_level: default_min_white_level(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay(),
            min_travel_mm: default_min_travel(),
            pass_timeout_ms: default_pass_timeout(),
            backward_idle_timeout_ms: default_backward_idle(),
            motion_threshold_mm: default_motion_threshold(),
            edge_threshold: default_edge_threshold(),
            min_patch_samples: default_min_patch_samples(),
            correlation_threshold: default_correlation_threshold(),
            flash_ratio: default_flash_ratio(),
        }
    }
}

impl SessionConfig {
    /// Event acknowledgement timeout as a `Duration`.
    pub fn event_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.event_ack_timeout_ms)
    }
}

impl CalibrationConfig {
    /// Validity window for reflective and emissive modes.
    pub fn reflective_validity(&self) -> Duration {
        Duration::from_secs(self.reflective_validity_secs)
    }

    /// Validity window for ambient modes.
    pub fn ambient_validity(&self) -> Duration {
        Duration::from_secs(self.ambient_validity_secs)
    }
}

impl ScanConfig {
    /// Settle delay as a `Duration`.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Pass timeout as a `Duration`.
    pub fn pass_timeout(&self) -> Duration {
        Duration::from_millis(self.pass_timeout_ms)
    }

    /// Backward idle cap as a `Duration`.
    pub fn backward_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.backward_idle_timeout_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl SpectroConfig {
    /// Load configuration from `config/spectro.toml` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/spectro.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Precedence (highest first): `SPECTRO_` environment variables, the
    /// file, built-in defaults. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(SpectroConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SPECTRO_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.session.event_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "event_queue_capacity must be at least 1".to_string(),
            ));
        }

        if self.calibration.reflective_validity_secs == 0
            || self.calibration.ambient_validity_secs == 0
        {
            return Err(ConfigError::ValidationError(
                "calibration validity must be positive".to_string(),
            ));
        }

        if self.scan.min_travel_mm <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "min_travel_mm must be positive, got {}",
                self.scan.min_travel_mm
            )));
        }

        if !(0.0..=1.0).contains(&self.scan.correlation_threshold) {
            return Err(ConfigError::ValidationError(format!(
                "correlation_threshold must be within 0..=1, got {}",
                self.scan.correlation_threshold
            )));
        }

        if self.scan.min_patch_samples == 0 {
            return Err(ConfigError::ValidationError(
                "min_patch_samples must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SpectroConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.scan.pass_timeout(), Duration::from_secs(20));
        assert_eq!(config.scan.settle_delay(), Duration::from_millis(500));
        assert_eq!(
            config.calibration.reflective_validity(),
            Duration::from_secs(4 * 3600)
        );
        assert_eq!(
            config.calibration.ambient_validity(),
            Duration::from_secs(31 * 24 * 3600)
        );
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "[scan]\nmin_travel_mm = 25.0\n\n[application]\nlog_level = \"debug\""
        )
        .expect("write");

        let config = SpectroConfig::load_from(file.path()).expect("load");
        assert_eq!(config.scan.min_travel_mm, 25.0);
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.scan.pass_timeout_ms, 20_000);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = SpectroConfig::load_from("/nonexistent/spectro.toml").expect("load");
        assert_eq!(config.session.event_queue_capacity, 64);
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = SpectroConfig::default();
        config.application.log_level = "loud".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_invalid_correlation_threshold_rejected() {
        let mut config = SpectroConfig::default();
        config.scan.correlation_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = SpectroConfig::default();
        let text = config.to_toml_string().expect("serialize");
        assert!(text.contains("[scan]"));
        let parsed: SpectroConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed.scan.min_travel_mm, config.scan.min_travel_mm);
    }
}
