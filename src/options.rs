//! String key/value options.
//!
//! Options are the instrument's configuration surface. There are two scopes:
//!
//! - **Global** ([`GlobalOptions`]): engine-wide settings such as
//!   `OnMeasurementSuccessNoLedIndication`.
//! - **Device** ([`DeviceOptions`]): per-handle settings. A lookup without a
//!   device override falls back to the documented default for that key,
//!   never to another device's value. Device options are created fresh for
//!   every handle, so a reconnect (which yields a new handle) starts from the
//!   defaults again.
//!
//! Keys whose value is owned by another component (measurement mode, scan
//! direction, calibration timers, capability flags) are routed by
//! [`crate::instrument::Instrument`]; this module only stores plain settings
//! and validates their values.
//!
//! # Buffers
//!
//! `get` returns owned `String`s. For callers that hand in a caller-owned byte
//! buffer, [`required_len`] and [`read_into`] provide the two-phase
//! size-query protocol: the required size includes a terminating NUL and an
//! undersized buffer yields [`SpectroError::BufferTooSmall`] without writing.

use std::collections::HashMap;
use std::str::FromStr;

use crate::colorimetry::ColorimetricSettings;
use crate::error::{AppResult, SpectroError};
use crate::measurement::{
    ColorSpace, DensityFilter, IlluminationCondition, Illumination, Observer, RecognitionPolicy,
    ReferenceColorSpace, WhiteBase,
};

/// Separator for multi-valued option strings.
pub const DELIMITER: &str = ";";
/// Boolean true.
pub const YES: &str = "1";
/// Boolean false.
pub const NO: &str = "0";
/// Value of the global `Reset` key that resets the whole engine.
pub const RESET_ALL: &str = "All";
/// Device family reported by `DeviceTypeKey`.
pub const DEVICE_TYPE: &str = "i1Pro";
/// Engine version reported by `SDKVersion`.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Option key names.
pub mod keys {
    // ------------------------------------------------------------------ global
    /// Engine version (read-only).
    pub const SDK_VERSION: &str = "SDKVersion";
    /// Write-only reset command.
    pub const RESET: &str = "Reset";
    /// Suppress automatic success LEDs; global or per device.
    pub const NO_LED_INDICATION: &str = "OnMeasurementSuccessNoLedIndication";

    // ------------------------------------------------------------ capabilities
    /// Serial number (read-only).
    pub const SERIAL_NUMBER: &str = "SerialNumber";
    /// Transport path (read-only).
    pub const DEVICE_PATH: &str = "DevicePath";
    /// Device family (read-only).
    pub const DEVICE_TYPE: &str = "DeviceTypeKey";
    /// Hardware revision letter (read-only).
    pub const HW_REVISION: &str = "HWRevision";
    /// Branded supplier (read-only).
    pub const SUPPLIER_NAME: &str = "SupplierName";
    /// UV LED present (read-only).
    pub const HAS_UV_LED: &str = "HasUVLed";
    /// Physical UV cut filter present (read-only).
    pub const HAS_UV_CUT_FILTER: &str = "HasUVcutFilter";
    /// Wavelength LED present (read-only).
    pub const HAS_WAVELENGTH_LED: &str = "HasWavelengthLed";
    /// Zebra ruler sensor present (read-only).
    pub const HAS_ZEBRA_RULER: &str = "HasZebraRulerSensor";
    /// Indicator LEDs present (read-only).
    pub const HAS_INDICATOR_LED: &str = "HasIndicatorLed";
    /// Ambient light diffuser present (read-only).
    pub const HAS_AMBIENT_LIGHT: &str = "HasAmbientLight";
    /// Low resolution recognition available (read-only).
    pub const HAS_LOW_RESOLUTION: &str = "HasLowResolution";
    /// Licensed ruler length in millimetres (read-only).
    pub const MAX_RULER_LENGTH: &str = "MaxRulerLength";
    /// Delimited list of measurement modes (read-only).
    pub const AVAILABLE_MEASUREMENT_MODES: &str = "AvailableMeasurementModes";
    /// Delimited list of recognition policies (read-only).
    pub const AVAILABLE_RECOGNITIONS: &str = "AvailableRecognitionsKey";
    /// Delimited list of result indexes for the current mode (read-only).
    pub const AVAILABLE_RESULT_INDEXES: &str = "AvailableResultIndexesKey";

    // --------------------------------------------------------------- behaviour
    /// Active measurement mode.
    pub const MEASUREMENT_MODE: &str = "MeasurementMode";
    /// Patch recognition policy for scans.
    pub const RECOGNITION: &str = "RecognitionKey";
    /// Patches recognized by the last scan (read-only).
    pub const RECOGNIZED_PATCHES: &str = "RecognitionRecognizedPatches";
    /// Color space of the reference chart line.
    pub const REFERENCE_COLOR_SPACE: &str = "ReferenceChartColorSpaceKey";
    /// Declared patches per line for position recognition.
    pub const PATCHES_PER_LINE: &str = "PatchesPerLine";
    /// Direction of the next dual scan pass.
    pub const SCAN_DIRECTION: &str = "ScanDirectionKey";
    /// Direction reported by the ruler after the last scan (read-only).
    pub const LAST_SCAN_DIRECTION: &str = "LastScanDirectionKey";
    /// Which result set the accessors return.
    pub const RESULT_INDEX: &str = "ResultIndexKey";
    /// Write-only indicator LED command.
    pub const INDICATOR_LED: &str = "IndicatorLedKey";
    /// Run the lamp drift check when calibrating reflective modes.
    pub const PRECISION_CALIBRATION: &str = "PrecisionCalibration";
    /// Force a lamp restore on every precision calibration.
    pub const SIMULATE_LAMP_RESTORE: &str = "SimulateLampRestore";
    /// Trial exposure before emissive measurements.
    pub const ADAPTIVE_MEASUREMENT: &str = "AdaptiveMeasurement";
    /// Low resolution patch recognition.
    pub const LOW_RESOLUTION: &str = "LowResolution";
    /// Seconds since calibration of the current mode, `-1` if unset (read-only).
    pub const TIME_SINCE_CALIBRATION: &str = "TimeSinceLastCalibration";
    /// Seconds until calibration of the current mode expires, `-1` if unset (read-only).
    pub const TIME_UNTIL_CALIBRATION_EXPIRE: &str = "TimeUntilCalibrationExpire";
    /// Measurements since the last calibration (read-only).
    pub const MEASURE_COUNT: &str = "MeasureCount";
    /// Filter chosen by the last automatic density read (read-only).
    pub const LAST_AUTO_DENSITY_FILTER: &str = "LastAutoDensityFilter";

    // ------------------------------------------------------------- colorimetry
    /// Output color space of tristimulus results.
    pub const COLOR_SPACE: &str = "ColorSpaceDescription.Type";
    /// Reference illuminant.
    pub const ILLUMINATION: &str = "Colorimetric.Illumination";
    /// Standard observer.
    pub const OBSERVER: &str = "Colorimetric.Observer";
    /// Absolute or paper-relative results.
    pub const WHITE_BASE: &str = "Colorimetric.WhiteBase";
    /// Filter used by single-density reads.
    pub const DENSITY_FILTER: &str = "Colorimetric.DensityFilterMode";
}

/// Storable device keys and their defaults.
const DEVICE_DEFAULTS: &[(&str, &str)] = &[
    (keys::RECOGNITION, "RecognitionDisabled"),
    (keys::REFERENCE_COLOR_SPACE, "ReferenceChartLab"),
    (keys::PATCHES_PER_LINE, "0"),
    (keys::PRECISION_CALIBRATION, NO),
    (keys::SIMULATE_LAMP_RESTORE, NO),
    (keys::ADAPTIVE_MEASUREMENT, YES),
    (keys::LOW_RESOLUTION, NO),
    (keys::COLOR_SPACE, "CIELab"),
    (keys::ILLUMINATION, "D50"),
    (keys::OBSERVER, "TwoDegree"),
    (keys::WHITE_BASE, "WhiteBaseAbsolute"),
    (keys::DENSITY_FILTER, "DensityFilterAuto"),
];

fn parse_bool(key: &str, value: &str) -> AppResult<bool> {
    match value {
        YES => Ok(true),
        NO => Ok(false),
        other => Err(SpectroError::InvalidArgument(format!(
            "{} expects {} or {}, got '{}'",
            key, YES, NO, other
        ))),
    }
}

fn validate<T: FromStr<Err = SpectroError>>(value: &str) -> AppResult<()> {
    value.parse::<T>().map(|_| ())
}

/// Per-device option overrides over the documented defaults.
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    overrides: HashMap<&'static str, String>,
    no_led_indication: Option<bool>,
    result_index: Option<IlluminationCondition>,
}

impl DeviceOptions {
    /// Fresh options, every key at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default value of a stored key.
    pub fn default_value(key: &str) -> Option<&'static str> {
        DEVICE_DEFAULTS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    /// Current value of a stored key.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.overrides.get(key) {
            return Some(value.clone());
        }
        Self::default_value(key).map(str::to_string)
    }

    /// Validate and store a setting.
    pub fn set(&mut self, key: &str, value: &str) -> AppResult<()> {
        let (static_key, _) = DEVICE_DEFAULTS
            .iter()
            .find(|(k, _)| *k == key)
            .ok_or_else(|| SpectroError::InvalidArgument(format!("unknown option '{}'", key)))?;

        match *static_key {
            keys::RECOGNITION => validate::<RecognitionPolicy>(value)?,
            keys::REFERENCE_COLOR_SPACE => validate::<ReferenceColorSpace>(value)?,
            keys::COLOR_SPACE => validate::<ColorSpace>(value)?,
            keys::ILLUMINATION => validate::<Illumination>(value)?,
            keys::OBSERVER => validate::<Observer>(value)?,
            keys::WHITE_BASE => validate::<WhiteBase>(value)?,
            keys::DENSITY_FILTER => validate::<DensityFilter>(value)?,
            keys::PATCHES_PER_LINE => {
                value.parse::<u32>().map_err(|_| {
                    SpectroError::InvalidArgument(format!(
                        "{} expects a non-negative integer, got '{}'",
                        key, value
                    ))
                })?;
            }
            other => {
                parse_bool(other, value)?;
            }
        }

        self.overrides.insert(static_key, value.to_string());
        Ok(())
    }

    /// Drop every override.
    pub fn reset(&mut self) {
        self.overrides.clear();
        self.no_led_indication = None;
        self.result_index = None;
    }

    fn typed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).as_deref() == Some(YES)
    }

    /// Patch recognition policy for reflective scans.
    pub fn recognition(&self) -> RecognitionPolicy {
        self.typed(keys::RECOGNITION)
            .unwrap_or(RecognitionPolicy::Disabled)
    }

    /// Color space of reference lines.
    pub fn reference_color_space(&self) -> ReferenceColorSpace {
        self.typed(keys::REFERENCE_COLOR_SPACE)
            .unwrap_or(ReferenceColorSpace::Lab)
    }

    /// Declared patches per line.
    pub fn patches_per_line(&self) -> usize {
        self.typed::<u32>(keys::PATCHES_PER_LINE).unwrap_or(0) as usize
    }

    /// Lamp drift check enabled.
    pub fn precision_calibration(&self) -> bool {
        self.flag(keys::PRECISION_CALIBRATION)
    }

    /// Lamp restore simulation enabled.
    pub fn simulate_lamp_restore(&self) -> bool {
        self.flag(keys::SIMULATE_LAMP_RESTORE)
    }

    /// Adaptive exposure enabled.
    pub fn adaptive_measurement(&self) -> bool {
        self.flag(keys::ADAPTIVE_MEASUREMENT)
    }

    /// Low resolution recognition enabled.
    pub fn low_resolution(&self) -> bool {
        self.flag(keys::LOW_RESOLUTION)
    }

    /// Density filter for single-density reads.
    pub fn density_filter(&self) -> DensityFilter {
        self.typed(keys::DENSITY_FILTER)
            .unwrap_or(DensityFilter::Auto)
    }

    /// Colorimetric settings applied when reading results.
    pub fn colorimetric(&self) -> ColorimetricSettings {
        let defaults = ColorimetricSettings::default();
        ColorimetricSettings {
            color_space: self.typed(keys::COLOR_SPACE).unwrap_or(defaults.color_space),
            illumination: self
                .typed(keys::ILLUMINATION)
                .unwrap_or(defaults.illumination),
            observer: self.typed(keys::OBSERVER).unwrap_or(defaults.observer),
            white_base: self.typed(keys::WHITE_BASE).unwrap_or(defaults.white_base),
        }
    }

    /// Device-level LED suppression, if overridden.
    pub fn no_led_indication(&self) -> Option<bool> {
        self.no_led_indication
    }

    /// Override LED suppression for this device.
    pub fn set_no_led_indication(&mut self, value: &str) -> AppResult<()> {
        self.no_led_indication = Some(parse_bool(keys::NO_LED_INDICATION, value)?);
        Ok(())
    }

    /// Selected result index, if any was chosen since the last reset.
    pub fn result_index(&self) -> Option<IlluminationCondition> {
        self.result_index
    }

    /// Select the result index; availability is checked by the caller.
    pub fn set_result_index(&mut self, condition: IlluminationCondition) {
        self.result_index = Some(condition);
    }
}

/// Engine-wide options.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    no_led_indication: bool,
}

impl GlobalOptions {
    /// Options at their defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a global key.
    pub fn get(&self, key: &str) -> AppResult<String> {
        match key {
            keys::SDK_VERSION => Ok(SDK_VERSION.to_string()),
            keys::NO_LED_INDICATION => Ok(bool_value(self.no_led_indication).to_string()),
            keys::RESET => Err(SpectroError::InvalidArgument(
                "Reset is write-only".to_string(),
            )),
            other => Err(SpectroError::InvalidArgument(format!(
                "unknown global option '{}'",
                other
            ))),
        }
    }

    /// Write a plain global key. `Reset` is handled by the caller.
    pub fn set(&mut self, key: &str, value: &str) -> AppResult<()> {
        match key {
            keys::NO_LED_INDICATION => {
                self.no_led_indication = parse_bool(key, value)?;
                Ok(())
            }
            keys::SDK_VERSION => Err(SpectroError::InvalidArgument(format!(
                "{} is read-only",
                key
            ))),
            other => Err(SpectroError::InvalidArgument(format!(
                "unknown global option '{}'",
                other
            ))),
        }
    }

    /// Global LED suppression flag.
    pub fn no_led_indication(&self) -> bool {
        self.no_led_indication
    }

    /// Back to defaults.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// `"1"` or `"0"`.
pub fn bool_value(value: bool) -> &'static str {
    if value {
        YES
    } else {
        NO
    }
}

/// Join option values with [`DELIMITER`].
pub fn join_values<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| v.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(DELIMITER)
}

/// Split a multi-valued option string.
pub fn split_values(value: &str) -> Vec<&str> {
    value.split(DELIMITER).filter(|v| !v.is_empty()).collect()
}

/// Buffer size needed for `value`, terminating NUL included.
pub fn required_len(value: &str) -> usize {
    value.len() + 1
}

/// Copy `value` NUL-terminated into `buffer`.
///
/// Returns the number of bytes written, terminator included. Nothing is
/// written when the buffer is too small.
pub fn read_into(value: &str, buffer: &mut [u8]) -> AppResult<usize> {
    let required = required_len(value);
    if buffer.len() < required {
        return Err(SpectroError::BufferTooSmall {
            required,
            provided: buffer.len(),
        });
    }
    buffer[..value.len()].copy_from_slice(value.as_bytes());
    buffer[value.len()] = 0;
    Ok(required)
}
