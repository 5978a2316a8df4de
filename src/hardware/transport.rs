//! Boundary between the engine and a physical instrument.
//!
//! The engine never talks USB itself. Everything it needs from a device is
//! expressed by [`Transport`] (one per physical instrument) and
//! [`DeviceBus`] (discovery). Implementations must be cheap to share behind
//! an `Arc` and safe to call from any task.
//!
//! Raw data crosses this boundary uncalibrated: spectra are sensor signal
//! per band, normalised by the engine against the references taken during
//! calibration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::AppResult;
use crate::measurement::{IndicatorLed, MeasurementMode, RecognitionPolicy, Spectrum};

/// Illumination used for a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LightSource {
    /// Tungsten filament lamp (M0 illumination).
    Tungsten,
    /// UV LED, used for the backward pass of a dual scan.
    Ultraviolet,
    /// No illumination; the sensor looks at an emitting surface.
    Emissive,
    /// No illumination, ambient diffuser in place.
    Ambient,
}

impl fmt::Display for LightSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tungsten => write!(f, "tungsten"),
            Self::Ultraviolet => write!(f, "uv"),
            Self::Emissive => write!(f, "emissive"),
            Self::Ambient => write!(f, "ambient"),
        }
    }
}

/// Static description of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Serial number printed on the device.
    pub serial_number: String,
    /// Hardware revision letter.
    pub hw_revision: String,
    /// Branded supplier name.
    pub supplier_name: String,
    /// Stable transport path; identifies the device across discoveries.
    pub device_path: String,
    /// UV LED for dual scans.
    pub has_uv_led: bool,
    /// Physical UV cut filter (results are M2 only).
    pub has_uv_cut_filter: bool,
    /// Wavelength reference LED.
    pub has_wavelength_led: bool,
    /// Zebra ruler position sensor.
    pub has_zebra_ruler: bool,
    /// User indicator LEDs.
    pub has_indicator_led: bool,
    /// Ambient light diffuser.
    pub has_ambient_light: bool,
    /// Low resolution recognition.
    pub has_low_resolution: bool,
    /// Licensed ruler length in millimetres.
    pub max_ruler_length_mm: f64,
}

impl DeviceCapabilities {
    /// Whether the device can run `mode`.
    pub fn supports(&self, mode: MeasurementMode) -> bool {
        match mode {
            MeasurementMode::Undefined
            | MeasurementMode::ReflectanceSpot
            | MeasurementMode::ReflectanceScan
            | MeasurementMode::EmissionSpot => true,
            MeasurementMode::AmbientLightSpot | MeasurementMode::AmbientLightScan => {
                self.has_ambient_light
            }
            MeasurementMode::DualReflectanceSpot | MeasurementMode::DualReflectanceScan => {
                self.has_uv_led && !self.has_uv_cut_filter && self.has_zebra_ruler
            }
        }
    }

    /// Modes this device can run, `Undefined` excluded.
    pub fn available_modes(&self) -> Vec<MeasurementMode> {
        MeasurementMode::ALL
            .iter()
            .copied()
            .filter(|m| *m != MeasurementMode::Undefined && self.supports(*m))
            .collect()
    }

    /// Recognition policies this device can run.
    pub fn available_recognitions(&self) -> Vec<RecognitionPolicy> {
        RecognitionPolicy::ALL
            .iter()
            .copied()
            .filter(|p| *p != RecognitionPolicy::Position || self.has_zebra_ruler)
            .filter(|p| *p != RecognitionPolicy::Flash || self.has_ambient_light)
            .collect()
    }
}

/// Reference taken on the white tile.
#[derive(Debug, Clone, PartialEq)]
pub struct WhiteReference {
    /// Raw signal of the tile.
    pub spectrum: Spectrum,
    /// Shift of the wavelength scale measured against the reference LED.
    pub wavelength_shift_nm: f64,
}

/// Exposure strategy for a spot reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exposure {
    /// Fixed integration time.
    Fixed,
    /// Trial reading first, then an optimised integration time.
    Adaptive,
}

/// One spectral reading taken during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSample {
    /// Time since the scan was started.
    pub elapsed: Duration,
    /// Raw signal.
    pub spectrum: Spectrum,
}

/// One report from the zebra ruler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RulerSample {
    /// Time since the scan was started.
    pub elapsed: Duration,
    /// Position along the ruler.
    pub position_mm: f64,
    /// True when a patch edge marker was crossed at this position.
    pub edge: bool,
}

/// Everything captured during one scan pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanCapture {
    /// Spectral readings in time order.
    pub samples: Vec<ScanSample>,
    /// Ruler reports in time order; empty without a ruler.
    pub ruler: Vec<RulerSample>,
}

impl ScanCapture {
    /// Time from the start of the pass to the last report.
    pub fn duration(&self) -> Duration {
        let spectral = self.samples.last().map(|s| s.elapsed).unwrap_or_default();
        let ruler = self.ruler.last().map(|r| r.elapsed).unwrap_or_default();
        spectral.max(ruler)
    }
}

/// Asynchronous notification raised by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareSignal {
    /// The measure button was pressed.
    ButtonPressed,
    /// The device was unplugged.
    Disconnected,
}

/// Access to one physical instrument.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Static device description.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Subscribe to button and disconnect notifications.
    fn subscribe(&self) -> broadcast::Receiver<HardwareSignal>;

    /// Take exclusive ownership of the device for this process.
    ///
    /// Fails with `AlreadyInUse` when another process holds it and
    /// `NotConnected` when it is gone.
    async fn claim(&self) -> AppResult<()>;

    /// Give up ownership. Must succeed even if the device is gone.
    async fn release(&self) -> AppResult<()>;

    /// Discard any buffered data.
    async fn flush(&self) -> AppResult<()>;

    /// Whether the sensor rests on its white tile with the slider open.
    async fn is_on_white_tile(&self) -> AppResult<bool>;

    /// Read the white tile (or, for emissive sources, the dark level).
    async fn read_reference(&self, source: LightSource) -> AppResult<WhiteReference>;

    /// Relative drift of the tungsten lamp from its factory state.
    async fn lamp_drift(&self) -> AppResult<f64>;

    /// Bring the lamp back to its standard condition. Slow.
    async fn restore_lamp(&self) -> AppResult<()>;

    /// Take one spot reading.
    async fn read_spot(&self, source: LightSource, exposure: Exposure) -> AppResult<Spectrum>;

    /// Switch the light on and wait until the operator may move.
    async fn prepare_scan(&self, source: LightSource) -> AppResult<()>;

    /// Record one pass until the operator stops or `limit` elapses.
    async fn capture_scan(&self, source: LightSource, limit: Duration) -> AppResult<ScanCapture>;

    /// Keep reporting ruler positions between passes.
    async fn set_position_streaming(&self, enabled: bool) -> AppResult<()>;

    /// Drive the indicator LEDs.
    async fn set_indicator(&self, led: IndicatorLed) -> AppResult<()>;
}

/// Device discovery.
#[async_trait]
pub trait DeviceBus: Send + Sync {
    /// Snapshot of the instruments currently attached.
    async fn enumerate(&self) -> AppResult<Vec<Arc<dyn Transport>>>;
}
