//! Calibration Manager
//!
//! One [`CalibrationRecord`] per measurement mode of a device. The life of a
//! record:
//!
//! ```text
//! Uncalibrated -> Calibrating -> Calibrated -> Expired
//!                      |              |
//!                      +--------------+--> Invalidated
//! ```
//!
//! - Calibrating a mode only touches that mode's record.
//! - A calibration that fails after it has started invalidates the records
//!   of *every* mode on the device.
//! - Not being on the white tile is checked before anything starts, so it
//!   leaves every record as it was.
//!
//! Time is taken from `tokio::time::Instant`, so expiry can be tested with a
//! paused clock.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CalibrationConfig;
use crate::error::{AppResult, SpectroError};
use crate::hardware::transport::{LightSource, Transport, WhiteReference};
use crate::measurement::{MeasurementMode, Spectrum};

/// Calibration state of one mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    /// Never calibrated since the device was opened.
    Uncalibrated,
    /// A calibration is running.
    Calibrating,
    /// Valid calibration.
    Calibrated,
    /// The validity window has passed.
    Expired,
    /// A failed calibration of some mode wiped this one.
    Invalidated,
}

impl fmt::Display for CalibrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uncalibrated => write!(f, "uncalibrated"),
            Self::Calibrating => write!(f, "calibrating"),
            Self::Calibrated => write!(f, "calibrated"),
            Self::Expired => write!(f, "expired"),
            Self::Invalidated => write!(f, "invalidated"),
        }
    }
}

/// References measured during calibration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct References {
    /// White tile under the tungsten lamp.
    pub tungsten: Option<Spectrum>,
    /// White tile under the UV LED (dual modes).
    pub ultraviolet: Option<Spectrum>,
    /// Dark level (emissive and ambient modes).
    pub dark: Option<Spectrum>,
}

/// Calibration bookkeeping for one (device, mode) pair.
#[derive(Debug, Clone)]
pub struct CalibrationRecord {
    state: CalibrationState,
    calibrated_at: Option<Instant>,
    validity: Duration,
    lamp_restored: bool,
    measure_count: u64,
    references: References,
}

impl CalibrationRecord {
    fn new(validity: Duration) -> Self {
        Self {
            state: CalibrationState::Uncalibrated,
            calibrated_at: None,
            validity,
            lamp_restored: false,
            measure_count: 0,
            references: References::default(),
        }
    }

    /// State at `now`, expiry applied.
    pub fn state_at(&self, now: Instant) -> CalibrationState {
        match (self.state, self.calibrated_at) {
            (CalibrationState::Calibrated, Some(at)) if now.duration_since(at) >= self.validity => {
                CalibrationState::Expired
            }
            (state, _) => state,
        }
    }

    /// When the last successful calibration completed.
    pub fn calibrated_at(&self) -> Option<Instant> {
        self.calibrated_at
    }

    /// Length of the validity window.
    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Whether the last calibration had to restore the lamp.
    pub fn lamp_restored(&self) -> bool {
        self.lamp_restored
    }

    /// Measurements since the last calibration.
    pub fn measure_count(&self) -> u64 {
        self.measure_count
    }

    /// References of the last calibration.
    pub fn references(&self) -> &References {
        &self.references
    }
}

/// Per-device calibration records, one per mode.
#[derive(Debug, Clone)]
pub struct CalibrationManager {
    records: HashMap<MeasurementMode, CalibrationRecord>,
    config: CalibrationConfig,
}

impl CalibrationManager {
    /// Manager with every mode uncalibrated.
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            records: HashMap::new(),
            config,
        }
    }

    /// Validity window for `mode`.
    pub fn validity_for(&self, mode: MeasurementMode) -> Duration {
        if mode.is_ambient() {
            self.config.ambient_validity()
        } else {
            self.config.reflective_validity()
        }
    }

    fn record_mut(&mut self, mode: MeasurementMode) -> &mut CalibrationRecord {
        let validity = self.validity_for(mode);
        self.records
            .entry(mode)
            .or_insert_with(|| CalibrationRecord::new(validity))
    }

    /// Record of `mode`, if it was ever touched.
    pub fn record(&self, mode: MeasurementMode) -> Option<&CalibrationRecord> {
        self.records.get(&mode)
    }

    /// State of `mode` at `now`.
    pub fn state(&self, mode: MeasurementMode, now: Instant) -> CalibrationState {
        self.records
            .get(&mode)
            .map(|r| r.state_at(now))
            .unwrap_or(CalibrationState::Uncalibrated)
    }

    /// True when `mode` may be triggered at `now`.
    pub fn is_calibrated(&self, mode: MeasurementMode, now: Instant) -> bool {
        self.state(mode, now) == CalibrationState::Calibrated
    }

    /// References of a valid calibration of `mode`.
    pub fn references(&self, mode: MeasurementMode, now: Instant) -> AppResult<&References> {
        match self.records.get(&mode) {
            Some(record) if record.state_at(now) == CalibrationState::Calibrated => {
                Ok(&record.references)
            }
            _ => Err(SpectroError::NotCalibrated),
        }
    }

    /// Time since calibration; `None` when not calibrated or expired.
    pub fn time_since_calibration(&self, mode: MeasurementMode, now: Instant) -> Option<Duration> {
        let record = self.records.get(&mode)?;
        if record.state_at(now) != CalibrationState::Calibrated {
            return None;
        }
        record.calibrated_at.map(|at| now.duration_since(at))
    }

    /// Time until expiry; `None` when not calibrated or expired.
    pub fn time_until_expiry(&self, mode: MeasurementMode, now: Instant) -> Option<Duration> {
        let since = self.time_since_calibration(mode, now)?;
        let validity = self.records.get(&mode)?.validity;
        Some(validity.saturating_sub(since))
    }

    /// Measurements since the last calibration of `mode`.
    pub fn measure_count(&self, mode: MeasurementMode) -> u64 {
        self.records.get(&mode).map(|r| r.measure_count).unwrap_or(0)
    }

    /// Count one successful measurement in `mode`.
    pub fn count_measurement(&mut self, mode: MeasurementMode) {
        self.record_mut(mode).measure_count += 1;
    }

    /// Mark `mode` as calibrating. Other modes are untouched.
    pub fn begin(&mut self, mode: MeasurementMode) {
        self.record_mut(mode).state = CalibrationState::Calibrating;
    }

    /// Finish a successful calibration of `mode`.
    pub fn commit(
        &mut self,
        mode: MeasurementMode,
        references: References,
        lamp_restored: bool,
        now: Instant,
    ) {
        let record = self.record_mut(mode);
        record.state = CalibrationState::Calibrated;
        record.calibrated_at = Some(now);
        record.lamp_restored = lamp_restored;
        record.measure_count = 0;
        record.references = references;
        info!(%mode, "calibration committed");
    }

    /// Invalidate every mode after a failed calibration.
    pub fn invalidate_all(&mut self) {
        for (mode, record) in self.records.iter_mut() {
            if record.state != CalibrationState::Uncalibrated {
                record.state = CalibrationState::Invalidated;
                record.calibrated_at = None;
                record.references = References::default();
                debug!(%mode, "calibration invalidated");
            }
        }
    }

    /// Tolerances in force.
    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }
}

/// Lamp handling requested for one calibration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LampCheck {
    /// Run the drift check on reflective modes.
    pub precision: bool,
    /// Restore the lamp even without drift.
    pub simulate_restore: bool,
}

/// Outcome of the calibration I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationOutcome {
    /// References to store.
    pub references: References,
    /// Whether the lamp was restored.
    pub lamp_restored: bool,
}

fn check_reference(
    reference: &WhiteReference,
    source: LightSource,
    config: &CalibrationConfig,
) -> AppResult<()> {
    if reference.wavelength_shift_nm.abs() > config.wavelength_shift_tolerance_nm {
        return Err(SpectroError::WavelengthShift {
            shift_nm: reference.wavelength_shift_nm,
        });
    }
    if !reference.spectrum.is_finite() {
        return Err(SpectroError::DeviceCorrupt(format!(
            "{} reference is not finite",
            source
        )));
    }
    let reflective = matches!(source, LightSource::Tungsten | LightSource::Ultraviolet);
    let mean = reference.spectrum.total() / reference.spectrum.values().len() as f64;
    if reflective && mean < config.min_white_level {
        return Err(SpectroError::DeviceCorrupt(format!(
            "{} reference too dark (mean {:.4})",
            source, mean
        )));
    }
    Ok(())
}

async fn read_checked(
    transport: &dyn Transport,
    source: LightSource,
    config: &CalibrationConfig,
) -> AppResult<Spectrum> {
    let reference = transport.read_reference(source).await?;
    check_reference(&reference, source, config)?;
    Ok(reference.spectrum)
}

/// Take the references `mode` needs.
///
/// The white tile must already have been verified. `on_lamp_restore` runs
/// before a lamp restore starts, so the operator can be told that this
/// calibration takes longer than usual.
pub async fn acquire_references<F, Fut>(
    transport: &dyn Transport,
    mode: MeasurementMode,
    lamp: LampCheck,
    config: &CalibrationConfig,
    on_lamp_restore: F,
) -> AppResult<CalibrationOutcome>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut references = References::default();
    let mut lamp_restored = false;

    match mode {
        MeasurementMode::Undefined => return Err(SpectroError::NoMeasureModeSet),
        MeasurementMode::EmissionSpot => {
            references.dark = Some(read_checked(transport, LightSource::Emissive, config).await?);
        }
        MeasurementMode::AmbientLightSpot | MeasurementMode::AmbientLightScan => {
            references.dark = Some(read_checked(transport, LightSource::Ambient, config).await?);
        }
        _ => {
            if lamp.precision {
                let drift = transport.lamp_drift().await?;
                if drift.abs() > config.lamp_drift_tolerance || lamp.simulate_restore {
                    warn!(drift, simulated = lamp.simulate_restore, "restoring lamp");
                    on_lamp_restore().await;
                    transport.restore_lamp().await?;
                    lamp_restored = true;
                }
            }
            references.tungsten =
                Some(read_checked(transport, LightSource::Tungsten, config).await?);
            if mode.is_dual() {
                references.ultraviolet =
                    Some(read_checked(transport, LightSource::Ultraviolet, config).await?);
            }
        }
    }

    Ok(CalibrationOutcome {
        references,
        lamp_restored,
    })
}
