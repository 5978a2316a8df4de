//! Per-device measurement state.
//!
//! [`DeviceState`] owns everything one opened instrument remembers between
//! calls: its options, calibration records, active mode with cached results,
//! a pending dual forward pass, the reference chart line and the substrate.
//! It is always accessed through the session's async mutex, so its methods
//! take `&mut self` and run one at a time per device.
//!
//! # Trigger
//!
//! 1. `Undefined` mode fails with `NoMeasureModeSet`.
//! 2. A mode without a valid calibration fails with `NotCalibrated` before
//!    any device I/O.
//! 3. Cached results are flushed, then the mode's measurement runs.
//! 4. Only a complete measurement is committed; a failed scan leaves the
//!    cache empty.
//!
//! A dual forward pass commits nothing: it is kept until the backward pass
//! runs, the direction is set to forward again, or the mode changes.

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::calibration::{acquire_references, CalibrationManager, LampCheck, References};
use crate::colorimetry::{
    auto_density_index, densities, emissive_tristimulus, reflective_tristimulus,
    relative_to_substrate,
};
use crate::config::{ScanConfig, SpectroConfig};
use crate::error::{AppResult, SpectroError};
use crate::events::{DeviceEventKind, EventEmitter};
use crate::hardware::transport::{DeviceCapabilities, Exposure, LightSource, ScanCapture, Transport};
use crate::measurement::{
    Densities, DensityFilter, IlluminationCondition, IndicatorLed, LastScanDirection,
    MeasurementMode, MeasurementSample, RecognitionPolicy, ScanDirection, Spectrum, Tristimulus,
    WhiteBase,
};
use crate::mode::{available_result_indexes, reflective_condition, ModeState};
use crate::options::{bool_value, join_values, keys, DeviceOptions, RESET_ALL};
use crate::scan::dual::{self, DualResults, ForwardPass};
use crate::scan::recognition;
use crate::scan::reference::ReferenceLine;
use crate::scan::{dark_corrected, normalize, reflectance, travel_direction, PassLimits};

/// Value of the device `Reset` key that resets only the mode settings.
pub const RESET_MEASUREMENT_MODE: &str = "MeasurementMode";

type Results = Vec<(IlluminationCondition, Vec<Spectrum>)>;

/// Forward pass waiting for its backward pass.
#[derive(Debug, Clone)]
struct PendingForward {
    pass: ForwardPass,
    completed_at: Instant,
}

/// State of one opened device.
#[derive(Debug)]
pub struct DeviceState {
    capabilities: DeviceCapabilities,
    scan: ScanConfig,
    options: DeviceOptions,
    calibration: CalibrationManager,
    modes: ModeState,
    direction: ScanDirection,
    pending: Option<PendingForward>,
    reference_line: Option<ReferenceLine>,
    recognized_patches: usize,
    last_scan_direction: LastScanDirection,
    last_auto_density: Option<DensityFilter>,
    substrate: Option<Spectrum>,
}

fn tungsten(references: &References) -> AppResult<&Spectrum> {
    references.tungsten.as_ref().ok_or(SpectroError::NotCalibrated)
}

fn ultraviolet(references: &References) -> AppResult<&Spectrum> {
    references
        .ultraviolet
        .as_ref()
        .ok_or(SpectroError::NotCalibrated)
}

fn dark(references: &References) -> AppResult<&Spectrum> {
    references.dark.as_ref().ok_or(SpectroError::NotCalibrated)
}

fn dual_results(results: DualResults) -> Results {
    vec![
        (IlluminationCondition::M0, results.m0),
        (IlluminationCondition::M1, results.m1),
        (IlluminationCondition::M2, results.m2),
    ]
}

fn flash_not_for_reflectance() -> SpectroError {
    SpectroError::InvalidArgument(
        "flash recognition is only available for ambient light scans".to_string(),
    )
}

fn direction_not_set() -> SpectroError {
    SpectroError::InvalidArgument(format!("set {} before a dual scan", keys::SCAN_DIRECTION))
}

fn read_only(key: &str) -> SpectroError {
    SpectroError::InvalidArgument(format!("{} is read-only", key))
}

fn seconds_or_unset(value: Option<std::time::Duration>) -> String {
    value.map_or_else(|| "-1".to_string(), |d| d.as_secs().to_string())
}

impl DeviceState {
    /// Fresh state: every option at its default, nothing calibrated.
    pub fn new(capabilities: DeviceCapabilities, config: &SpectroConfig) -> Self {
        Self {
            capabilities,
            scan: config.scan.clone(),
            options: DeviceOptions::new(),
            calibration: CalibrationManager::new(config.calibration.clone()),
            modes: ModeState::new(),
            direction: ScanDirection::Undefined,
            pending: None,
            reference_line: None,
            recognized_patches: 0,
            last_scan_direction: LastScanDirection::Undefined,
            last_auto_density: None,
            substrate: None,
        }
    }

    /// Static device description.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Active mode.
    pub fn mode(&self) -> MeasurementMode {
        self.modes.mode()
    }

    /// Calibration records.
    pub fn calibration(&self) -> &CalibrationManager {
        &self.calibration
    }

    /// True while a dual forward pass waits for its backward pass.
    pub fn has_pending_forward(&self) -> bool {
        self.pending.is_some()
    }

    // ========================================================================
    // Mode and direction
    // ========================================================================

    /// Switch the measurement mode.
    ///
    /// Cached results are flushed and a pending forward pass is dropped; the
    /// calibration of the target mode is left as it is.
    pub async fn set_mode(
        &mut self,
        transport: &dyn Transport,
        mode: MeasurementMode,
    ) -> AppResult<()> {
        if mode != MeasurementMode::Undefined && !self.capabilities.supports(mode) {
            return Err(SpectroError::NotLicensed(format!(
                "{} is not available on this device",
                mode
            )));
        }
        self.abort_pending(transport).await?;
        self.modes.set_mode(mode);
        self.recognized_patches = 0;
        info!(%mode, "measurement mode set");
        Ok(())
    }

    /// Set the direction of the next dual pass. Forward drops a pending
    /// forward pass.
    pub async fn set_direction(
        &mut self,
        transport: &dyn Transport,
        direction: ScanDirection,
    ) -> AppResult<()> {
        if direction == ScanDirection::Forward {
            self.abort_pending(transport).await?;
        }
        self.direction = direction;
        Ok(())
    }

    async fn abort_pending(&mut self, transport: &dyn Transport) -> AppResult<()> {
        if self.pending.take().is_some() {
            transport.set_position_streaming(false).await?;
            debug!("pending forward pass dropped");
        }
        Ok(())
    }

    // ========================================================================
    // Calibration
    // ========================================================================

    /// Calibrate the active mode on the white tile.
    ///
    /// Off the tile nothing changes. Any other failure, including a failed
    /// tile check, invalidates every mode of the device.
    #[instrument(skip_all, fields(mode = %self.modes.mode()))]
    pub async fn calibrate(
        &mut self,
        transport: &dyn Transport,
        events: &EventEmitter,
    ) -> AppResult<()> {
        let mode = self.modes.require_mode()?;
        match transport.is_on_white_tile().await {
            Ok(true) => {}
            Ok(false) => return Err(SpectroError::NotOnWhiteTile),
            Err(e) => return Err(self.calibration_failed(e)),
        }
        if let Err(e) = self.abort_pending(transport).await {
            return Err(self.calibration_failed(e));
        }

        let lamp = LampCheck {
            precision: self.options.precision_calibration(),
            simulate_restore: self.options.simulate_lamp_restore(),
        };
        self.calibration.begin(mode);
        let config = self.calibration.config().clone();
        let outcome = acquire_references(transport, mode, lamp, &config, || {
            events.emit(DeviceEventKind::LampRestore)
        })
        .await;

        match outcome {
            Ok(outcome) => {
                self.calibration
                    .commit(mode, outcome.references, outcome.lamp_restored, Instant::now());
                Ok(())
            }
            Err(e) => Err(self.calibration_failed(e)),
        }
    }

    fn calibration_failed(&mut self, e: SpectroError) -> SpectroError {
        warn!(error = %e, "calibration failed, all modes invalidated");
        self.calibration.invalidate_all();
        e
    }

    // ========================================================================
    // Trigger
    // ========================================================================

    /// Run one measurement in the active mode.
    ///
    /// `global_no_led` is the engine-wide LED suppression, used unless the
    /// device overrides it.
    #[instrument(skip_all, fields(mode = %self.modes.mode()))]
    pub async fn trigger(
        &mut self,
        transport: &dyn Transport,
        events: &EventEmitter,
        global_no_led: bool,
    ) -> AppResult<()> {
        let mode = self.modes.require_mode()?;
        let references = self.calibration.references(mode, Instant::now())?.clone();
        if mode == MeasurementMode::DualReflectanceScan
            && self.direction == ScanDirection::Undefined
        {
            return Err(direction_not_set());
        }
        self.modes.samples_mut().flush();
        transport.flush().await?;

        let indicate = self.capabilities.has_indicator_led
            && !self.options.no_led_indication().unwrap_or(global_no_led);

        let outcome = match mode {
            MeasurementMode::Undefined => Err(SpectroError::NoMeasureModeSet),
            MeasurementMode::ReflectanceSpot => self.reflectance_spot(transport, &references).await,
            MeasurementMode::DualReflectanceSpot => self.dual_spot(transport, &references).await,
            MeasurementMode::EmissionSpot => {
                self.emissive_spot(transport, &references, LightSource::Emissive)
                    .await
            }
            MeasurementMode::AmbientLightSpot => {
                self.emissive_spot(transport, &references, LightSource::Ambient)
                    .await
            }
            MeasurementMode::ReflectanceScan => {
                self.reflectance_scan(transport, events, &references).await
            }
            MeasurementMode::AmbientLightScan => {
                self.ambient_scan(transport, events, &references).await
            }
            MeasurementMode::DualReflectanceScan => {
                self.dual_scan(transport, events, &references, indicate)
                    .await
            }
        };

        match outcome {
            Ok(Some(results)) => {
                let committed = results.first().map_or(0, |(_, s)| s.len());
                self.modes.samples_mut().commit(results);
                self.calibration.count_measurement(mode);
                if indicate {
                    Self::indicate(transport, IndicatorLed::Succeeded).await;
                }
                info!(samples = committed, "measurement committed");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                if indicate {
                    Self::indicate(transport, IndicatorLed::Failed).await;
                }
                warn!(error = %e, category = %e.category(), "measurement failed");
                Err(e)
            }
        }
    }

    async fn indicate(transport: &dyn Transport, led: IndicatorLed) {
        if let Err(e) = transport.set_indicator(led).await {
            warn!(error = %e, %led, "indicator LED not set");
        }
    }

    fn exposure(&self) -> Exposure {
        if self.options.adaptive_measurement() {
            Exposure::Adaptive
        } else {
            Exposure::Fixed
        }
    }

    async fn reflectance_spot(
        &mut self,
        transport: &dyn Transport,
        references: &References,
    ) -> AppResult<Option<Results>> {
        let white = tungsten(references)?;
        let raw = transport.read_spot(LightSource::Tungsten, Exposure::Fixed).await?;
        let condition = reflective_condition(&self.capabilities);
        Ok(Some(vec![(condition, vec![reflectance(&raw, white)])]))
    }

    async fn dual_spot(
        &mut self,
        transport: &dyn Transport,
        references: &References,
    ) -> AppResult<Option<Results>> {
        let white = tungsten(references)?;
        let uv_white = ultraviolet(references)?;
        let raw = transport.read_spot(LightSource::Tungsten, Exposure::Fixed).await?;
        let uv = transport
            .read_spot(LightSource::Ultraviolet, Exposure::Fixed)
            .await?;
        let fluorescence = reflectance(&uv, uv_white).map(|v| v.max(0.0));
        let results = dual::combine(vec![reflectance(&raw, white)], &[fluorescence]);
        Ok(Some(dual_results(results)))
    }

    async fn emissive_spot(
        &mut self,
        transport: &dyn Transport,
        references: &References,
        source: LightSource,
    ) -> AppResult<Option<Results>> {
        let dark = dark(references)?;
        let raw = transport.read_spot(source, self.exposure()).await?;
        Ok(Some(vec![(
            IlluminationCondition::Emissive,
            vec![dark_corrected(&raw, dark)],
        )]))
    }

    async fn capture_pass(
        &self,
        transport: &dyn Transport,
        events: &EventEmitter,
        source: LightSource,
    ) -> AppResult<ScanCapture> {
        transport.prepare_scan(source).await?;
        events.emit(DeviceEventKind::ScanReadyToMove).await;
        let capture = transport
            .capture_scan(source, self.scan.pass_timeout())
            .await?;
        debug!(
            %source,
            samples = capture.samples.len(),
            ruler = capture.ruler.len(),
            "pass captured"
        );
        Ok(capture)
    }

    async fn reflectance_scan(
        &mut self,
        transport: &dyn Transport,
        events: &EventEmitter,
        references: &References,
    ) -> AppResult<Option<Results>> {
        let policy = self.options.recognition();
        let patches_per_line = self.options.patches_per_line();
        let line = match policy {
            RecognitionPolicy::Flash => return Err(flash_not_for_reflectance()),
            RecognitionPolicy::Correlation => Some(
                self.reference_line
                    .take()
                    .ok_or(SpectroError::NoReferenceChartLine)?,
            ),
            RecognitionPolicy::Position if patches_per_line < recognition::MIN_POSITION_PATCHES => {
                return Err(SpectroError::InvalidArgument(format!(
                    "position recognition needs {} >= {}",
                    keys::PATCHES_PER_LINE,
                    recognition::MIN_POSITION_PATCHES
                )));
            }
            _ => None,
        };
        self.recognized_patches = 0;

        let white = tungsten(references)?;
        let capture = self
            .capture_pass(transport, events, LightSource::Tungsten)
            .await?;
        if capture.duration() > self.scan.pass_timeout() {
            return Err(SpectroError::UserTimeout);
        }
        if !capture.ruler.is_empty() {
            self.last_scan_direction = travel_direction(&capture.ruler);
        }

        let normalized = normalize(&capture.samples, white);
        let spectra: Vec<Spectrum> = normalized.iter().map(|(_, s)| s.clone()).collect();
        let min_samples = if self.options.low_resolution() {
            (self.scan.min_patch_samples / 2).max(1)
        } else {
            self.scan.min_patch_samples
        };

        let patches = match (policy, line) {
            (RecognitionPolicy::Correlation, Some(line)) => {
                let mut patches =
                    recognition::basic(&spectra, self.scan.edge_threshold, min_samples)?;
                self.recognized_patches = patches.len();
                let correlation = line.correlate(&patches, self.scan.correlation_threshold)?;
                debug!(
                    coefficient = correlation.coefficient,
                    reversed = correlation.reversed,
                    "chart line matched"
                );
                if correlation.reversed {
                    patches.reverse();
                }
                patches
            }
            (RecognitionPolicy::Basic, _) | (RecognitionPolicy::Correlation, None) => {
                recognition::basic(&spectra, self.scan.edge_threshold, min_samples)?
            }
            (RecognitionPolicy::Position, _) => {
                let located = recognition::locate(&normalized, &capture.ruler);
                recognition::position(&located, &capture.ruler, patches_per_line)?
            }
            (RecognitionPolicy::Disabled, _) => recognition::disabled(&spectra)?,
            (RecognitionPolicy::Flash, _) => return Err(flash_not_for_reflectance()),
        };
        self.recognized_patches = patches.len();
        debug!(patches = patches.len(), %policy, "strip recognized");

        let condition = reflective_condition(&self.capabilities);
        Ok(Some(vec![(condition, patches)]))
    }

    async fn ambient_scan(
        &mut self,
        transport: &dyn Transport,
        events: &EventEmitter,
        references: &References,
    ) -> AppResult<Option<Results>> {
        self.recognized_patches = 0;
        let dark = dark(references)?;
        let capture = self
            .capture_pass(transport, events, LightSource::Ambient)
            .await?;
        if capture.duration() > self.scan.pass_timeout() {
            return Err(SpectroError::UserTimeout);
        }
        let spectra: Vec<Spectrum> = capture
            .samples
            .iter()
            .map(|s| dark_corrected(&s.spectrum, dark))
            .collect();
        let flashes = recognition::flash(&spectra, self.scan.flash_ratio)?;
        self.recognized_patches = flashes.len();
        Ok(Some(vec![(IlluminationCondition::Emissive, flashes)]))
    }

    async fn dual_scan(
        &mut self,
        transport: &dyn Transport,
        events: &EventEmitter,
        references: &References,
        indicate: bool,
    ) -> AppResult<Option<Results>> {
        match self.direction {
            ScanDirection::Undefined => Err(direction_not_set()),
            ScanDirection::Forward => {
                self.abort_pending(transport).await?;
                self.forward_pass(transport, events, references, indicate)
                    .await?;
                Ok(None)
            }
            ScanDirection::Backward => {
                let pending = self.pending.take().ok_or_else(|| {
                    SpectroError::WrongCallOrder(
                        "backward pass without a forward pass".to_string(),
                    )
                })?;
                let outcome = self
                    .backward_pass(transport, events, references, pending)
                    .await;
                if let Err(e) = transport.set_position_streaming(false).await {
                    warn!(error = %e, "position streaming not stopped");
                }
                outcome.map(Some)
            }
        }
    }

    async fn forward_pass(
        &mut self,
        transport: &dyn Transport,
        events: &EventEmitter,
        references: &References,
        indicate: bool,
    ) -> AppResult<()> {
        let white = tungsten(references)?;
        let limits = PassLimits::new(&self.scan, self.capabilities.max_ruler_length_mm);
        let capture = self
            .capture_pass(transport, events, LightSource::Tungsten)
            .await?;
        let pass = dual::forward(&capture, white, &limits)?;
        self.last_scan_direction = pass.direction;
        self.recognized_patches = pass.patches.len();

        transport.set_position_streaming(true).await?;
        if indicate {
            let led = match pass.direction {
                LastScanDirection::LeftToRight => IndicatorLed::WaitForScanLeft,
                LastScanDirection::RightToLeft => IndicatorLed::WaitForScanRight,
                LastScanDirection::Undefined => IndicatorLed::WaitForScan,
            };
            Self::indicate(transport, led).await;
        }
        info!(patches = pass.patches.len(), "forward pass done, waiting for backward pass");
        self.pending = Some(PendingForward {
            pass,
            completed_at: Instant::now(),
        });
        Ok(())
    }

    async fn backward_pass(
        &mut self,
        transport: &dyn Transport,
        events: &EventEmitter,
        references: &References,
        pending: PendingForward,
    ) -> AppResult<Results> {
        if pending.completed_at.elapsed() > self.scan.backward_idle_timeout() {
            return Err(SpectroError::UserTimeout);
        }
        let uv_white = ultraviolet(references)?;
        let capture = self
            .capture_pass(transport, events, LightSource::Ultraviolet)
            .await?;
        let fluorescence =
            dual::backward(&capture, uv_white, &pending.pass, self.scan.pass_timeout())?;
        let mut results = dual::combine(pending.pass.m0, &fluorescence);

        if self.options.recognition() == RecognitionPolicy::Correlation {
            if let Some(line) = self.reference_line.take() {
                let correlation = line.correlate(&results.m0, self.scan.correlation_threshold)?;
                if correlation.reversed {
                    results.reverse();
                }
            }
        }
        if !capture.ruler.is_empty() {
            self.last_scan_direction = travel_direction(&capture.ruler);
        }
        self.recognized_patches = results.len();
        Ok(dual_results(results))
    }

    // ========================================================================
    // Results
    // ========================================================================

    /// Result set the accessors read.
    pub fn result_condition(&self) -> Option<IlluminationCondition> {
        let available = available_result_indexes(self.modes.mode(), &self.capabilities);
        self.options
            .result_index()
            .filter(|c| available.contains(c))
            .or_else(|| available.first().copied())
    }

    /// Number of results in the selected set.
    pub fn sample_count(&self) -> usize {
        self.result_condition()
            .map_or(0, |c| self.modes.samples().count(c))
    }

    /// Result `index` of the selected set.
    pub fn sample(&self, index: usize) -> AppResult<&MeasurementSample> {
        let condition = self
            .result_condition()
            .ok_or(SpectroError::NoDataAvailable)?;
        self.modes.samples().get(condition, index)
    }

    /// Spectrum of result `index`.
    pub fn spectrum(&self, index: usize) -> AppResult<Spectrum> {
        Ok(self.sample(index)?.spectrum.clone())
    }

    fn colorimetric_reflectance(&self, sample: &MeasurementSample) -> AppResult<Spectrum> {
        match self.options.colorimetric().white_base {
            WhiteBase::Absolute => Ok(sample.spectrum.clone()),
            WhiteBase::Paper => {
                let substrate = self
                    .substrate
                    .as_ref()
                    .ok_or(SpectroError::NoSubstrateWhite)?;
                Ok(relative_to_substrate(&sample.spectrum, substrate))
            }
        }
    }

    /// Tristimulus of result `index` under the current colorimetric options.
    pub fn tristimulus(&self, index: usize) -> AppResult<Tristimulus> {
        let sample = self.sample(index)?;
        let settings = self.options.colorimetric();
        if sample.condition == IlluminationCondition::Emissive {
            return Ok(emissive_tristimulus(&sample.spectrum, &settings));
        }
        let spectrum = self.colorimetric_reflectance(sample)?;
        Ok(reflective_tristimulus(&spectrum, &settings))
    }

    /// C, M, Y and visual densities of result `index`.
    pub fn densities(&self, index: usize) -> AppResult<Densities> {
        let sample = self.sample(index)?;
        if sample.condition == IlluminationCondition::Emissive {
            return Err(SpectroError::InvalidArgument(
                "densities need a reflective result".to_string(),
            ));
        }
        Ok(densities(&self.colorimetric_reflectance(sample)?))
    }

    /// Density of result `index` through the configured filter.
    ///
    /// With the automatic filter the strongest chromatic filter is used and
    /// reported by `LastAutoDensityFilter`.
    pub fn density(&mut self, index: usize) -> AppResult<f64> {
        let all = self.densities(index)?;
        let filter = match self.options.density_filter() {
            DensityFilter::Auto => {
                let chosen = DensityFilter::from_index(auto_density_index(&all))
                    .unwrap_or(DensityFilter::Cyan);
                self.last_auto_density = Some(chosen);
                chosen
            }
            other => other,
        };
        Ok(filter.index().map_or(0.0, |i| all[i]))
    }

    /// Store the chart line for the next correlation scan.
    pub fn set_reference_line(&mut self, values: Vec<f64>, patch_count: usize) -> AppResult<()> {
        let line = ReferenceLine::new(self.options.reference_color_space(), values, patch_count)?;
        debug!(patches = patch_count, color_space = %line.color_space(), "reference line set");
        self.reference_line = Some(line);
        Ok(())
    }

    /// Store the paper white for paper-relative colorimetry.
    pub fn set_substrate(&mut self, substrate: Spectrum) -> AppResult<()> {
        if !substrate.is_finite() || substrate.values().iter().any(|v| *v <= 0.0) {
            return Err(SpectroError::InvalidArgument(
                "substrate must be a positive, finite reflectance".to_string(),
            ));
        }
        self.substrate = Some(substrate);
        Ok(())
    }

    // ========================================================================
    // Options
    // ========================================================================

    /// Read a device option. `global_no_led` backs the LED key when the
    /// device has no override.
    pub fn get_option(&self, key: &str, global_no_led: bool) -> AppResult<String> {
        let caps = &self.capabilities;
        let mode = self.modes.mode();
        let now = Instant::now();
        let value = match key {
            keys::MEASUREMENT_MODE => mode.to_string(),
            keys::SCAN_DIRECTION => self.direction.to_string(),
            keys::LAST_SCAN_DIRECTION => self.last_scan_direction.to_string(),
            keys::RESULT_INDEX => self
                .result_condition()
                .map(|c| c.to_string())
                .unwrap_or_default(),
            keys::AVAILABLE_RESULT_INDEXES => {
                join_values(available_result_indexes(mode, caps).iter().map(|c| c.as_str()))
            }
            keys::AVAILABLE_MEASUREMENT_MODES => {
                join_values(caps.available_modes().iter().map(|m| m.as_str()))
            }
            keys::AVAILABLE_RECOGNITIONS => {
                join_values(caps.available_recognitions().iter().map(|r| r.as_str()))
            }
            keys::RECOGNIZED_PATCHES => self.recognized_patches.to_string(),
            keys::TIME_SINCE_CALIBRATION => {
                seconds_or_unset(self.calibration.time_since_calibration(mode, now))
            }
            keys::TIME_UNTIL_CALIBRATION_EXPIRE => {
                seconds_or_unset(self.calibration.time_until_expiry(mode, now))
            }
            keys::MEASURE_COUNT => self.calibration.measure_count(mode).to_string(),
            keys::LAST_AUTO_DENSITY_FILTER => self
                .last_auto_density
                .map(|f| f.to_string())
                .unwrap_or_default(),
            keys::NO_LED_INDICATION => {
                bool_value(self.options.no_led_indication().unwrap_or(global_no_led)).to_string()
            }
            keys::SERIAL_NUMBER => caps.serial_number.clone(),
            keys::DEVICE_PATH => caps.device_path.clone(),
            keys::DEVICE_TYPE => crate::options::DEVICE_TYPE.to_string(),
            keys::HW_REVISION => caps.hw_revision.clone(),
            keys::SUPPLIER_NAME => caps.supplier_name.clone(),
            keys::HAS_UV_LED => bool_value(caps.has_uv_led).to_string(),
            keys::HAS_UV_CUT_FILTER => bool_value(caps.has_uv_cut_filter).to_string(),
            keys::HAS_WAVELENGTH_LED => bool_value(caps.has_wavelength_led).to_string(),
            keys::HAS_ZEBRA_RULER => bool_value(caps.has_zebra_ruler).to_string(),
            keys::HAS_INDICATOR_LED => bool_value(caps.has_indicator_led).to_string(),
            keys::HAS_AMBIENT_LIGHT => bool_value(caps.has_ambient_light).to_string(),
            keys::HAS_LOW_RESOLUTION => bool_value(caps.has_low_resolution).to_string(),
            keys::MAX_RULER_LENGTH => format!("{}", caps.max_ruler_length_mm),
            keys::INDICATOR_LED | keys::RESET => {
                return Err(SpectroError::InvalidArgument(format!(
                    "{} is write-only",
                    key
                )))
            }
            other => self.options.get(other).ok_or_else(|| {
                SpectroError::InvalidArgument(format!("unknown option '{}'", other))
            })?,
        };
        Ok(value)
    }

    /// Write a device option.
    pub async fn set_option(
        &mut self,
        transport: &dyn Transport,
        key: &str,
        value: &str,
    ) -> AppResult<()> {
        match key {
            keys::MEASUREMENT_MODE => self.set_mode(transport, value.parse()?).await,
            keys::SCAN_DIRECTION => self.set_direction(transport, value.parse()?).await,
            keys::RESULT_INDEX => {
                let condition: IlluminationCondition = value.parse()?;
                let available = available_result_indexes(self.modes.mode(), &self.capabilities);
                if !available.contains(&condition) {
                    return Err(SpectroError::InvalidArgument(format!(
                        "result index {} is not available in {}",
                        condition,
                        self.modes.mode()
                    )));
                }
                self.options.set_result_index(condition);
                Ok(())
            }
            keys::INDICATOR_LED => {
                let led: IndicatorLed = value.parse()?;
                if !self.capabilities.has_indicator_led {
                    return Err(SpectroError::NotLicensed(
                        "device has no indicator LEDs".to_string(),
                    ));
                }
                transport.set_indicator(led).await
            }
            keys::NO_LED_INDICATION => self.options.set_no_led_indication(value),
            keys::RESET => self.reset(transport, value).await,
            keys::SDK_VERSION
            | keys::SERIAL_NUMBER
            | keys::DEVICE_PATH
            | keys::DEVICE_TYPE
            | keys::HW_REVISION
            | keys::SUPPLIER_NAME
            | keys::HAS_UV_LED
            | keys::HAS_UV_CUT_FILTER
            | keys::HAS_WAVELENGTH_LED
            | keys::HAS_ZEBRA_RULER
            | keys::HAS_INDICATOR_LED
            | keys::HAS_AMBIENT_LIGHT
            | keys::HAS_LOW_RESOLUTION
            | keys::MAX_RULER_LENGTH
            | keys::AVAILABLE_MEASUREMENT_MODES
            | keys::AVAILABLE_RECOGNITIONS
            | keys::AVAILABLE_RESULT_INDEXES
            | keys::RECOGNIZED_PATCHES
            | keys::LAST_SCAN_DIRECTION
            | keys::TIME_SINCE_CALIBRATION
            | keys::TIME_UNTIL_CALIBRATION_EXPIRE
            | keys::MEASURE_COUNT
            | keys::LAST_AUTO_DENSITY_FILTER => Err(read_only(key)),
            other => self.options.set(other, value),
        }
    }

    /// Device `Reset`.
    ///
    /// `MeasurementMode` restores the option defaults and forgets the scan
    /// setup; `All` also returns to `Undefined` with nothing cached.
    /// Calibration records survive both.
    pub async fn reset(&mut self, transport: &dyn Transport, scope: &str) -> AppResult<()> {
        match scope {
            RESET_MEASUREMENT_MODE => {
                self.options.reset();
                self.set_direction(transport, ScanDirection::Undefined).await?;
                self.abort_pending(transport).await?;
                self.reference_line = None;
            }
            RESET_ALL => {
                self.options.reset();
                self.abort_pending(transport).await?;
                self.direction = ScanDirection::Undefined;
                self.modes.reset();
                self.reference_line = None;
                self.substrate = None;
                self.recognized_patches = 0;
                self.last_scan_direction = LastScanDirection::Undefined;
                self.last_auto_density = None;
            }
            other => {
                return Err(SpectroError::InvalidArgument(format!(
                    "unknown reset scope '{}'",
                    other
                )))
            }
        }
        info!(scope, "device options reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::events::Dispatcher;
    use crate::hardware::mock::{patch_reflectance, Pass, SimulatedInstrument, Strip};
    use crate::session::DeviceHandle;
    use std::sync::Arc;

    async fn setup() -> (DeviceState, Arc<SimulatedInstrument>, EventEmitter) {
        let device = Arc::new(SimulatedInstrument::new("1000001"));
        device.claim().await.unwrap();
        let state = DeviceState::new(device.capabilities().clone(), &SpectroConfig::default());
        let emitter = EventEmitter::new(
            Dispatcher::spawn(&SessionConfig::default()),
            DeviceHandle::from_raw(1),
            Arc::new(tokio::sync::RwLock::new(())),
        );
        (state, device, emitter)
    }

    #[tokio::test]
    async fn test_reflectance_spot_round_trip() {
        let (mut state, device, events) = setup().await;
        state
            .set_mode(device.as_ref(), MeasurementMode::ReflectanceSpot)
            .await
            .unwrap();
        state.calibrate(device.as_ref(), &events).await.unwrap();

        device.set_reflectance(patch_reflectance(3));
        state.trigger(device.as_ref(), &events, false).await.unwrap();
        assert_eq!(state.sample_count(), 1);
        let measured = state.spectrum(0).unwrap();
        assert!(measured.rms_distance(&patch_reflectance(3)) < 1e-9);
        assert_eq!(state.spectrum(1), Err(SpectroError::NoDataAvailable));
        assert_eq!(device.indicator(), Some(IndicatorLed::Succeeded));
        assert_eq!(state.get_option(keys::MEASURE_COUNT, false).unwrap(), "1");
    }

    #[tokio::test]
    async fn test_not_calibrated_does_no_io() {
        let (mut state, device, events) = setup().await;
        state
            .set_mode(device.as_ref(), MeasurementMode::ReflectanceSpot)
            .await
            .unwrap();
        let before = device.io_count();
        assert_eq!(
            state.trigger(device.as_ref(), &events, false).await,
            Err(SpectroError::NotCalibrated)
        );
        assert_eq!(device.io_count(), before);
        assert_eq!(device.flush_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_mode_is_not_licensed() {
        let device = Arc::new(SimulatedInstrument::with_capabilities(DeviceCapabilities {
            has_uv_led: false,
            ..SimulatedInstrument::new("2").capabilities().clone()
        }));
        let mut state = DeviceState::new(device.capabilities().clone(), &SpectroConfig::default());
        assert!(matches!(
            state
                .set_mode(device.as_ref(), MeasurementMode::DualReflectanceScan)
                .await,
            Err(SpectroError::NotLicensed(_))
        ));
        assert_eq!(state.mode(), MeasurementMode::Undefined);
    }

    #[tokio::test]
    async fn test_off_tile_calibration_changes_nothing() {
        let (mut state, device, events) = setup().await;
        state
            .set_mode(device.as_ref(), MeasurementMode::ReflectanceSpot)
            .await
            .unwrap();
        state.calibrate(device.as_ref(), &events).await.unwrap();
        device.set_on_white_tile(false);
        assert_eq!(
            state.calibrate(device.as_ref(), &events).await,
            Err(SpectroError::NotOnWhiteTile)
        );
        assert!(state
            .calibration()
            .is_calibrated(MeasurementMode::ReflectanceSpot, Instant::now()));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_failed_calibration_is_logged() {
        let (mut state, device, events) = setup().await;
        state
            .set_mode(device.as_ref(), MeasurementMode::ReflectanceSpot)
            .await
            .unwrap();
        device.set_corrupt(true);
        tokio_test::assert_err!(state.calibrate(device.as_ref(), &events).await);
        assert!(logs_contain("calibration failed, all modes invalidated"));
    }

    #[tokio::test]
    async fn test_failed_tile_check_invalidates_all_modes() {
        let (mut state, device, events) = setup().await;
        state
            .set_mode(device.as_ref(), MeasurementMode::ReflectanceSpot)
            .await
            .unwrap();
        state.calibrate(device.as_ref(), &events).await.unwrap();
        state
            .set_mode(device.as_ref(), MeasurementMode::EmissionSpot)
            .await
            .unwrap();

        device.fail_next(SpectroError::Communication("usb".into()));
        assert_eq!(
            state.calibrate(device.as_ref(), &events).await,
            Err(SpectroError::Communication("usb".into()))
        );
        assert!(!state
            .calibration()
            .is_calibrated(MeasurementMode::ReflectanceSpot, Instant::now()));
    }

    #[tokio::test]
    async fn test_mode_change_drops_pending_forward() {
        let (mut state, device, events) = setup().await;
        state
            .set_mode(device.as_ref(), MeasurementMode::DualReflectanceScan)
            .await
            .unwrap();
        state.calibrate(device.as_ref(), &events).await.unwrap();
        let strip = Strip::test_chart(5, 8.0);
        device.set_strip(strip.clone());
        device.queue_pass(Pass::over(&strip));
        state
            .set_direction(device.as_ref(), ScanDirection::Forward)
            .await
            .unwrap();
        state.trigger(device.as_ref(), &events, false).await.unwrap();
        assert!(state.has_pending_forward());

        state
            .set_mode(device.as_ref(), MeasurementMode::ReflectanceSpot)
            .await
            .unwrap();
        assert!(!state.has_pending_forward());
        assert!(!device.position_streaming());
    }

    #[tokio::test]
    async fn test_basic_scan_recognizes_strip() {
        let (mut state, device, events) = setup().await;
        state
            .set_mode(device.as_ref(), MeasurementMode::ReflectanceScan)
            .await
            .unwrap();
        state
            .set_option(device.as_ref(), keys::RECOGNITION, "RecognitionBasic")
            .await
            .unwrap();
        state.calibrate(device.as_ref(), &events).await.unwrap();

        let strip = Strip::test_chart(5, 8.0);
        device.set_strip(strip.clone());
        device.queue_pass(Pass::over(&strip));
        state.trigger(device.as_ref(), &events, false).await.unwrap();

        assert_eq!(state.sample_count(), 5);
        for (i, expected) in strip.patches.iter().enumerate() {
            assert!(state.spectrum(i).unwrap().rms_distance(expected) < 1e-6);
        }
        assert_eq!(state.get_option(keys::RECOGNIZED_PATCHES, false).unwrap(), "5");
        assert_eq!(
            state.get_option(keys::LAST_SCAN_DIRECTION, false).unwrap(),
            "1"
        );
    }

    #[tokio::test]
    async fn test_correlation_needs_reference_line() {
        let (mut state, device, events) = setup().await;
        state
            .set_mode(device.as_ref(), MeasurementMode::ReflectanceScan)
            .await
            .unwrap();
        state
            .set_option(device.as_ref(), keys::RECOGNITION, "RecognitionCorrelation")
            .await
            .unwrap();
        state.calibrate(device.as_ref(), &events).await.unwrap();
        assert_eq!(
            state.trigger(device.as_ref(), &events, false).await,
            Err(SpectroError::NoReferenceChartLine)
        );
    }

    #[tokio::test]
    async fn test_paper_white_needs_substrate() {
        let (mut state, device, events) = setup().await;
        state
            .set_mode(device.as_ref(), MeasurementMode::ReflectanceSpot)
            .await
            .unwrap();
        state.calibrate(device.as_ref(), &events).await.unwrap();
        state.trigger(device.as_ref(), &events, false).await.unwrap();

        state
            .set_option(device.as_ref(), keys::WHITE_BASE, "WhiteBasePaper")
            .await
            .unwrap();
        assert_eq!(state.tristimulus(0), Err(SpectroError::NoSubstrateWhite));
        state.set_substrate(Spectrum::flat(0.9)).unwrap();
        assert!(state.tristimulus(0).is_ok());
    }

    #[tokio::test]
    async fn test_auto_density_reports_filter() {
        let (mut state, device, events) = setup().await;
        state
            .set_mode(device.as_ref(), MeasurementMode::ReflectanceSpot)
            .await
            .unwrap();
        state.calibrate(device.as_ref(), &events).await.unwrap();
        device.set_reflectance(Spectrum::from_fn(|nm| if nm > 600.0 { 0.05 } else { 0.8 }));
        state.trigger(device.as_ref(), &events, false).await.unwrap();

        let d = state.density(0).unwrap();
        assert!(d > 0.5);
        assert_eq!(
            state.get_option(keys::LAST_AUTO_DENSITY_FILTER, false).unwrap(),
            "DensityFilterCyan"
        );
    }

    #[tokio::test]
    async fn test_read_only_and_write_only_keys() {
        let (mut state, device, _) = setup().await;
        assert!(matches!(
            state.set_option(device.as_ref(), keys::SERIAL_NUMBER, "x").await,
            Err(SpectroError::InvalidArgument(_))
        ));
        assert!(state.get_option(keys::INDICATOR_LED, false).is_err());
        assert_eq!(
            state.get_option(keys::TIME_SINCE_CALIBRATION, false).unwrap(),
            "-1"
        );
        assert_eq!(state.get_option(keys::NO_LED_INDICATION, true).unwrap(), "1");
        state
            .set_option(device.as_ref(), keys::NO_LED_INDICATION, "0")
            .await
            .unwrap();
        assert_eq!(state.get_option(keys::NO_LED_INDICATION, true).unwrap(), "0");
    }
}
