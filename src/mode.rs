//! Measurement mode state and the per-device result cache.
//!
//! The active mode starts as `Undefined`. Changing it is always allowed and
//! always flushes the cache, so results of one mode are never read back in
//! another. Calibration records live in [`crate::calibration`] and are not
//! touched here.
//!
//! Results are grouped by illumination condition. Which group the accessors
//! read is chosen with the result index; a device with a physical UV cut
//! filter only ever produces M2.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::error::{AppResult, SpectroError};
use crate::hardware::transport::DeviceCapabilities;
use crate::measurement::{IlluminationCondition, MeasurementMode, MeasurementSample, Spectrum};

/// Result conditions a device produces in `mode`.
pub fn available_result_indexes(
    mode: MeasurementMode,
    capabilities: &DeviceCapabilities,
) -> Vec<IlluminationCondition> {
    match mode {
        MeasurementMode::Undefined => Vec::new(),
        MeasurementMode::EmissionSpot
        | MeasurementMode::AmbientLightSpot
        | MeasurementMode::AmbientLightScan => vec![IlluminationCondition::Emissive],
        MeasurementMode::DualReflectanceSpot | MeasurementMode::DualReflectanceScan => vec![
            IlluminationCondition::M0,
            IlluminationCondition::M1,
            IlluminationCondition::M2,
        ],
        MeasurementMode::ReflectanceSpot | MeasurementMode::ReflectanceScan => {
            if capabilities.has_uv_cut_filter {
                vec![IlluminationCondition::M2]
            } else {
                vec![IlluminationCondition::M0]
            }
        }
    }
}

/// Condition of a single-illuminant reflective reading on this device.
pub fn reflective_condition(capabilities: &DeviceCapabilities) -> IlluminationCondition {
    if capabilities.has_uv_cut_filter {
        IlluminationCondition::M2
    } else {
        IlluminationCondition::M0
    }
}

/// Cached results, grouped by condition.
#[derive(Debug, Clone, Default)]
pub struct SampleCache {
    by_condition: BTreeMap<IlluminationCondition, Vec<MeasurementSample>>,
}

impl SampleCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything with the results of one trigger.
    pub fn commit(&mut self, results: Vec<(IlluminationCondition, Vec<Spectrum>)>) {
        let measured_at = Utc::now();
        self.by_condition.clear();
        for (condition, spectra) in results {
            let samples = spectra
                .into_iter()
                .enumerate()
                .map(|(index, spectrum)| MeasurementSample {
                    index,
                    condition,
                    spectrum,
                    measured_at,
                })
                .collect();
            self.by_condition.insert(condition, samples);
        }
    }

    /// Drop all results.
    pub fn flush(&mut self) {
        self.by_condition.clear();
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.by_condition.values().all(Vec::is_empty)
    }

    /// Number of results for `condition`.
    pub fn count(&self, condition: IlluminationCondition) -> usize {
        self.by_condition.get(&condition).map_or(0, Vec::len)
    }

    /// Result `index` for `condition`.
    pub fn get(
        &self,
        condition: IlluminationCondition,
        index: usize,
    ) -> AppResult<&MeasurementSample> {
        self.by_condition
            .get(&condition)
            .and_then(|samples| samples.get(index))
            .ok_or(SpectroError::NoDataAvailable)
    }
}

/// Active mode plus its results.
#[derive(Debug, Clone, Default)]
pub struct ModeState {
    mode: MeasurementMode,
    samples: SampleCache,
}

impl ModeState {
    /// `Undefined`, no results.
    pub fn new() -> Self {
        Self::default()
    }

    /// Active mode.
    pub fn mode(&self) -> MeasurementMode {
        self.mode
    }

    /// Switch mode; cached results are always flushed.
    pub fn set_mode(&mut self, mode: MeasurementMode) {
        self.mode = mode;
        self.samples.flush();
    }

    /// Fail with `NoMeasureModeSet` while `Undefined`.
    pub fn require_mode(&self) -> AppResult<MeasurementMode> {
        if self.mode == MeasurementMode::Undefined {
            Err(SpectroError::NoMeasureModeSet)
        } else {
            Ok(self.mode)
        }
    }

    /// Cached results.
    pub fn samples(&self) -> &SampleCache {
        &self.samples
    }

    /// Mutable access to the cached results.
    pub fn samples_mut(&mut self) -> &mut SampleCache {
        &mut self.samples
    }

    /// Back to `Undefined` with nothing cached.
    pub fn reset(&mut self) {
        self.set_mode(MeasurementMode::Undefined);
    }
}
