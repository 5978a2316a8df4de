//! Measurement data types.
//!
//! Spectra are sampled from 380 nm to 730 nm in 10 nm steps (36 bands).
//! Reflectance spectra are fractions (0..1), emissive spectra are radiometric
//! values in W/(sr·m²·nm) for emission and W/(m²·nm) for ambient light.
//!
//! The enums in this module double as option values: each one converts to and
//! from the exact string used by the option protocol.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, SpectroError};

/// Number of spectral bands.
pub const SPECTRUM_SIZE: usize = 36;
/// Number of tristimulus components.
pub const TRISTIMULUS_SIZE: usize = 3;
/// Number of density components (C, M, Y, K).
pub const DENSITY_SIZE: usize = 4;
/// First sampled wavelength in nm.
pub const FIRST_WAVELENGTH_NM: f64 = 380.0;
/// Spacing between sampled wavelengths in nm.
pub const WAVELENGTH_STEP_NM: f64 = 10.0;

/// Tristimulus triple in the currently selected color space.
pub type Tristimulus = [f64; TRISTIMULUS_SIZE];
/// Densities in C, M, Y, K order.
pub type Densities = [f64; DENSITY_SIZE];

/// Generates a fieldless enum that round-trips through its option string.
macro_rules! option_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// All variants in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The option string for this value.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = SpectroError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(SpectroError::InvalidArgument(format!(
                        "'{}' is not a valid {}",
                        other,
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

option_enum! {
    /// Active measurement mode of a device.
    pub enum MeasurementMode {
        /// Initial state; triggering fails.
        Undefined => "MeasurementModeUndefined",
        /// One spot on a reflective surface.
        ReflectanceSpot => "ReflectanceSpot",
        /// Strip scan on a reflective chart.
        ReflectanceScan => "ReflectanceScan",
        /// Spot on an emitting surface (display).
        EmissionSpot => "EmissionSpot",
        /// Ambient light spot through the diffuser.
        AmbientLightSpot => "AmbientLightSpot",
        /// Ambient light time series (flash detection).
        AmbientLightScan => "AmbientLightScan",
        /// Spot with tungsten lamp and UV LED.
        DualReflectanceSpot => "DualReflectanceSpot",
        /// Forward tungsten pass plus backward UV pass on the ruler.
        DualReflectanceScan => "DualReflectanceScan",
    }
}

impl MeasurementMode {
    /// True for modes that scan over several patches.
    pub fn is_scan(&self) -> bool {
        matches!(
            self,
            Self::ReflectanceScan | Self::AmbientLightScan | Self::DualReflectanceScan
        )
    }

    /// True for modes that measure reflected lamp light.
    pub fn is_reflective(&self) -> bool {
        matches!(
            self,
            Self::ReflectanceSpot
                | Self::ReflectanceScan
                | Self::DualReflectanceSpot
                | Self::DualReflectanceScan
        )
    }

    /// True for modes that measure through the ambient diffuser.
    pub fn is_ambient(&self) -> bool {
        matches!(self, Self::AmbientLightSpot | Self::AmbientLightScan)
    }

    /// True for modes using both the tungsten lamp and the UV LED.
    pub fn is_dual(&self) -> bool {
        matches!(self, Self::DualReflectanceSpot | Self::DualReflectanceScan)
    }
}

impl Default for MeasurementMode {
    fn default() -> Self {
        Self::Undefined
    }
}

option_enum! {
    /// Illumination condition a result represents (ISO 13655).
    pub enum IlluminationCondition {
        /// Illuminant A, UV included ("no filter").
        M0 => "M0",
        /// D50-matched UV content.
        M1 => "M1",
        /// UV excluded ("UV cut").
        M2 => "M2",
        /// Emissive or ambient result.
        Emissive => "Emissive",
    }
}

option_enum! {
    /// Direction of the next dual scan pass.
    pub enum ScanDirection {
        /// Not valid for a scan.
        Undefined => "0",
        /// Tungsten (M0) pass establishing patch positions.
        Forward => "1",
        /// UV LED pass.
        Backward => "2",
    }
}

option_enum! {
    /// Physical direction reported by the ruler after a scan.
    pub enum LastScanDirection {
        /// User scanned from right to left.
        RightToLeft => "-1",
        /// No direction information.
        Undefined => "0",
        /// User scanned from left to right.
        LeftToRight => "1",
    }
}

option_enum! {
    /// Patch recognition policy for scan modes.
    pub enum RecognitionPolicy {
        /// No recognition; the whole strip is one patch.
        Disabled => "RecognitionDisabled",
        /// Geometry-only edge detection.
        Basic => "RecognitionBasic",
        /// Edge detection plus matching against a reference line.
        Correlation => "RecognitionCorrelation",
        /// Ruler positions with a declared number of patches per line.
        Position => "RecognitionPosition",
        /// Flash detection for ambient scans.
        Flash => "RecognitionFlash",
    }
}

option_enum! {
    /// Color space of a reference chart line.
    pub enum ReferenceColorSpace {
        /// RGB triples.
        Rgb => "ReferenceChartRGB",
        /// CMYK density quadruples.
        Cmyk => "ReferenceChartCMYK",
        /// CIE L*a*b* triples.
        Lab => "ReferenceChartLab",
    }
}

impl ReferenceColorSpace {
    /// Values per patch in a reference line of this color space.
    pub fn components(&self) -> usize {
        match self {
            Self::Rgb | Self::Lab => TRISTIMULUS_SIZE,
            Self::Cmyk => DENSITY_SIZE,
        }
    }
}

option_enum! {
    /// Color space returned by tristimulus accessors.
    pub enum ColorSpace {
        /// CIE XYZ.
        Xyz => "CIEXYZ",
        /// CIE xyY.
        XyY => "CIExyY",
        /// CIE L*a*b*.
        Lab => "CIELab",
        /// CIE L*C*h.
        LCh => "CIELCh",
        /// Generic display RGB (0..255).
        Rgb => "RGB",
    }
}

option_enum! {
    /// Reference illuminant for colorimetric results.
    pub enum Illumination {
        /// Incandescent, 2856 K.
        A => "A",
        /// Direct sunlight, 4874 K.
        B => "B",
        /// Average daylight, 6774 K.
        C => "C",
        /// Horizon light, 5003 K.
        D50 => "D50",
        /// Mid-morning daylight, 5503 K.
        D55 => "D55",
        /// Noon daylight, 6504 K.
        D65 => "D65",
        /// North sky daylight, 7504 K.
        D75 => "D75",
        /// Cool white fluorescent.
        F2 => "F2",
        /// Broadband fluorescent.
        F7 => "F7",
        /// Narrow band fluorescent.
        F11 => "F11",
        /// Use the measured emission itself.
        Emission => "Emission",
    }
}

option_enum! {
    /// Standard observer for colorimetric results.
    pub enum Observer {
        /// CIE 1931 2°.
        TwoDegree => "TwoDegree",
        /// CIE 1964 10°.
        TenDegree => "TenDegree",
    }
}

option_enum! {
    /// White base for reflectance colorimetry.
    pub enum WhiteBase {
        /// Absolute reflectance.
        Absolute => "WhiteBaseAbsolute",
        /// Relative to the substrate set with `set_substrate`.
        Paper => "WhiteBasePaper",
    }
}

option_enum! {
    /// Density filter returned by the single-density accessor.
    pub enum DensityFilter {
        /// Cyan (red filter).
        Cyan => "DensityFilterCyan",
        /// Magenta (green filter).
        Magenta => "DensityFilterMagenta",
        /// Yellow (blue filter).
        Yellow => "DensityFilterYellow",
        /// Visual.
        Visual => "DensityFilterVisual",
        /// The filter with the highest density.
        Auto => "DensityFilterAuto",
    }
}

impl DensityFilter {
    /// Index into a [`Densities`] array, `None` for `Auto`.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Cyan => Some(0),
            Self::Magenta => Some(1),
            Self::Yellow => Some(2),
            Self::Visual => Some(3),
            Self::Auto => None,
        }
    }

    /// Filter for a [`Densities`] index.
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Cyan),
            1 => Some(Self::Magenta),
            2 => Some(Self::Yellow),
            3 => Some(Self::Visual),
            _ => None,
        }
    }
}

option_enum! {
    /// Indicator LED sequences.
    pub enum IndicatorLed {
        /// Green sequence.
        Succeeded => "IndicatorLedSucceeded",
        /// Red sequence.
        Failed => "IndicatorLedFailed",
        /// One green, two red.
        WrongRow => "IndicatorLedWrongRow",
        /// Blue, scan to the left.
        WaitForScanLeft => "IndicatorLedWait4LeftScan",
        /// Blue, scan to the right.
        WaitForScanRight => "IndicatorLedWait4RightScan",
        /// Blue, unknown direction.
        WaitForScan => "IndicatorLedWait4Scan",
        /// Off.
        Off => "IndicatorLedOff",
    }
}

/// Wavelength in nm of spectral band `index`.
pub fn wavelength_nm(index: usize) -> f64 {
    FIRST_WAVELENGTH_NM + WAVELENGTH_STEP_NM * index as f64
}

/// Sampled wavelengths of every band.
pub fn wavelengths() -> impl Iterator<Item = f64> {
    (0..SPECTRUM_SIZE).map(wavelength_nm)
}

/// A 36-band spectrum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Spectrum(Vec<f64>);

impl Spectrum {
    /// Build a spectrum from exactly [`SPECTRUM_SIZE`] values.
    pub fn new(values: Vec<f64>) -> AppResult<Self> {
        if values.len() != SPECTRUM_SIZE {
            return Err(SpectroError::InvalidArgument(format!(
                "spectrum needs {} values, got {}",
                SPECTRUM_SIZE,
                values.len()
            )));
        }
        Ok(Self(values))
    }

    /// Spectrum with the same value in every band.
    pub fn flat(value: f64) -> Self {
        Self(vec![value; SPECTRUM_SIZE])
    }

    /// Spectrum computed from wavelength in nm.
    pub fn from_fn(f: impl Fn(f64) -> f64) -> Self {
        Self(wavelengths().map(f).collect())
    }

    /// Band values.
    pub fn values(&self) -> &[f64] {
        &self.0
    }

    /// Band-wise combination of two spectra.
    pub fn zip_map(&self, other: &Spectrum, f: impl Fn(f64, f64) -> f64) -> Spectrum {
        Spectrum(
            self.0
                .iter()
                .zip(other.0.iter())
                .map(|(&a, &b)| f(a, b))
                .collect(),
        )
    }

    /// Band-wise transform.
    pub fn map(&self, mut f: impl FnMut(f64) -> f64) -> Spectrum {
        Spectrum(self.0.iter().map(|&v| f(v)).collect())
    }

    /// Band-wise mean of several spectra, `None` when empty.
    pub fn mean<'a>(spectra: impl IntoIterator<Item = &'a Spectrum>) -> Option<Spectrum> {
        let mut sum = vec![0.0; SPECTRUM_SIZE];
        let mut count = 0usize;
        for spectrum in spectra {
            for (acc, v) in sum.iter_mut().zip(spectrum.0.iter()) {
                *acc += v;
            }
            count += 1;
        }
        if count == 0 {
            return None;
        }
        Some(Spectrum(sum.into_iter().map(|v| v / count as f64).collect()))
    }

    /// Root-mean-square difference to another spectrum.
    pub fn rms_distance(&self, other: &Spectrum) -> f64 {
        let sum: f64 = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        (sum / SPECTRUM_SIZE as f64).sqrt()
    }

    /// Sum over all bands.
    pub fn total(&self) -> f64 {
        self.0.iter().sum()
    }

    /// True when every value is finite.
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

impl TryFrom<Vec<f64>> for Spectrum {
    type Error = SpectroError;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        Spectrum::new(values)
    }
}

impl From<Spectrum> for Vec<f64> {
    fn from(spectrum: Spectrum) -> Self {
        spectrum.0
    }
}

/// One cached measurement result.
///
/// Colorimetric values are derived from `spectrum` on demand so that color
/// space, illuminant and observer options apply to results already taken.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    /// Position in the result list for its condition.
    pub index: usize,
    /// Condition this result represents.
    pub condition: IlluminationCondition,
    /// Measured spectrum.
    pub spectrum: Spectrum,
    /// When the trigger that produced this sample completed.
    pub measured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trip_strings() {
        for mode in MeasurementMode::ALL {
            let parsed: MeasurementMode = mode.as_str().parse().expect("parse");
            assert_eq!(parsed, *mode);
        }
        assert!("Reflectance".parse::<MeasurementMode>().is_err());
    }

    #[test]
    fn test_mode_classification() {
        assert!(MeasurementMode::DualReflectanceScan.is_scan());
        assert!(MeasurementMode::DualReflectanceScan.is_dual());
        assert!(MeasurementMode::ReflectanceSpot.is_reflective());
        assert!(!MeasurementMode::EmissionSpot.is_reflective());
        assert!(MeasurementMode::AmbientLightScan.is_ambient());
        assert!(!MeasurementMode::Undefined.is_scan());
    }

    #[test]
    fn test_scan_direction_values() {
        assert_eq!(ScanDirection::Forward.as_str(), "1");
        assert_eq!("2".parse::<ScanDirection>().expect("parse"), ScanDirection::Backward);
    }

    #[test]
    fn test_wavelength_grid() {
        assert_eq!(wavelength_nm(0), 380.0);
        assert_eq!(wavelength_nm(SPECTRUM_SIZE - 1), 730.0);
        assert_eq!(wavelengths().count(), SPECTRUM_SIZE);
    }

    #[test]
    fn test_spectrum_length_checked() {
        assert!(Spectrum::new(vec![0.5; 10]).is_err());
        assert!(Spectrum::new(vec![0.5; SPECTRUM_SIZE]).is_ok());
    }

    #[test]
    fn test_spectrum_mean_and_distance() {
        let a = Spectrum::flat(0.2);
        let b = Spectrum::flat(0.4);
        let mean = Spectrum::mean([&a, &b]).expect("mean");
        assert!((mean.values()[7] - 0.3).abs() < 1e-12);
        assert!((a.rms_distance(&b) - 0.2).abs() < 1e-12);
        assert!(Spectrum::mean(std::iter::empty()).is_none());
    }

    #[test]
    fn test_spectrum_serde_rejects_wrong_length() {
        let json = serde_json::to_string(&Spectrum::flat(0.1)).expect("serialize");
        let back: Spectrum = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, Spectrum::flat(0.1));
        assert!(serde_json::from_str::<Spectrum>("[0.1, 0.2]").is_err());
    }

    #[test]
    fn test_density_filter_index() {
        assert_eq!(DensityFilter::Yellow.index(), Some(2));
        assert_eq!(DensityFilter::Auto.index(), None);
        assert_eq!(DensityFilter::from_index(3), Some(DensityFilter::Visual));
    }
}
