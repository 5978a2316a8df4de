//! Reference chart line for correlation recognition.
//!
//! A line holds the expected values of one row of a chart: three components
//! per patch for RGB or Lab, four for CMYK. It is set before a correlation
//! scan and consumed by it.

use crate::colorimetry::{densities, reflective_tristimulus, ColorimetricSettings};
use crate::error::{AppResult, SpectroError};
use crate::measurement::{ColorSpace, Illumination, Observer, ReferenceColorSpace, Spectrum, WhiteBase};

/// Expected values of one chart row.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceLine {
    color_space: ReferenceColorSpace,
    values: Vec<f64>,
    patch_count: usize,
}

/// Result of matching measured patches against a line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correlation {
    /// Best correlation coefficient.
    pub coefficient: f64,
    /// True when the measured order is the reverse of the line.
    pub reversed: bool,
}

impl ReferenceLine {
    /// Validate and build a line of `patch_count` patches.
    pub fn new(
        color_space: ReferenceColorSpace,
        values: Vec<f64>,
        patch_count: usize,
    ) -> AppResult<Self> {
        if patch_count == 0 {
            return Err(SpectroError::InvalidArgument(
                "reference line needs at least one patch".to_string(),
            ));
        }
        let expected = patch_count * color_space.components();
        if values.len() != expected {
            return Err(SpectroError::InvalidArgument(format!(
                "{} patches in {} need {} values, got {}",
                patch_count,
                color_space,
                expected,
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(SpectroError::InvalidArgument(
                "reference values must be finite".to_string(),
            ));
        }
        Ok(Self {
            color_space,
            values,
            patch_count,
        })
    }

    /// Color space of the values.
    pub fn color_space(&self) -> ReferenceColorSpace {
        self.color_space
    }

    /// Number of patches.
    pub fn patch_count(&self) -> usize {
        self.patch_count
    }

    /// Flat value list.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Measured patch in the line's color space.
    pub fn express(&self, reflectance: &Spectrum) -> Vec<f64> {
        match self.color_space {
            ReferenceColorSpace::Cmyk => densities(reflectance).to_vec(),
            ReferenceColorSpace::Rgb | ReferenceColorSpace::Lab => {
                let settings = ColorimetricSettings {
                    color_space: if self.color_space == ReferenceColorSpace::Rgb {
                        ColorSpace::Rgb
                    } else {
                        ColorSpace::Lab
                    },
                    illumination: Illumination::D50,
                    observer: Observer::TwoDegree,
                    white_base: WhiteBase::Absolute,
                };
                reflective_tristimulus(reflectance, &settings).to_vec()
            }
        }
    }

    /// Correlate measured patches in both orders.
    ///
    /// Fails with `ChartCorrelationFailed` when the patch count differs from
    /// the line or neither order reaches `threshold`.
    pub fn correlate(&self, patches: &[Spectrum], threshold: f64) -> AppResult<Correlation> {
        if patches.len() != self.patch_count {
            return Err(SpectroError::ChartCorrelationFailed {
                recognized: patches.len(),
            });
        }
        let forward: Vec<f64> = patches.iter().flat_map(|p| self.express(p)).collect();
        let backward: Vec<f64> = patches.iter().rev().flat_map(|p| self.express(p)).collect();

        let r_forward = pearson(&forward, &self.values);
        let r_backward = pearson(&backward, &self.values);
        let correlation = if r_backward > r_forward {
            Correlation {
                coefficient: r_backward,
                reversed: true,
            }
        } else {
            Correlation {
                coefficient: r_forward,
                reversed: false,
            }
        };

        if correlation.coefficient < threshold {
            return Err(SpectroError::ChartCorrelationFailed {
                recognized: patches.len(),
            });
        }
        Ok(correlation)
    }
}

/// Pearson correlation coefficient; 0 when either side has no variance.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}
