//! Dual-scan correlation.
//!
//! A dual scan is two passes over the same strip on the zebra ruler:
//!
//! 1. **Forward** (tungsten lamp): the ruler's edge markers give the patch
//!    boundaries; the sample nearest each patch midpoint is the M0 result.
//! 2. **Backward** (UV LED): no boundaries are detected. For every forward
//!    midpoint the nearest UV sample is taken, which measures the
//!    fluorescence of that patch.
//!
//! With the fluorescence `F` of each patch:
//!
//! ```text
//! M2 = M0 - A_UV * F      (UV excluded)
//! M1 = M2 + D50_UV * F    (UV content of D50)
//! ```
//!
//! where `A_UV` and `D50_UV` are the relative UV excitation of illuminant A
//! (the tungsten lamp) and of D50.

use std::time::Duration;

use tracing::debug;

use crate::error::{AppResult, SpectroError};
use crate::hardware::transport::ScanCapture;
use crate::measurement::{LastScanDirection, Spectrum};
use crate::scan::{normalize, travel_direction, validate_pass, PassLimits, PositionedSample};
use crate::scan::recognition::locate;

/// Relative UV excitation of the tungsten lamp (illuminant A).
pub const A_UV_EXCITATION: f64 = 0.2;

/// Relative UV excitation of D50.
pub const D50_UV_EXCITATION: f64 = 0.6;

/// One patch found by the forward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatchWindow {
    /// Edge where the pass entered the patch.
    pub start_mm: f64,
    /// Edge where the pass left the patch.
    pub end_mm: f64,
}

impl PatchWindow {
    /// Centre of the patch.
    pub fn midpoint_mm(&self) -> f64 {
        0.5 * (self.start_mm + self.end_mm)
    }

    /// Width of the patch.
    pub fn width_mm(&self) -> f64 {
        (self.end_mm - self.start_mm).abs()
    }
}

/// Result of a successful forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardPass {
    /// Patches in travel order.
    pub patches: Vec<PatchWindow>,
    /// M0 reflectance per patch, same order.
    pub m0: Vec<Spectrum>,
    /// Direction the operator moved.
    pub direction: LastScanDirection,
}

/// Per-condition results of a dual measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct DualResults {
    /// Tungsten, UV included.
    pub m0: Vec<Spectrum>,
    /// D50 equivalent.
    pub m1: Vec<Spectrum>,
    /// UV excluded.
    pub m2: Vec<Spectrum>,
}

impl DualResults {
    /// Reverse the patch order of every condition.
    pub fn reverse(&mut self) {
        self.m0.reverse();
        self.m1.reverse();
        self.m2.reverse();
    }

    /// Number of patches.
    pub fn len(&self) -> usize {
        self.m0.len()
    }

    /// True without patches.
    pub fn is_empty(&self) -> bool {
        self.m0.is_empty()
    }
}

fn nearest<'a>(samples: &'a [PositionedSample], position_mm: f64) -> Option<&'a PositionedSample> {
    samples.iter().min_by(|a, b| {
        let da = (a.position_mm - position_mm).abs();
        let db = (b.position_mm - position_mm).abs();
        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
    })
}

/// Analyse the tungsten pass.
///
/// `white` is the tungsten white reference of the current calibration.
pub fn forward(
    capture: &ScanCapture,
    white: &Spectrum,
    limits: &PassLimits,
) -> AppResult<ForwardPass> {
    validate_pass(capture, limits)?;

    let mut edges: Vec<f64> = capture
        .ruler
        .iter()
        .filter(|r| r.edge)
        .map(|r| r.position_mm)
        .collect();
    edges.dedup_by(|a, b| (*a - *b).abs() < f64::EPSILON);
    if edges.len() < 2 {
        return Err(SpectroError::StripRecognitionFailed);
    }

    let patches: Vec<PatchWindow> = edges
        .windows(2)
        .map(|pair| PatchWindow {
            start_mm: pair[0],
            end_mm: pair[1],
        })
        .collect();

    let located = locate(&normalize(&capture.samples, white), &capture.ruler);
    let m0 = patches
        .iter()
        .map(|patch| {
            nearest(&located, patch.midpoint_mm())
                .map(|s| s.spectrum.clone())
                .ok_or(SpectroError::StripRecognitionFailed)
        })
        .collect::<AppResult<Vec<_>>>()?;

    debug!(patches = patches.len(), "forward pass analysed");
    Ok(ForwardPass {
        patches,
        m0,
        direction: travel_direction(&capture.ruler),
    })
}

/// Fluorescence per forward patch from the UV pass.
///
/// `uv_white` is the UV white reference of the current calibration. A
/// midpoint that the pass did not come within a quarter patch width of is
/// an incomplete scan.
pub fn backward(
    capture: &ScanCapture,
    uv_white: &Spectrum,
    forward: &ForwardPass,
    pass_timeout: Duration,
) -> AppResult<Vec<Spectrum>> {
    if capture.duration() > pass_timeout {
        return Err(SpectroError::UserTimeout);
    }
    if capture.ruler.is_empty() {
        return Err(SpectroError::DeviceNotMoved);
    }

    let located = locate(&normalize(&capture.samples, uv_white), &capture.ruler);
    forward
        .patches
        .iter()
        .enumerate()
        .map(|(index, patch)| {
            let midpoint = patch.midpoint_mm();
            match nearest(&located, midpoint) {
                Some(sample) if (sample.position_mm - midpoint).abs() <= patch.width_mm() / 4.0 => {
                    Ok(sample.spectrum.map(|v| v.max(0.0)))
                }
                _ => Err(SpectroError::IncompleteScan(format!(
                    "patch {} at {:.1} mm was not traversed",
                    index, midpoint
                ))),
            }
        })
        .collect()
}

/// Combine M0 and fluorescence into M0, M1 and M2.
pub fn combine(m0: Vec<Spectrum>, fluorescence: &[Spectrum]) -> DualResults {
    let m2: Vec<Spectrum> = m0
        .iter()
        .zip(fluorescence)
        .map(|(r, f)| r.zip_map(f, |r, f| (r - A_UV_EXCITATION * f).max(0.0)))
        .collect();
    let m1 = m2
        .iter()
        .zip(fluorescence)
        .map(|(r, f)| r.zip_map(f, |r, f| r + D50_UV_EXCITATION * f))
        .collect();
    DualResults { m0, m1, m2 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::transport::{RulerSample, ScanSample};

    fn limits() -> PassLimits {
        PassLimits {
            settle_delay: Duration::from_millis(500),
            min_travel_mm: 10.0,
            max_travel_mm: 300.0,
            motion_threshold_mm: 0.5,
            pass_timeout: Duration::from_secs(20),
        }
    }

    /// Strip of `values.len()` patches 10 mm wide; motion starts at 1 s.
    fn capture(values: &[f64], reverse: bool) -> ScanCapture {
        let length = values.len() as f64 * 10.0;
        let mut capture = ScanCapture::default();
        let steps = (length / 0.5) as usize + 20;
        let mut previous = if reverse { length + 5.0 } else { -5.0 };
        for step in 0..=steps {
            let offset = step as f64 * 0.5;
            let position = if reverse { length + 5.0 - offset } else { -5.0 + offset };
            let elapsed = Duration::from_millis(1000 + step as u64 * 10);
            let value = if position >= 0.0 && position < length {
                values[(position / 10.0) as usize]
            } else {
                0.9
            };
            let (lo, hi) = if previous <= position {
                (previous, position)
            } else {
                (position, previous)
            };
            let edge = step > 0 && (0..=values.len()).any(|k| {
                let e = k as f64 * 10.0;
                e > lo && e <= hi
            });
            capture.samples.push(ScanSample {
                elapsed,
                spectrum: Spectrum::flat(value),
            });
            capture.ruler.push(RulerSample {
                elapsed,
                position_mm: position,
                edge,
            });
            previous = position;
        }
        capture
    }

    #[test]
    fn test_forward_patch_count_and_midpoints() {
        let values = [0.1, 0.2, 0.3, 0.4];
        let pass = forward(&capture(&values, false), &Spectrum::flat(1.0), &limits()).unwrap();
        assert_eq!(pass.patches.len(), 4);
        assert_eq!(pass.direction, LastScanDirection::LeftToRight);
        for (patch, expected) in pass.m0.iter().zip(values) {
            assert!((patch.values()[0] - expected).abs() < 1e-12);
        }
        assert!((pass.patches[0].midpoint_mm() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_forward_right_to_left_keeps_travel_order() {
        let values = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let pass = forward(&capture(&values, true), &Spectrum::flat(1.0), &limits()).unwrap();
        assert_eq!(pass.direction, LastScanDirection::RightToLeft);
        assert!((pass.m0[0].values()[0] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_backward_extracts_at_midpoints() {
        let values = [0.1, 0.2, 0.3];
        let pass = forward(&capture(&values, false), &Spectrum::flat(1.0), &limits()).unwrap();
        let uv = capture(&[0.05, 0.0, 0.1], true);
        let fluorescence =
            backward(&uv, &Spectrum::flat(1.0), &pass, Duration::from_secs(20)).unwrap();
        assert_eq!(fluorescence.len(), 3);
        assert!((fluorescence[0].values()[0] - 0.05).abs() < 1e-12);
        assert!((fluorescence[2].values()[0] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_backward_short_pass_is_incomplete() {
        let values = [0.1, 0.2, 0.3];
        let pass = forward(&capture(&values, false), &Spectrum::flat(1.0), &limits()).unwrap();
        let mut uv = capture(&[0.0, 0.0, 0.0], true);
        uv.ruler.retain(|r| r.position_mm > 12.0);
        let keep = uv.ruler.len();
        uv.samples.truncate(keep);
        assert!(matches!(
            backward(&uv, &Spectrum::flat(1.0), &pass, Duration::from_secs(20)),
            Err(SpectroError::IncompleteScan(_))
        ));
    }

    #[test]
    fn test_backward_without_ruler() {
        let values = [0.1, 0.2];
        let pass = forward(&capture(&values, false), &Spectrum::flat(1.0), &limits()).unwrap();
        let mut uv = capture(&[0.0, 0.0], true);
        uv.ruler.clear();
        assert_eq!(
            backward(&uv, &Spectrum::flat(1.0), &pass, Duration::from_secs(20)),
            Err(SpectroError::DeviceNotMoved)
        );
    }

    #[test]
    fn test_combine_conditions() {
        let m0 = vec![Spectrum::flat(0.5)];
        let f = vec![Spectrum::flat(0.1)];
        let results = combine(m0, &f);
        assert!((results.m2[0].values()[0] - (0.5 - A_UV_EXCITATION * 0.1)).abs() < 1e-12);
        assert!(
            (results.m1[0].values()[0] - (0.5 - A_UV_EXCITATION * 0.1 + D50_UV_EXCITATION * 0.1))
                .abs()
                < 1e-12
        );
        assert_eq!(results.m0[0], Spectrum::flat(0.5));
    }
}
