//! Scan engine.
//!
//! Turns the raw capture of a pass into per-patch reflectance (or radiance).
//! The pieces are pure functions so they can be tested without a device:
//!
//! - [`validate_pass`] checks operator motion against the ruler stream
//! - [`recognition`] finds the patches of a single pass
//! - [`reference`] matches recognized patches against a chart line
//! - [`dual`] correlates the tungsten and UV passes of a dual scan
//!
//! # Motion Checks
//!
//! A pass on the zebra ruler is rejected, in this order, when the ruler
//! reported nothing (`DeviceNotMoved`), the travel is too short
//! (`InsufficientMovement`), longer than the ruler (`ExcessiveMovement`) or
//! the operator started moving before the settle delay (`EarlyScanStart`).

pub mod dual;
pub mod recognition;
pub mod reference;

use std::time::Duration;

use crate::config::ScanConfig;
use crate::error::{AppResult, SpectroError};
use crate::hardware::transport::{RulerSample, ScanCapture, ScanSample};
use crate::measurement::{LastScanDirection, Spectrum};

/// A spectral reading with the ruler position it was taken at.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionedSample {
    /// Time since the pass started.
    pub elapsed: Duration,
    /// Ruler position.
    pub position_mm: f64,
    /// Normalized reading.
    pub spectrum: Spectrum,
}

/// Limits a pass has to respect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassLimits {
    /// Minimum time before the operator may move.
    pub settle_delay: Duration,
    /// Minimum travel.
    pub min_travel_mm: f64,
    /// Usable ruler length.
    pub max_travel_mm: f64,
    /// Position change that counts as movement.
    pub motion_threshold_mm: f64,
    /// Longest accepted pass.
    pub pass_timeout: Duration,
}

impl PassLimits {
    /// Limits from configuration and the device's ruler length.
    pub fn new(config: &ScanConfig, max_travel_mm: f64) -> Self {
        Self {
            settle_delay: config.settle_delay(),
            min_travel_mm: config.min_travel_mm,
            max_travel_mm,
            motion_threshold_mm: config.motion_threshold_mm,
            pass_timeout: config.pass_timeout(),
        }
    }
}

/// Ruler summary of an accepted pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionReport {
    /// Distance between the extreme positions.
    pub travel_mm: f64,
    /// When the operator started moving.
    pub moved_after: Duration,
}

/// Ruler position closest in time to `elapsed`.
pub fn position_at(ruler: &[RulerSample], elapsed: Duration) -> Option<f64> {
    ruler
        .iter()
        .min_by_key(|r| {
            if r.elapsed > elapsed {
                r.elapsed - elapsed
            } else {
                elapsed - r.elapsed
            }
        })
        .map(|r| r.position_mm)
}

/// Divide raw readings by a white reference.
pub fn normalize(samples: &[ScanSample], white: &Spectrum) -> Vec<(Duration, Spectrum)> {
    samples
        .iter()
        .map(|s| (s.elapsed, reflectance(&s.spectrum, white)))
        .collect()
}

/// Raw signal over white; zero where the white is dark.
pub fn reflectance(raw: &Spectrum, white: &Spectrum) -> Spectrum {
    raw.zip_map(white, |r, w| if w.abs() > f64::EPSILON { r / w } else { 0.0 })
}

/// Raw signal minus the dark level.
pub fn dark_corrected(raw: &Spectrum, dark: &Spectrum) -> Spectrum {
    raw.zip_map(dark, |r, d| r - d)
}

/// Reject a pass whose duration or motion is out of bounds.
pub fn validate_pass(capture: &ScanCapture, limits: &PassLimits) -> AppResult<MotionReport> {
    if capture.duration() > limits.pass_timeout {
        return Err(SpectroError::UserTimeout);
    }
    let first = capture.ruler.first().ok_or(SpectroError::DeviceNotMoved)?;

    let (lo, hi) = capture
        .ruler
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| {
            (lo.min(r.position_mm), hi.max(r.position_mm))
        });
    let travel_mm = hi - lo;
    if travel_mm < limits.min_travel_mm {
        return Err(SpectroError::InsufficientMovement { travelled_mm: travel_mm });
    }
    if travel_mm > limits.max_travel_mm {
        return Err(SpectroError::ExcessiveMovement {
            travelled_mm: travel_mm,
            max_mm: limits.max_travel_mm,
        });
    }

    let moved_after = capture
        .ruler
        .iter()
        .find(|r| (r.position_mm - first.position_mm).abs() > limits.motion_threshold_mm)
        .map(|r| r.elapsed)
        .unwrap_or_default();
    if moved_after < limits.settle_delay {
        return Err(SpectroError::EarlyScanStart {
            moved_after_ms: moved_after.as_millis() as u64,
        });
    }

    Ok(MotionReport {
        travel_mm,
        moved_after,
    })
}

/// Direction of travel from the first to the last ruler report.
pub fn travel_direction(ruler: &[RulerSample]) -> LastScanDirection {
    match (ruler.first(), ruler.last()) {
        (Some(first), Some(last)) if last.position_mm > first.position_mm => {
            LastScanDirection::LeftToRight
        }
        (Some(first), Some(last)) if last.position_mm < first.position_mm => {
            LastScanDirection::RightToLeft
        }
        _ => LastScanDirection::Undefined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> PassLimits {
        PassLimits::new(&ScanConfig::default(), 300.0)
    }

    fn pass(start: Duration, from: f64, to: f64) -> ScanCapture {
        let mut capture = ScanCapture::default();
        let steps = ((to - from).abs() / 0.5) as u64;
        let sign = if to >= from { 1.0 } else { -1.0 };
        capture.ruler.push(RulerSample {
            elapsed: Duration::ZERO,
            position_mm: from,
            edge: false,
        });
        for step in 1..=steps {
            capture.ruler.push(RulerSample {
                elapsed: start + Duration::from_millis(step * 10),
                position_mm: from + sign * step as f64 * 0.5,
                edge: false,
            });
        }
        capture
    }

    #[test]
    fn test_position_at_nearest_in_time() {
        let ruler = pass(Duration::from_millis(600), 0.0, 10.0).ruler;
        assert_eq!(position_at(&ruler, Duration::ZERO), Some(0.0));
        assert_eq!(position_at(&ruler, Duration::from_millis(620)), Some(1.0));
        assert_eq!(position_at(&[], Duration::ZERO), None);
    }

    #[test]
    fn test_motion_check_order() {
        let none = ScanCapture::default();
        assert_eq!(validate_pass(&none, &limits()), Err(SpectroError::DeviceNotMoved));

        let still = pass(Duration::from_millis(600), 0.0, 0.0);
        assert_eq!(
            validate_pass(&still, &limits()),
            Err(SpectroError::InsufficientMovement { travelled_mm: 0.0 })
        );

        let long = pass(Duration::from_millis(600), 0.0, 310.0);
        assert!(matches!(
            validate_pass(&long, &limits()),
            Err(SpectroError::ExcessiveMovement { .. })
        ));

        let early = pass(Duration::from_millis(100), 0.0, 50.0);
        assert_eq!(
            validate_pass(&early, &limits()),
            Err(SpectroError::EarlyScanStart { moved_after_ms: 120 })
        );

        let good = pass(Duration::from_millis(600), 0.0, 50.0);
        let report = validate_pass(&good, &limits()).unwrap();
        assert!((report.travel_mm - 50.0).abs() < 1e-9);
        assert_eq!(report.moved_after, Duration::from_millis(620));
    }

    #[test]
    fn test_pass_timeout() {
        let slow = pass(Duration::from_millis(19_500), 0.0, 50.0);
        assert_eq!(validate_pass(&slow, &limits()), Err(SpectroError::UserTimeout));
    }

    #[test]
    fn test_travel_direction() {
        assert_eq!(
            travel_direction(&pass(Duration::ZERO, 0.0, 10.0).ruler),
            LastScanDirection::LeftToRight
        );
        assert_eq!(
            travel_direction(&pass(Duration::ZERO, 10.0, 0.0).ruler),
            LastScanDirection::RightToLeft
        );
        assert_eq!(travel_direction(&[]), LastScanDirection::Undefined);
    }

    #[test]
    fn test_reflectance_guards_dark_white() {
        let raw = Spectrum::flat(0.4);
        let r = reflectance(&raw, &Spectrum::flat(0.8));
        assert!((r.values()[0] - 0.5).abs() < 1e-12);
        assert_eq!(reflectance(&raw, &Spectrum::flat(0.0)), Spectrum::flat(0.0));
    }
}
