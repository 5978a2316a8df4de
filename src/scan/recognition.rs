//! Patch recognition for single-pass scans.
//!
//! | Policy      | Boundaries from                    | Needs                  |
//! |-------------|------------------------------------|------------------------|
//! | Disabled    | none, the whole pass is one patch  |                        |
//! | Basic       | steps in the spectral stream       |                        |
//! | Correlation | as Basic, then matched to a line   | reference chart line   |
//! | Position    | ruler travel split evenly          | ruler, >= 6 patches    |
//! | Flash       | peaks in the ambient stream        | ambient diffuser       |
//!
//! Basic recognition expects the strip to be framed by substrate: the first
//! and last segment of a pass are the paper before and after the patches
//! and are not reported.

use crate::error::{AppResult, SpectroError};
use crate::hardware::transport::RulerSample;
use crate::measurement::Spectrum;
use crate::scan::{position_at, PositionedSample};

/// Declared patches per line needed for position recognition.
pub const MIN_POSITION_PATCHES: usize = 6;

/// Mean of the middle half of a run of samples.
fn middle_mean(run: &[&Spectrum]) -> Option<Spectrum> {
    let n = run.len();
    let (lo, hi) = if n >= 4 { (n / 4, n - n / 4) } else { (0, n) };
    Spectrum::mean(run[lo..hi].iter().copied())
}

/// Whole pass as one patch.
pub fn disabled(samples: &[Spectrum]) -> AppResult<Vec<Spectrum>> {
    let run: Vec<&Spectrum> = samples.iter().collect();
    middle_mean(&run)
        .map(|patch| vec![patch])
        .ok_or(SpectroError::StripRecognitionFailed)
}

/// Split a stream wherever consecutive samples differ by more than `threshold`.
pub fn segment(samples: &[Spectrum], threshold: f64) -> Vec<Vec<&Spectrum>> {
    let mut segments: Vec<Vec<&Spectrum>> = Vec::new();
    let mut current: Vec<&Spectrum> = Vec::new();
    for sample in samples {
        if let Some(previous) = current.last() {
            if previous.rms_distance(sample) > threshold {
                segments.push(std::mem::take(&mut current));
            }
        }
        current.push(sample);
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Spectral edge detection.
///
/// Runs shorter than `min_samples` are transitions and are dropped. Fails
/// with `StripRecognitionFailed` when nothing is left between the leading
/// and trailing substrate.
pub fn basic(samples: &[Spectrum], threshold: f64, min_samples: usize) -> AppResult<Vec<Spectrum>> {
    let runs: Vec<Vec<&Spectrum>> = segment(samples, threshold)
        .into_iter()
        .filter(|run| run.len() >= min_samples)
        .collect();
    if runs.len() < 3 {
        return Err(SpectroError::StripRecognitionFailed);
    }
    runs[1..runs.len() - 1]
        .iter()
        .map(|run| middle_mean(run).ok_or(SpectroError::StripRecognitionFailed))
        .collect()
}

/// Even split of the ruler travel into `patches_per_line` patches.
///
/// The travel is bounded by the outermost edge markers when the ruler saw at
/// least two of them, otherwise by the extreme positions. Patches are
/// reported in ruler order, leftmost first.
pub fn position(
    samples: &[PositionedSample],
    ruler: &[RulerSample],
    patches_per_line: usize,
) -> AppResult<Vec<Spectrum>> {
    if patches_per_line < MIN_POSITION_PATCHES {
        return Err(SpectroError::InvalidArgument(format!(
            "position recognition needs at least {} patches per line, got {}",
            MIN_POSITION_PATCHES, patches_per_line
        )));
    }
    if ruler.is_empty() {
        return Err(SpectroError::DeviceNotMoved);
    }

    let edges: Vec<f64> = ruler.iter().filter(|r| r.edge).map(|r| r.position_mm).collect();
    let (start, end) = if edges.len() >= 2 {
        bounds(edges.iter().copied())
    } else {
        bounds(ruler.iter().map(|r| r.position_mm))
    };
    let width = (end - start) / patches_per_line as f64;
    if width <= 0.0 {
        return Err(SpectroError::StripRecognitionFailed);
    }

    (0..patches_per_line)
        .map(|k| {
            let lo = start + (k as f64 + 0.25) * width;
            let hi = start + (k as f64 + 0.75) * width;
            let run: Vec<&Spectrum> = samples
                .iter()
                .filter(|s| s.position_mm >= lo && s.position_mm <= hi)
                .map(|s| &s.spectrum)
                .collect();
            Spectrum::mean(run.iter().copied()).ok_or(SpectroError::StripRecognitionFailed)
        })
        .collect()
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

/// One result per flash in an ambient stream.
///
/// `samples` are dark-corrected. A flash is a run of samples whose total
/// exceeds `ratio` times the median total; its brightest sample is
/// reported.
pub fn flash(samples: &[Spectrum], ratio: f64) -> AppResult<Vec<Spectrum>> {
    let mut totals: Vec<f64> = samples.iter().map(Spectrum::total).collect();
    if totals.is_empty() {
        return Err(SpectroError::StripRecognitionFailed);
    }
    totals.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = totals[totals.len() / 2];
    let threshold = (median * ratio).max(f64::EPSILON);

    let mut flashes = Vec::new();
    let mut best: Option<&Spectrum> = None;
    for sample in samples {
        if sample.total() > threshold {
            best = match best {
                Some(b) if b.total() >= sample.total() => Some(b),
                _ => Some(sample),
            };
        } else if let Some(peak) = best.take() {
            flashes.push(peak.clone());
        }
    }
    if let Some(peak) = best {
        flashes.push(peak.clone());
    }

    if flashes.is_empty() {
        return Err(SpectroError::StripRecognitionFailed);
    }
    Ok(flashes)
}

/// Attach ruler positions to spectral samples by time.
pub fn locate(
    samples: &[(std::time::Duration, Spectrum)],
    ruler: &[RulerSample],
) -> Vec<PositionedSample> {
    samples
        .iter()
        .filter_map(|(elapsed, spectrum)| {
            position_at(ruler, *elapsed).map(|position_mm| PositionedSample {
                elapsed: *elapsed,
                position_mm,
                spectrum: spectrum.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn run(value: f64, n: usize) -> Vec<Spectrum> {
        vec![Spectrum::flat(value); n]
    }

    #[test]
    fn test_disabled_averages_everything() {
        let mut samples = run(0.2, 4);
        samples.extend(run(0.4, 4));
        let patches = disabled(&samples).unwrap();
        assert_eq!(patches.len(), 1);
        assert!((patches[0].values()[0] - 0.3).abs() < 1e-12);
        assert_eq!(disabled(&[]), Err(SpectroError::StripRecognitionFailed));
    }

    #[test]
    fn test_basic_drops_substrate_frame() {
        let mut samples = run(0.9, 10);
        samples.extend(run(0.2, 8));
        samples.extend(run(0.5, 8));
        samples.extend(run(0.3, 8));
        samples.extend(run(0.9, 10));

        let patches = basic(&samples, 0.05, 3).unwrap();
        assert_eq!(patches.len(), 3);
        assert!((patches[0].values()[0] - 0.2).abs() < 1e-12);
        assert!((patches[2].values()[0] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_basic_fails_on_uniform_stream() {
        let samples = run(0.9, 40);
        assert_eq!(
            basic(&samples, 0.05, 3),
            Err(SpectroError::StripRecognitionFailed)
        );
    }

    #[test]
    fn test_position_needs_six_patches() {
        let ruler = vec![RulerSample {
            elapsed: Duration::ZERO,
            position_mm: 0.0,
            edge: false,
        }];
        assert!(matches!(
            position(&[], &ruler, 4),
            Err(SpectroError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_position_splits_travel() {
        let mut ruler = Vec::new();
        let mut samples = Vec::new();
        for step in 0..=120 {
            let pos = step as f64 * 0.5;
            let elapsed = Duration::from_millis(step * 10);
            ruler.push(RulerSample {
                elapsed,
                position_mm: pos,
                edge: false,
            });
            samples.push(PositionedSample {
                elapsed,
                position_mm: pos,
                spectrum: Spectrum::flat((pos / 10.0).floor() / 10.0),
            });
        }
        let patches = position(&samples, &ruler, 6).unwrap();
        assert_eq!(patches.len(), 6);
        for (k, patch) in patches.iter().enumerate() {
            assert!((patch.values()[0] - k as f64 / 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_flash_peaks() {
        let mut samples = run(0.001, 10);
        samples.push(Spectrum::flat(0.5));
        samples.push(Spectrum::flat(1.0));
        samples.extend(run(0.001, 10));
        samples.push(Spectrum::flat(2.0));
        samples.extend(run(0.001, 10));

        let flashes = flash(&samples, 3.0).unwrap();
        assert_eq!(flashes.len(), 2);
        assert_eq!(flashes[0], Spectrum::flat(1.0));
        assert_eq!(flashes[1], Spectrum::flat(2.0));

        assert_eq!(
            flash(&run(0.001, 20), 3.0),
            Err(SpectroError::StripRecognitionFailed)
        );
    }
}
