//! Spectrum to color conversions.
//!
//! The instrument reports spectra; everything else is derived here. This is a
//! compact numeric model, not a certified implementation:
//!
//! - Color matching functions use the analytic multi-lobe fit of the CIE 1931
//!   2° observer and the single-lobe fit of the CIE 1964 10° observer
//!   (Wyman, Sloan & Shirley, 2013).
//! - Illuminants are modelled as Planckian radiators at their correlated color
//!   temperature.
//! - Densities use Gaussian status filters centred on the red, green and blue
//!   absorption bands plus the photopic curve for visual density.

use crate::measurement::{
    wavelength_nm, ColorSpace, Densities, Illumination, Observer, Spectrum, Tristimulus,
    WhiteBase, DENSITY_SIZE, SPECTRUM_SIZE, WAVELENGTH_STEP_NM,
};

/// Luminous efficacy in lm/W.
const MAX_LUMINOUS_EFFICACY: f64 = 683.0;

/// Reflectance floor used before taking logarithms.
const MIN_REFLECTANCE: f64 = 1e-5;

/// sRGB (D65) matrix from XYZ.
const XYZ_TO_RGB: [[f64; 3]; 3] = [
    [3.2406, -1.5372, -0.4986],
    [-0.9689, 1.8758, 0.0415],
    [0.0557, -0.2040, 1.0570],
];

/// Settings that turn a stored spectrum into colorimetric values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorimetricSettings {
    /// Output color space.
    pub color_space: ColorSpace,
    /// Reference illuminant for reflective results.
    pub illumination: Illumination,
    /// Standard observer.
    pub observer: Observer,
    /// Absolute or paper-relative reflectance.
    pub white_base: WhiteBase,
}

impl Default for ColorimetricSettings {
    fn default() -> Self {
        Self {
            color_space: ColorSpace::Lab,
            illumination: Illumination::D50,
            observer: Observer::TwoDegree,
            white_base: WhiteBase::Absolute,
        }
    }
}

fn piecewise_gaussian(lambda: f64, mu: f64, sigma_low: f64, sigma_high: f64) -> f64 {
    let sigma = if lambda < mu { sigma_low } else { sigma_high };
    let t = (lambda - mu) / sigma;
    (-0.5 * t * t).exp()
}

/// Color matching functions x̄, ȳ, z̄ at `lambda` nm.
pub fn color_matching(observer: Observer, lambda: f64) -> [f64; 3] {
    match observer {
        Observer::TwoDegree => [
            1.056 * piecewise_gaussian(lambda, 599.8, 37.9, 31.0)
                + 0.362 * piecewise_gaussian(lambda, 442.0, 16.0, 26.7)
                - 0.065 * piecewise_gaussian(lambda, 501.1, 20.4, 26.2),
            0.821 * piecewise_gaussian(lambda, 568.8, 46.9, 40.5)
                + 0.286 * piecewise_gaussian(lambda, 530.9, 16.3, 31.1),
            1.217 * piecewise_gaussian(lambda, 437.0, 11.8, 36.0)
                + 0.681 * piecewise_gaussian(lambda, 459.0, 26.0, 13.8),
        ],
        Observer::TenDegree => {
            let x_low = ((lambda + 570.1) / 1014.0).ln();
            let x_high = ((1338.0 - lambda) / 743.5).ln();
            let y = (lambda - 556.1) / 46.14;
            let z = ((lambda - 265.8) / 180.4).ln();
            [
                0.398 * (-1250.0 * x_low * x_low).exp() + 1.132 * (-234.0 * x_high * x_high).exp(),
                1.011 * (-0.5 * y * y).exp(),
                2.060 * (-32.0 * z * z).exp(),
            ]
        }
    }
}

/// Correlated color temperature used to model an illuminant.
pub fn correlated_color_temperature(illumination: Illumination) -> f64 {
    match illumination {
        Illumination::A => 2856.0,
        Illumination::B => 4874.0,
        Illumination::C => 6774.0,
        Illumination::D50 => 5003.0,
        Illumination::D55 => 5503.0,
        Illumination::D65 | Illumination::Emission => 6504.0,
        Illumination::D75 => 7504.0,
        Illumination::F2 => 4230.0,
        Illumination::F7 => 6500.0,
        Illumination::F11 => 4000.0,
    }
}

/// Relative spectral power of a Planckian radiator, 1.0 at 560 nm.
pub fn planck_relative(lambda_nm: f64, kelvin: f64) -> f64 {
    const C2: f64 = 1.4388e-2;
    let radiance = |nm: f64| {
        let m = nm * 1e-9;
        1.0 / (m.powi(5) * ((C2 / (m * kelvin)).exp() - 1.0))
    };
    radiance(lambda_nm) / radiance(560.0)
}

/// Relative spectral power of `illumination` on the sampling grid.
pub fn illuminant_spectrum(illumination: Illumination) -> Spectrum {
    let kelvin = correlated_color_temperature(illumination);
    Spectrum::from_fn(|nm| planck_relative(nm, kelvin))
}

/// XYZ of a reflectance spectrum, normalised so a perfect diffuser has Y = 100.
pub fn reflective_xyz(reflectance: &Spectrum, illumination: Illumination, observer: Observer) -> [f64; 3] {
    let power = illuminant_spectrum(illumination);
    let mut xyz = [0.0; 3];
    let mut norm = 0.0;
    for (i, (&r, &s)) in reflectance.values().iter().zip(power.values()).enumerate() {
        let cmf = color_matching(observer, wavelength_nm(i));
        for (acc, c) in xyz.iter_mut().zip(cmf.iter()) {
            *acc += s * r * c;
        }
        norm += s * cmf[1];
    }
    if norm <= 0.0 {
        return [0.0; 3];
    }
    xyz.map(|v| 100.0 * v / norm)
}

/// Absolute XYZ of an emissive spectrum (Y in cd/m² or lux).
pub fn emissive_xyz(radiance: &Spectrum, observer: Observer) -> [f64; 3] {
    let mut xyz = [0.0; 3];
    for (i, &e) in radiance.values().iter().enumerate() {
        let cmf = color_matching(observer, wavelength_nm(i));
        for (acc, c) in xyz.iter_mut().zip(cmf.iter()) {
            *acc += e * c;
        }
    }
    xyz.map(|v| MAX_LUMINOUS_EFFICACY * v * WAVELENGTH_STEP_NM)
}

/// Reference white of an illuminant, Y = 100.
pub fn white_point(illumination: Illumination, observer: Observer) -> [f64; 3] {
    reflective_xyz(&Spectrum::flat(1.0), illumination, observer)
}

/// CIE xyY from XYZ; black maps to the white point chromaticity.
pub fn xyz_to_xyy(xyz: [f64; 3], white: [f64; 3]) -> Tristimulus {
    let sum = xyz[0] + xyz[1] + xyz[2];
    if sum <= f64::EPSILON {
        let wsum = white[0] + white[1] + white[2];
        return [white[0] / wsum, white[1] / wsum, 0.0];
    }
    [xyz[0] / sum, xyz[1] / sum, xyz[1]]
}

/// CIE L*a*b* relative to `white`.
pub fn xyz_to_lab(xyz: [f64; 3], white: [f64; 3]) -> Tristimulus {
    fn f(t: f64) -> f64 {
        const DELTA: f64 = 6.0 / 29.0;
        if t > DELTA * DELTA * DELTA {
            t.cbrt()
        } else {
            t / (3.0 * DELTA * DELTA) + 4.0 / 29.0
        }
    }
    let fx = f(xyz[0] / white[0]);
    let fy = f(xyz[1] / white[1]);
    let fz = f(xyz[2] / white[2]);
    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

/// CIE L*C*h (hue in degrees, 0..360) from L*a*b*.
pub fn lab_to_lch(lab: Tristimulus) -> Tristimulus {
    let chroma = (lab[1] * lab[1] + lab[2] * lab[2]).sqrt();
    let mut hue = lab[2].atan2(lab[1]).to_degrees();
    if hue < 0.0 {
        hue += 360.0;
    }
    [lab[0], chroma, hue]
}

/// Generic display RGB (0..255) from XYZ scaled to Y = 100.
pub fn xyz_to_rgb(xyz: [f64; 3]) -> Tristimulus {
    let scaled = xyz.map(|v| v / 100.0);
    XYZ_TO_RGB.map(|row| {
        let linear = (row[0] * scaled[0] + row[1] * scaled[1] + row[2] * scaled[2]).clamp(0.0, 1.0);
        let encoded = if linear <= 0.003_130_8 {
            12.92 * linear
        } else {
            1.055 * linear.powf(1.0 / 2.4) - 0.055
        };
        encoded * 255.0
    })
}

/// Convert XYZ into `color_space`.
pub fn xyz_to_color_space(xyz: [f64; 3], color_space: ColorSpace, white: [f64; 3]) -> Tristimulus {
    match color_space {
        ColorSpace::Xyz => xyz,
        ColorSpace::XyY => xyz_to_xyy(xyz, white),
        ColorSpace::Lab => xyz_to_lab(xyz, white),
        ColorSpace::LCh => lab_to_lch(xyz_to_lab(xyz, white)),
        ColorSpace::Rgb => xyz_to_rgb(xyz),
    }
}

/// Divide a reflectance spectrum by the substrate, band by band.
pub fn relative_to_substrate(reflectance: &Spectrum, substrate: &Spectrum) -> Spectrum {
    reflectance.zip_map(substrate, |r, s| if s > MIN_REFLECTANCE { r / s } else { r })
}

/// Tristimulus of a reflectance spectrum under `settings`.
pub fn reflective_tristimulus(reflectance: &Spectrum, settings: &ColorimetricSettings) -> Tristimulus {
    let illumination = match settings.illumination {
        Illumination::Emission => Illumination::D50,
        other => other,
    };
    let xyz = reflective_xyz(reflectance, illumination, settings.observer);
    let white = white_point(illumination, settings.observer);
    xyz_to_color_space(xyz, settings.color_space, white)
}

/// Tristimulus of an emissive spectrum under `settings`.
///
/// Lab and LCh are relative to a D65 white with the luminance of the sample.
pub fn emissive_tristimulus(radiance: &Spectrum, settings: &ColorimetricSettings) -> Tristimulus {
    let xyz = emissive_xyz(radiance, settings.observer);
    let mut white = white_point(Illumination::D65, settings.observer);
    if xyz[1] > 0.0 {
        let scale = xyz[1] / white[1];
        white = white.map(|v| v * scale);
    }
    xyz_to_color_space(xyz, settings.color_space, white)
}

/// Status filter weights for C, M, Y and visual density.
fn density_weights(band: usize) -> [f64; DENSITY_SIZE] {
    let lambda = wavelength_nm(band);
    let gauss = |mu: f64, sigma: f64| {
        let t = (lambda - mu) / sigma;
        (-0.5 * t * t).exp()
    };
    [
        gauss(630.0, 20.0),
        gauss(540.0, 20.0),
        gauss(450.0, 20.0),
        color_matching(Observer::TwoDegree, lambda)[1],
    ]
}

/// C, M, Y and visual densities of a reflectance spectrum.
pub fn densities(reflectance: &Spectrum) -> Densities {
    let mut weighted = [0.0; DENSITY_SIZE];
    let mut norm = [0.0; DENSITY_SIZE];
    for band in 0..SPECTRUM_SIZE {
        let r = reflectance.values()[band].max(MIN_REFLECTANCE);
        let weights = density_weights(band);
        for k in 0..DENSITY_SIZE {
            weighted[k] += weights[k] * r;
            norm[k] += weights[k];
        }
    }
    let mut out = [0.0; DENSITY_SIZE];
    for k in 0..DENSITY_SIZE {
        out[k] = -(weighted[k] / norm[k]).max(MIN_REFLECTANCE).log10();
    }
    out
}

/// Index of the chromatic filter (C, M or Y) with the highest density.
pub fn auto_density_index(densities: &Densities) -> usize {
    let mut best = 0;
    for k in 1..3 {
        if densities[k] > densities[best] {
            best = k;
        }
    }
    best
}
