//! Pure numeric transforms over calibration and raw samples.

use crate::protocol::{ADC_LEVELS, MAX_ADC, PIXEL_COUNT};

/// Evaluate `Σ coeffs[j] · x^j`, constant term first.
fn polynomial(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, &c| acc * x + c)
}

/// Wavelength of each pixel: `c0 + c1·p + c2·p² + c3·p³`.
pub fn wavelength_table(coeffs: &[f64; 4]) -> Vec<f64> {
    (0..PIXEL_COUNT)
        .map(|pixel| polynomial(coeffs, pixel as f64))
        .collect()
}

/// Correction factor for each ADC level, using the first `order` coefficients.
///
/// An order of 0 gives an all-zero table.
pub fn linearity_correction_table(coeffs: &[f64], order: usize) -> Vec<f64> {
    let active = &coeffs[..order.min(coeffs.len())];
    (0..ADC_LEVELS)
        .map(|level| polynomial(active, level as f64))
        .collect()
}

/// Scale raw counts to 0.0–1.0 of full ADC range, optionally multiplying by
/// the linearity-correction factor for each sample's level.
pub fn normalize(raw: &[u16], correction: Option<&[f64]>) -> Vec<f64> {
    let full_scale = f64::from(MAX_ADC);
    raw.iter()
        .map(|&sample| {
            let value = f64::from(sample) / full_scale;
            match correction {
                Some(table) => {
                    let level = usize::from(sample.min(MAX_ADC));
                    value * table.get(level).copied().unwrap_or(1.0)
                }
                None => value,
            }
        })
        .collect()
}
