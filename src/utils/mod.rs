/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Shared numerical and random-variate utilities for model implementations.
//
// Created on: 24 Jan 2026     Author: Tobias Kragholm
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Utilities
//!
//! Shared helpers for small dense matrices, order statistics, and the
//! random variates the samplers draw from a seeded [`StdRng`].

use faer::Mat;
use num_traits::ToPrimitive;
use rand::RngExt;
use rand::rngs::StdRng;
use statrs::distribution::{ContinuousCDF, Normal};

/// Standardized bound beyond which tail mass is handled with an exponential approximation.
const TAIL_SWITCH: f64 = 8.0;

#[must_use]
pub fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

#[must_use]
pub fn matrix_is_finite(matrix: &Mat<f64>) -> bool {
    for i in 0..matrix.nrows() {
        for j in 0..matrix.ncols() {
            if !matrix[(i, j)].is_finite() {
                return false;
            }
        }
    }
    true
}

#[must_use]
pub fn identity_matrix(dim: usize) -> Mat<f64> {
    Mat::from_fn(dim, dim, |row, col| if row == col { 1.0 } else { 0.0 })
}

#[must_use]
pub fn max_abs_diff(a: &Mat<f64>, b: &Mat<f64>) -> f64 {
    let mut max = 0.0;
    for i in 0..a.nrows().min(b.nrows()) {
        for j in 0..a.ncols().min(b.ncols()) {
            let diff = (a[(i, j)] - b[(i, j)]).abs();
            if diff > max {
                max = diff;
            }
        }
    }
    max
}

/// Lower-triangular Cholesky factor of a symmetric positive-definite matrix.
///
/// Returns `None` when the matrix is not square or not numerically positive definite.
#[must_use]
pub fn cholesky_lower(matrix: &Mat<f64>) -> Option<Mat<f64>> {
    let dim = matrix.ncols();
    if matrix.nrows() != dim {
        return None;
    }
    let mut lower = Mat::<f64>::zeros(dim, dim);
    for row in 0..dim {
        for col in 0..=row {
            let mut sum = matrix[(row, col)];
            for k in 0..col {
                sum -= lower[(row, k)] * lower[(col, k)];
            }
            if row == col {
                if sum <= 0.0 {
                    return None;
                }
                lower[(row, col)] = sum.sqrt();
            } else {
                let denom = lower[(col, col)];
                if denom <= 0.0 {
                    return None;
                }
                lower[(row, col)] = sum / denom;
            }
        }
    }
    Some(lower)
}

/// Linear-interpolated quantile of already sorted values.
#[must_use]
pub fn percentile(sorted_values: &[f64], probability: f64) -> f64 {
    if sorted_values.is_empty() {
        return f64::NAN;
    }

    let clamped = probability.clamp(0.0, 1.0);
    let last = sorted_values.len() - 1;
    let position = clamped * usize_to_f64(last);
    let lower = position.floor().to_usize().unwrap_or(0);
    let upper = position.ceil().to_usize().unwrap_or(last);

    if lower == upper {
        sorted_values[lower]
    } else {
        let weight = position - usize_to_f64(lower);
        (1.0 - weight).mul_add(sorted_values[lower], weight * sorted_values[upper])
    }
}

#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / usize_to_f64(values.len())
}

pub fn sample_uniform(rng: &mut StdRng) -> f64 {
    rng.random::<f64>()
}

pub fn sample_standard_normal(rng: &mut StdRng) -> f64 {
    let u1 = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
    let u2 = rng.random::<f64>();
    (-2.0_f64 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

pub fn sample_gamma(rng: &mut StdRng, shape: f64, scale: f64) -> f64 {
    if !(shape > 0.0 && scale > 0.0) {
        return f64::NAN;
    }

    if shape < 1.0 {
        let u = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
        return sample_gamma(rng, shape + 1.0, scale) * u.powf(1.0 / shape);
    }

    let shape_minus_third = shape - (1.0 / 3.0);
    let coeff = (1.0 / (9.0 * shape_minus_third)).sqrt();
    loop {
        let standard_normal = sample_standard_normal(rng);
        let one_plus_coeff_noise = coeff.mul_add(standard_normal, 1.0);
        if one_plus_coeff_noise <= 0.0 {
            continue;
        }
        let cubic_term = one_plus_coeff_noise * one_plus_coeff_noise * one_plus_coeff_noise;
        let uniform = rng.random::<f64>();
        if uniform
            < (0.0331 * standard_normal * standard_normal * standard_normal)
                .mul_add(-standard_normal, 1.0)
        {
            return scale * shape_minus_third * cubic_term;
        }
        if uniform.ln()
            < (0.5 * standard_normal).mul_add(
                standard_normal,
                shape_minus_third * (1.0 - cubic_term + cubic_term.ln()),
            )
        {
            return scale * shape_minus_third * cubic_term;
        }
    }
}

/// Symmetric `Beta(shape, shape)` variate via two gamma draws.
pub fn sample_symmetric_beta(rng: &mut StdRng, shape: f64) -> f64 {
    let x = sample_gamma(rng, shape, 1.0);
    let y = sample_gamma(rng, shape, 1.0);
    x / (x + y)
}

/// Draw from `Normal(mean, sd^2)` truncated to `[lower, upper]`.
///
/// Uses inverse-CDF sampling on whichever side of the mean keeps precision,
/// switching to an exponential tail approximation far in the tails.
pub fn sample_truncated_normal(
    rng: &mut StdRng,
    mean: f64,
    sd: f64,
    lower: f64,
    upper: f64,
) -> f64 {
    if !(mean.is_finite() && sd.is_finite() && sd > 0.0) || lower >= upper {
        return f64::NAN;
    }
    if lower == f64::NEG_INFINITY && upper == f64::INFINITY {
        return sd.mul_add(sample_standard_normal(rng), mean);
    }
    let Ok(standard) = Normal::new(0.0, 1.0) else {
        return f64::NAN;
    };

    let alpha = (lower - mean) / sd;
    let beta = (upper - mean) / sd;
    let z = if alpha >= TAIL_SWITCH {
        sample_exponential_tail(rng, alpha, beta)
    } else if beta <= -TAIL_SWITCH {
        -sample_exponential_tail(rng, -beta, -alpha)
    } else if alpha > 0.0 {
        let upper_tail = standard.sf(alpha);
        let lower_tail = standard.sf(beta);
        let u = rng.random::<f64>().mul_add(upper_tail - lower_tail, lower_tail);
        -standard.inverse_cdf(u.clamp(f64::MIN_POSITIVE, 1.0))
    } else {
        let low = standard.cdf(alpha);
        let high = standard.cdf(beta);
        let u = rng.random::<f64>().mul_add(high - low, low);
        standard.inverse_cdf(u.clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON))
    };

    sd.mul_add(z, mean).clamp(lower, upper)
}

fn sample_exponential_tail(rng: &mut StdRng, start: f64, stop: f64) -> f64 {
    loop {
        let u = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
        let candidate = start - u.ln() / start;
        if candidate <= stop {
            return candidate;
        }
    }
}
