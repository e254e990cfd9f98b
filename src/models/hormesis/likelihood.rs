//! Gaussian likelihood with per-cell residual caching.

use crate::utils::usize_to_f64;

use super::curve::{CurveParameters, CurveSign, evaluate_curve};
use super::effects::TrialEffect;

/// Gaussian log-likelihood of `count` residuals with sum of squares `sum_squares`.
#[must_use]
pub fn gaussian_log_likelihood(count: usize, sum_squares: f64, variance: f64) -> f64 {
    if !(variance > 0.0 && variance.is_finite() && sum_squares.is_finite()) {
        return f64::NEG_INFINITY;
    }
    let log_normalizer = (std::f64::consts::TAU * variance).ln();
    -0.5 * usize_to_f64(count).mul_add(log_normalizer, sum_squares / variance)
}

/// Residual sum of squares of `rows` under one trial's curve.
///
/// Returns `None` when any fitted mean is non-finite.
#[must_use]
pub fn cell_sum_squares(
    rows: &[usize],
    dose: &[f64],
    response: &[f64],
    parameters: &CurveParameters,
    effect: &TrialEffect,
    shape_exponent: f64,
    sign: CurveSign,
) -> Option<f64> {
    let trial_parameters = effect.apply(parameters);
    let mut sum_squares = 0.0;
    for row in rows.iter().copied() {
        let fitted = evaluate_curve(&trial_parameters, dose[row], shape_exponent, sign);
        if !fitted.is_finite() {
            return None;
        }
        let residual = response[row] - fitted;
        sum_squares += residual * residual;
    }
    sum_squares.is_finite().then_some(sum_squares)
}

/// Cached residual sums of squares with dirty flags for lazy recomputation.
#[derive(Debug, Clone)]
pub(crate) struct LikelihoodCache {
    sum_squares: Vec<f64>,
    dirty: Vec<bool>,
}

impl LikelihoodCache {
    pub(crate) fn new(cells: usize) -> Self {
        Self {
            sum_squares: vec![0.0; cells],
            dirty: vec![true; cells],
        }
    }

    pub(crate) fn is_dirty(&self, cell: usize) -> bool {
        self.dirty[cell]
    }

    pub(crate) fn get(&self, cell: usize) -> f64 {
        self.sum_squares[cell]
    }

    pub(crate) fn set(&mut self, cell: usize, sum_squares: f64) {
        self.sum_squares[cell] = sum_squares;
        self.dirty[cell] = false;
    }

    pub(crate) fn mark_dirty(&mut self, cells: &[usize]) {
        for cell in cells {
            self.dirty[*cell] = true;
        }
    }

    pub(crate) fn sum(&self, cells: &[usize]) -> f64 {
        cells.iter().map(|cell| self.sum_squares[*cell]).sum()
    }

    pub(crate) fn total(&self) -> f64 {
        self.sum_squares.iter().sum()
    }

    pub(crate) fn any_dirty(&self) -> bool {
        self.dirty.iter().any(|dirty| *dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::hormesis::curve::HormesisTerm;
    use approx::assert_relative_eq;

    #[test]
    fn log_likelihood_matches_row_sum() {
        let residuals = [0.1, -0.3, 0.25];
        let variance = 0.04;
        let row_sum = residuals
            .iter()
            .map(|r: &f64| {
                -0.5 * ((std::f64::consts::TAU * variance).ln() + r * r / variance)
            })
            .sum::<f64>();
        let sum_squares = residuals.iter().map(|r| r * r).sum::<f64>();
        assert_relative_eq!(
            gaussian_log_likelihood(3, sum_squares, variance),
            row_sum,
            epsilon = 1.0e-12
        );
        assert!(gaussian_log_likelihood(3, sum_squares, 0.0).is_infinite());
    }

    #[test]
    fn cell_sum_squares_is_zero_on_exact_curve() {
        let parameters = CurveParameters {
            floor: 0.0,
            ceiling: 1.0,
            effective_dose: 1.0,
            slope: 2.0,
            hormesis: HormesisTerm::Inactive,
        };
        let dose = [0.1, 1.0, 10.0];
        let response = dose.map(|x| 1.0 / (1.0 + x * x));
        let ss = cell_sum_squares(
            &[0, 1, 2],
            &dose,
            &response,
            &parameters,
            &TrialEffect::default(),
            0.5,
            CurveSign::Stimulatory,
        )
        .expect("finite curve");
        assert!(ss < 1.0e-24);
    }

    #[test]
    fn cache_tracks_dirty_cells() {
        let mut cache = LikelihoodCache::new(3);
        assert!(cache.any_dirty());
        for cell in 0..3 {
            cache.set(cell, 1.0 + usize_to_f64(cell));
        }
        assert!(!cache.any_dirty());
        cache.mark_dirty(&[1]);
        assert!(cache.is_dirty(1));
        assert_relative_eq!(cache.sum(&[0, 2]), 4.0);
        assert_relative_eq!(cache.total(), 6.0);
        assert_relative_eq!(cache.get(2), 3.0);
    }
}
