//! Correlated per-trial deviations via a non-centered Cholesky parameterization.
//!
//! A trial's 4-vector of deviations is `diag(sigma) * U^T * z` where `sigma` holds
//! the per-channel scales, `U` is the upper-triangular Cholesky factor of the
//! channel correlation matrix (`R = U^T U`) and `z` is a standard-normal latent.
//! `U` is parameterized by unconstrained reals mapped through `tanh` to canonical
//! partial correlations, so every proposal yields a valid correlation factor.

use faer::Mat;
use rand::rngs::StdRng;

use crate::utils::{sample_standard_normal, sample_symmetric_beta, usize_to_f64};

use super::curve::CurveParameters;
use super::priors::{ScalarPrior, log_lkj_cholesky_density};

/// Number of correlated curve-parameter channels per trial.
pub const EFFECT_CHANNELS: usize = 4;

/// Largest canonical partial correlation magnitude kept when mapping back to reals.
const MAX_PARTIAL_CORRELATION: f64 = 1.0 - 1.0e-12;

/// Curve parameter a random-effect channel perturbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectChannel {
    /// Additive offset on `d`.
    Ceiling,
    /// Additive offset on `f`.
    HormesisMagnitude,
    /// Log-scale offset on `e`.
    EffectiveDose,
    /// Log-scale offset on `b`.
    Slope,
}

impl EffectChannel {
    pub const ALL: [Self; EFFECT_CHANNELS] = [
        Self::Ceiling,
        Self::HormesisMagnitude,
        Self::EffectiveDose,
        Self::Slope,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Ceiling => 0,
            Self::HormesisMagnitude => 1,
            Self::EffectiveDose => 2,
            Self::Slope => 3,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Ceiling => "d",
            Self::HormesisMagnitude => "f",
            Self::EffectiveDose => "e",
            Self::Slope => "b",
        }
    }
}

/// Deviations shared by every observation of one trial.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrialEffect {
    pub deviations: [f64; EFFECT_CHANNELS],
}

impl TrialEffect {
    #[must_use]
    pub const fn channel(&self, channel: EffectChannel) -> f64 {
        self.deviations[channel.index()]
    }

    /// Offset population curve parameters by this trial's deviations.
    #[must_use]
    pub fn apply(&self, parameters: &CurveParameters) -> CurveParameters {
        CurveParameters {
            floor: parameters.floor,
            ceiling: parameters.ceiling + self.channel(EffectChannel::Ceiling),
            effective_dose: parameters.effective_dose
                * self.channel(EffectChannel::EffectiveDose).exp(),
            slope: parameters.slope * self.channel(EffectChannel::Slope).exp(),
            hormesis: parameters
                .hormesis
                .shifted(self.channel(EffectChannel::HormesisMagnitude)),
        }
    }
}

/// Upper-triangular Cholesky factor of a correlation matrix with its unconstrained coordinates.
#[derive(Debug, Clone)]
pub struct CholeskyFactor {
    upper: Mat<f64>,
    unconstrained: Vec<f64>,
    log_jacobian: f64,
}

impl CholeskyFactor {
    /// Factor of the identity correlation matrix.
    #[must_use]
    pub fn identity(dim: usize) -> Self {
        Self::from_unconstrained(dim, &vec![0.0; off_diagonal_count(dim)])
            .unwrap_or_else(|| Self {
                upper: crate::utils::identity_matrix(dim),
                unconstrained: Vec::new(),
                log_jacobian: 0.0,
            })
    }

    /// Map `dim * (dim - 1) / 2` unconstrained reals to a valid factor.
    ///
    /// Coordinates are consumed row by row over the strictly lower triangle of
    /// `U^T`. Returns `None` on a length mismatch or non-finite input.
    #[must_use]
    pub fn from_unconstrained(dim: usize, unconstrained: &[f64]) -> Option<Self> {
        if unconstrained.len() != off_diagonal_count(dim)
            || unconstrained.iter().any(|value| !value.is_finite())
        {
            return None;
        }

        let mut lower = Mat::<f64>::zeros(dim, dim);
        let mut log_jacobian = 0.0;
        let mut position = 0;
        if dim > 0 {
            lower[(0, 0)] = 1.0;
        }
        for row in 1..dim {
            let mut sum_squares: f64 = 0.0;
            for col in 0..row {
                let partial = unconstrained[position].tanh();
                position += 1;
                log_jacobian += (-partial * partial).ln_1p();
                let remaining = 1.0 - sum_squares;
                if col > 0 {
                    log_jacobian += 0.5 * remaining.ln();
                }
                let value = partial * remaining.max(0.0).sqrt();
                lower[(row, col)] = value;
                sum_squares += value * value;
            }
            lower[(row, row)] = (1.0 - sum_squares).max(0.0).sqrt();
        }

        Some(Self {
            upper: lower.transpose().to_owned(),
            unconstrained: unconstrained.to_vec(),
            log_jacobian,
        })
    }

    /// Factor a positive-definite correlation matrix.
    ///
    /// Returns `None` if the matrix is not a valid correlation matrix.
    #[must_use]
    pub fn from_correlation(correlation: &Mat<f64>) -> Option<Self> {
        let dim = correlation.nrows();
        if correlation.ncols() != dim || !crate::utils::matrix_is_finite(correlation) {
            return None;
        }
        for index in 0..dim {
            if (correlation[(index, index)] - 1.0).abs() > 1.0e-9 {
                return None;
            }
        }
        let lower = crate::utils::cholesky_lower(correlation)?;
        let mut unconstrained = Vec::with_capacity(off_diagonal_count(dim));
        for row in 1..dim {
            let mut sum_squares: f64 = 0.0;
            for col in 0..row {
                let value = lower[(row, col)];
                let partial = (value / (1.0 - sum_squares).sqrt())
                    .clamp(-MAX_PARTIAL_CORRELATION, MAX_PARTIAL_CORRELATION);
                unconstrained.push(partial.atanh());
                sum_squares += value * value;
            }
        }
        Self::from_unconstrained(dim, &unconstrained)
    }

    /// Draw a factor from the LKJ prior via canonical partial correlations.
    ///
    /// The partial correlation in column `j` is `2 * Beta(beta_j, beta_j) - 1` with
    /// `beta_j = eta + (dim - 2 - j) / 2`.
    pub fn sample_prior(dim: usize, eta: f64, rng: &mut StdRng) -> Self {
        let mut unconstrained = Vec::with_capacity(off_diagonal_count(dim));
        for row in 1..dim {
            for col in 0..row {
                let shape = 0.5f64.mul_add(usize_to_f64(dim - 2 - col), eta);
                let partial = sample_symmetric_beta(rng, shape)
                    .mul_add(2.0, -1.0)
                    .clamp(-MAX_PARTIAL_CORRELATION, MAX_PARTIAL_CORRELATION);
                unconstrained.push(partial.atanh());
            }
        }
        Self::from_unconstrained(dim, &unconstrained).unwrap_or_else(|| Self::identity(dim))
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.upper.nrows()
    }

    #[must_use]
    pub const fn upper(&self) -> &Mat<f64> {
        &self.upper
    }

    #[must_use]
    pub fn unconstrained(&self) -> &[f64] {
        &self.unconstrained
    }

    /// Correlation matrix `R = U^T U`.
    #[must_use]
    pub fn correlation(&self) -> Mat<f64> {
        self.upper.transpose() * self.upper.as_ref()
    }

    /// LKJ log-density of the factor plus the log-Jacobian of the unconstrained map.
    #[must_use]
    pub fn log_prior_density(&self, eta: f64) -> f64 {
        let diagonal = (0..self.dim())
            .map(|index| self.upper[(index, index)])
            .collect::<Vec<_>>();
        log_lkj_cholesky_density(&diagonal, eta) + self.log_jacobian
    }
}

/// Number of strictly lower-triangular entries of a `dim x dim` matrix.
#[must_use]
pub const fn off_diagonal_count(dim: usize) -> usize {
    dim * dim.saturating_sub(1) / 2
}

/// Index pairs `(i, j)`, `i < j`, of the upper off-diagonal entries in row-major order.
#[must_use]
pub fn correlation_pairs(dim: usize) -> Vec<(usize, usize)> {
    (0..dim)
        .flat_map(|row| ((row + 1)..dim).map(move |col| (row, col)))
        .collect()
}

/// Upper off-diagonal entries of a correlation matrix in [`correlation_pairs`] order.
#[must_use]
pub fn correlation_entries(correlation: &Mat<f64>) -> Vec<f64> {
    correlation_pairs(correlation.nrows())
        .into_iter()
        .map(|(row, col)| correlation[(row, col)])
        .collect()
}

/// Deviation vector `diag(scales) * U^T * latent`.
#[must_use]
pub fn trial_effect(
    scales: &[f64; EFFECT_CHANNELS],
    factor: &CholeskyFactor,
    latent: &[f64; EFFECT_CHANNELS],
) -> TrialEffect {
    let upper = factor.upper();
    let mut deviations = [0.0; EFFECT_CHANNELS];
    for (channel, deviation) in deviations.iter_mut().enumerate() {
        let mut correlated = 0.0;
        for (k, value) in latent.iter().enumerate().take(channel + 1) {
            correlated += upper[(k, channel)] * value;
        }
        *deviation = scales[channel] * correlated;
    }
    TrialEffect { deviations }
}

/// Scales, correlation factor and per-trial latents of the random-effect block.
#[derive(Debug, Clone)]
pub struct RandomEffectState {
    pub scales: [f64; EFFECT_CHANNELS],
    pub factor: CholeskyFactor,
    pub latents: Vec<[f64; EFFECT_CHANNELS]>,
}

impl RandomEffectState {
    /// Starting point for sampling: zero latents, identity correlation, small scales.
    #[must_use]
    pub fn centered(trials: usize, initial_scale: f64) -> Self {
        Self {
            scales: [initial_scale; EFFECT_CHANNELS],
            factor: CholeskyFactor::identity(EFFECT_CHANNELS),
            latents: vec![[0.0; EFFECT_CHANNELS]; trials],
        }
    }

    /// Instantiate the block from its priors: exponential scales, LKJ factor and
    /// standard-normal latents.
    pub fn draw_from_prior(trials: usize, scale_rate: f64, eta: f64, rng: &mut StdRng) -> Self {
        let scale_prior = ScalarPrior::Exponential { rate: scale_rate };
        let mut scales = [0.0; EFFECT_CHANNELS];
        for scale in &mut scales {
            *scale = scale_prior.sample(rng);
        }
        let factor = CholeskyFactor::sample_prior(EFFECT_CHANNELS, eta, rng);
        let latents = (0..trials)
            .map(|_| {
                let mut latent = [0.0; EFFECT_CHANNELS];
                for value in &mut latent {
                    *value = sample_standard_normal(rng);
                }
                latent
            })
            .collect();
        Self {
            scales,
            factor,
            latents,
        }
    }

    /// Deviations of every trial under the current block values.
    #[must_use]
    pub fn build_trial_effects(&self) -> Vec<TrialEffect> {
        self.latents
            .iter()
            .map(|latent| trial_effect(&self.scales, &self.factor, latent))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::hormesis::curve::HormesisTerm;
    use crate::utils::{cholesky_lower, max_abs_diff};
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    fn assert_valid_correlation(correlation: &Mat<f64>) {
        let dim = correlation.nrows();
        for i in 0..dim {
            assert_relative_eq!(correlation[(i, i)], 1.0, epsilon = 1.0e-12);
            for j in 0..dim {
                assert_relative_eq!(correlation[(i, j)], correlation[(j, i)], epsilon = 1.0e-12);
                assert!(correlation[(i, j)].abs() <= 1.0 + 1.0e-12);
            }
        }
        // Positive semi-definite: adding a tiny ridge must admit a Cholesky factor.
        let ridged = Mat::from_fn(dim, dim, |i, j| {
            correlation[(i, j)] + if i == j { 1.0e-10 } else { 0.0 }
        });
        assert!(cholesky_lower(&ridged).is_some());
    }

    #[test]
    fn factors_always_yield_valid_correlations() {
        let mut rng = StdRng::seed_from_u64(23);
        for _ in 0..200 {
            let unconstrained = (0..off_diagonal_count(EFFECT_CHANNELS))
                .map(|_| 3.0 * sample_standard_normal(&mut rng))
                .collect::<Vec<_>>();
            let factor = CholeskyFactor::from_unconstrained(EFFECT_CHANNELS, &unconstrained)
                .expect("finite coordinates");
            assert_valid_correlation(&factor.correlation());
        }
        for _ in 0..50 {
            let factor = CholeskyFactor::sample_prior(EFFECT_CHANNELS, 0.8, &mut rng);
            assert_valid_correlation(&factor.correlation());
        }
    }

    #[test]
    fn correlation_round_trips_through_factor() {
        let correlation = Mat::from_fn(4, 4, |i, j| match (i.min(j), i.max(j)) {
            (a, b) if a == b => 1.0,
            (0, 1) => 0.4,
            (0, 2) => -0.2,
            (1, 3) => 0.3,
            (2, 3) => 0.1,
            _ => 0.05,
        });
        let factor = CholeskyFactor::from_correlation(&correlation).expect("positive definite");
        assert!(max_abs_diff(&factor.correlation(), &correlation) < 1.0e-10);

        let rebuilt = CholeskyFactor::from_unconstrained(4, factor.unconstrained())
            .expect("finite coordinates");
        assert!(max_abs_diff(rebuilt.upper(), factor.upper()) < 1.0e-12);
    }

    #[test]
    fn from_correlation_rejects_non_unit_diagonal() {
        let matrix = Mat::from_fn(2, 2, |i, j| if i == j { 2.0 } else { 0.1 });
        assert!(CholeskyFactor::from_correlation(&matrix).is_none());
    }

    #[test]
    fn identity_factor_gives_scaled_latents() {
        let factor = CholeskyFactor::identity(EFFECT_CHANNELS);
        let effect = trial_effect(&[1.0, 2.0, 3.0, 4.0], &factor, &[1.0, -1.0, 0.5, 0.25]);
        assert_eq!(effect.deviations, [1.0, -2.0, 1.5, 1.0]);
    }

    #[test]
    fn effects_follow_prior_covariance() {
        let mut rng = StdRng::seed_from_u64(41);
        let mut block = RandomEffectState::draw_from_prior(20_000, 1.0, 2.0, &mut rng);
        block.scales = [0.5, 1.0, 1.5, 2.0];
        let effects = block.build_trial_effects();
        let correlation = block.factor.correlation();
        let n = usize_to_f64(effects.len());
        for (i, j) in [(0, 0), (0, 1), (2, 3), (1, 3)] {
            let empirical = effects
                .iter()
                .map(|effect| effect.deviations[i] * effect.deviations[j])
                .sum::<f64>()
                / n;
            let expected = block.scales[i] * block.scales[j] * correlation[(i, j)];
            assert!((empirical - expected).abs() < 0.1 * block.scales[i] * block.scales[j]);
        }
    }

    #[test]
    fn apply_offsets_positive_parameters_on_log_scale() {
        let effect = TrialEffect {
            deviations: [0.5, 0.1, 2.0_f64.ln(), -(2.0_f64.ln())],
        };
        let shifted = effect.apply(&CurveParameters {
            floor: 0.0,
            ceiling: 1.0,
            effective_dose: 3.0,
            slope: 2.0,
            hormesis: HormesisTerm::Inactive,
        });
        assert_relative_eq!(shifted.ceiling, 1.5);
        assert_relative_eq!(shifted.effective_dose, 6.0, epsilon = 1.0e-12);
        assert_relative_eq!(shifted.slope, 1.0, epsilon = 1.0e-12);
        assert_eq!(shifted.hormesis, HormesisTerm::Inactive);
    }

    #[test]
    fn log_prior_density_is_finite_for_valid_factors() {
        let factor = CholeskyFactor::identity(EFFECT_CHANNELS);
        assert!(factor.log_prior_density(2.0).is_finite());
        assert_relative_eq!(factor.log_prior_density(1.0), 0.0, epsilon = 1.0e-12);
    }
}
