//! Prior specifications and log-density helpers for the hormesis model.

use rand::rngs::StdRng;
use statrs::function::gamma::ln_gamma;

use crate::utils::{sample_standard_normal, sample_uniform};

use super::types::ConfigurationError;

/// Univariate prior families available for scalar curve parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarPrior {
    Normal { mean: f64, sd: f64 },
    /// Normal(0, sd^2) folded onto `[0, inf)`.
    HalfNormal { sd: f64 },
    Uniform { lower: f64, upper: f64 },
    Exponential { rate: f64 },
}

/// Quadratic and linear coefficients of a log-prior in `theta`, plus its support.
///
/// The log-density equals `-0.5 * precision * theta^2 + linear * theta` up to a
/// constant on `[lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConjugateTerms {
    pub precision: f64,
    pub linear: f64,
    pub lower: f64,
    pub upper: f64,
}

impl ScalarPrior {
    #[must_use]
    pub fn is_valid(self) -> bool {
        match self {
            Self::Normal { mean, sd } => mean.is_finite() && sd.is_finite() && sd > 0.0,
            Self::HalfNormal { sd } => sd.is_finite() && sd > 0.0,
            Self::Uniform { lower, upper } => {
                lower.is_finite() && upper.is_finite() && lower < upper
            }
            Self::Exponential { rate } => rate.is_finite() && rate > 0.0,
        }
    }

    /// Closed support `(lower, upper)`.
    #[must_use]
    pub const fn support(self) -> (f64, f64) {
        match self {
            Self::Normal { .. } => (f64::NEG_INFINITY, f64::INFINITY),
            Self::HalfNormal { .. } | Self::Exponential { .. } => (0.0, f64::INFINITY),
            Self::Uniform { lower, upper } => (lower, upper),
        }
    }

    #[must_use]
    pub fn contains(self, value: f64) -> bool {
        let (lower, upper) = self.support();
        value.is_finite() && value >= lower && value <= upper
    }

    #[must_use]
    pub fn log_density(self, value: f64) -> f64 {
        if !self.contains(value) {
            return f64::NEG_INFINITY;
        }
        match self {
            Self::Normal { mean, sd } => log_normal_density(value, mean, sd),
            Self::HalfNormal { sd } => std::f64::consts::LN_2 + log_normal_density(value, 0.0, sd),
            Self::Uniform { lower, upper } => log_uniform_density(value, lower, upper),
            Self::Exponential { rate } => log_exponential_density(value, rate),
        }
    }

    pub fn sample(self, rng: &mut StdRng) -> f64 {
        match self {
            Self::Normal { mean, sd } => sd.mul_add(sample_standard_normal(rng), mean),
            Self::HalfNormal { sd } => (sd * sample_standard_normal(rng)).abs(),
            Self::Uniform { lower, upper } => (upper - lower).mul_add(sample_uniform(rng), lower),
            Self::Exponential { rate } => {
                let u = (1.0 - sample_uniform(rng)).max(f64::MIN_POSITIVE);
                -u.ln() / rate
            }
        }
    }

    #[must_use]
    pub const fn conjugate_terms(self) -> ConjugateTerms {
        let (lower, upper) = self.support();
        let (precision, linear) = match self {
            Self::Normal { mean, sd } => (1.0 / (sd * sd), mean / (sd * sd)),
            Self::HalfNormal { sd } => (1.0 / (sd * sd), 0.0),
            Self::Uniform { .. } => (0.0, 0.0),
            Self::Exponential { rate } => (0.0, -rate),
        };
        ConjugateTerms {
            precision,
            linear,
            lower,
            upper,
        }
    }
}

/// Hyperparameters for the hormesis prior set.
#[derive(Debug, Clone, Copy)]
pub struct PriorConfig {
    /// Prior on the floor `c`.
    pub floor: ScalarPrior,
    /// Prior on the ceiling `d`.
    pub ceiling: ScalarPrior,
    /// Prior on the hormesis magnitude `f`.
    pub hormesis_magnitude: ScalarPrior,
    /// Prior inclusion probability `P(w = 1)`.
    pub inclusion_probability: f64,
    /// Prior on the slope `b`; its support must lie in `[0, inf)`.
    pub slope: ScalarPrior,
    /// Upper bound of the uniform prior on `e`; `None` uses the largest observed dose.
    pub effective_dose_upper: Option<f64>,
    /// Rate of the exponential prior on each random-effect scale.
    pub effect_scale_rate: f64,
    /// LKJ shape `eta` of the Cholesky-factor correlation prior.
    pub lkj_shape: f64,
    /// Shape of the inverse-gamma prior on the residual variance.
    pub residual_variance_shape: f64,
    /// Scale of the inverse-gamma prior on the residual variance.
    pub residual_variance_scale: f64,
    /// Auxiliary proposal for `f` on `0 -> 1` jumps; `None` reuses the `f` prior.
    pub jump_proposal: Option<ScalarPrior>,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            floor: ScalarPrior::Normal {
                mean: 0.0,
                sd: 100.0,
            },
            ceiling: ScalarPrior::Normal {
                mean: 0.0,
                sd: 100.0,
            },
            hormesis_magnitude: ScalarPrior::HalfNormal { sd: 1.0 },
            inclusion_probability: 0.5,
            slope: ScalarPrior::Uniform {
                lower: 0.0,
                upper: 20.0,
            },
            effective_dose_upper: None,
            effect_scale_rate: 1.0,
            lkj_shape: 2.0,
            residual_variance_shape: 0.01,
            residual_variance_scale: 0.01,
            jump_proposal: None,
        }
    }
}

impl PriorConfig {
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidPrior` naming the first malformed prior.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |parameter| Err(ConfigurationError::InvalidPrior { parameter });
        if !self.floor.is_valid() {
            return invalid("floor");
        }
        if !self.ceiling.is_valid() {
            return invalid("ceiling");
        }
        if !self.hormesis_magnitude.is_valid() {
            return invalid("hormesis_magnitude");
        }
        if !(self.inclusion_probability > 0.0 && self.inclusion_probability < 1.0) {
            return invalid("inclusion_probability");
        }
        if !self.slope.is_valid() || self.slope.support().0 < 0.0 {
            return invalid("slope");
        }
        if self
            .effective_dose_upper
            .is_some_and(|upper| !(upper.is_finite() && upper > 0.0))
        {
            return invalid("effective_dose");
        }
        if !(self.effect_scale_rate.is_finite() && self.effect_scale_rate > 0.0) {
            return invalid("effect_scale");
        }
        if !(self.lkj_shape.is_finite() && self.lkj_shape > 0.0) {
            return invalid("correlation");
        }
        if !(self.residual_variance_shape > 0.0
            && self.residual_variance_scale > 0.0
            && self.residual_variance_shape.is_finite()
            && self.residual_variance_scale.is_finite())
        {
            return invalid("residual_variance");
        }
        if self.jump_proposal.is_some_and(|proposal| !proposal.is_valid()) {
            return invalid("jump_proposal");
        }
        Ok(())
    }

    /// Proposal density used for the magnitude on a `0 -> 1` jump.
    #[must_use]
    pub fn magnitude_jump_proposal(&self) -> ScalarPrior {
        self.jump_proposal.unwrap_or(self.hormesis_magnitude)
    }
}

/// Log-density for `Normal(mean, sd^2)`.
#[must_use]
pub fn log_normal_density(value: f64, mean: f64, sd: f64) -> f64 {
    if sd <= 0.0 {
        return f64::NEG_INFINITY;
    }
    let z = (value - mean) / sd;
    -0.5 * z.mul_add(z, std::f64::consts::TAU.ln()) - sd.ln()
}

/// Log-density for `Uniform(low, high)`.
#[must_use]
pub fn log_uniform_density(value: f64, low: f64, high: f64) -> f64 {
    if low.partial_cmp(&high) != Some(std::cmp::Ordering::Less) {
        return f64::NAN;
    }
    if (low..=high).contains(&value) {
        -(high - low).ln()
    } else {
        f64::NEG_INFINITY
    }
}

/// Log-density for `Exponential(rate)`.
#[must_use]
pub fn log_exponential_density(value: f64, rate: f64) -> f64 {
    if !(value >= 0.0 && rate > 0.0) {
        return f64::NEG_INFINITY;
    }
    rate.ln() - rate * value
}

/// Log-density for an inverse-gamma distribution.
#[must_use]
pub fn log_inverse_gamma_density(value: f64, shape: f64, scale: f64) -> f64 {
    if !(value > 0.0 && shape > 0.0 && scale > 0.0) {
        return f64::NEG_INFINITY;
    }

    shape.mul_add(scale.ln(), -ln_gamma(shape)) - (shape + 1.0).mul_add(value.ln(), scale / value)
}

/// Unnormalized LKJ log-density of a correlation Cholesky factor from its diagonal.
///
/// `sum_{i >= 1} (K - i - 3 + 2 eta) ln U_ii` for zero-based `i`.
#[must_use]
pub fn log_lkj_cholesky_density(diagonal: &[f64], eta: f64) -> f64 {
    let dim = diagonal.len();
    let mut log_density = 0.0;
    for (index, value) in diagonal.iter().enumerate().skip(1) {
        if *value <= 0.0 {
            return f64::NEG_INFINITY;
        }
        let power = crate::utils::usize_to_f64(dim - index) - 3.0 + 2.0 * eta;
        log_density += power * value.ln();
    }
    log_density
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    #[test]
    fn prior_defaults_are_valid() {
        assert!(PriorConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_names_the_broken_prior() {
        let config = PriorConfig {
            slope: ScalarPrior::Uniform {
                lower: -1.0,
                upper: 20.0,
            },
            ..PriorConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::InvalidPrior { parameter: "slope" })
        );

        let config = PriorConfig {
            inclusion_probability: 1.0,
            ..PriorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverse_gamma_density_requires_positive_inputs() {
        let ll = log_inverse_gamma_density(0.0, 1.0, 1.0);
        assert!(!ll.is_finite());
    }

    #[test]
    fn half_normal_doubles_normal_density() {
        let prior = ScalarPrior::HalfNormal { sd: 2.0 };
        assert_relative_eq!(
            prior.log_density(0.7),
            std::f64::consts::LN_2 + log_normal_density(0.7, 0.0, 2.0),
            epsilon = 1.0e-12
        );
        assert!(prior.log_density(-0.1).is_infinite());
    }

    #[test]
    fn samples_stay_in_support() {
        let mut rng = StdRng::seed_from_u64(17);
        let priors = [
            ScalarPrior::HalfNormal { sd: 1.0 },
            ScalarPrior::Uniform {
                lower: 0.0,
                upper: 20.0,
            },
            ScalarPrior::Exponential { rate: 3.0 },
        ];
        for prior in priors {
            for _ in 0..200 {
                assert!(prior.contains(prior.sample(&mut rng)));
            }
        }
    }

    #[test]
    fn conjugate_terms_match_normal_log_density() {
        let prior = ScalarPrior::Normal { mean: 1.5, sd: 2.0 };
        let terms = prior.conjugate_terms();
        let quadratic = |x: f64| (-0.5 * terms.precision * x).mul_add(x, terms.linear * x);
        let lhs = prior.log_density(3.0) - prior.log_density(-1.0);
        assert_relative_eq!(lhs, quadratic(3.0) - quadratic(-1.0), epsilon = 1.0e-12);
    }

    #[test]
    fn lkj_density_is_flat_at_eta_one_for_two_dims() {
        assert_relative_eq!(log_lkj_cholesky_density(&[1.0, 0.6], 1.0), 0.0);
        assert!(log_lkj_cholesky_density(&[1.0, 0.6, 0.5], 2.0) < 0.0);
    }
}
