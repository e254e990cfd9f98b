//! Posterior predictive curves and checks.

use crate::utils::usize_to_f64;

use super::curve::evaluate_curve;
use super::effects::TrialEffect;
use super::model::HormesisModel;
use super::posterior::{IntervalSummary, PosteriorDraw, PosteriorSamples, summarize_interval};
use super::types::{ConfigurationError, HormesisError};

/// Doses at which predictive curves are evaluated.
#[derive(Debug, Clone, PartialEq)]
pub enum DoseGrid {
    Explicit(Vec<f64>),
    /// `count` evenly spaced doses from `lower` to `upper`.
    Linear { lower: f64, upper: f64, count: usize },
    /// `count` doses evenly spaced on the log scale.
    Logarithmic { lower: f64, upper: f64, count: usize },
}

impl DoseGrid {
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidDoseGrid` if the grid is empty or any
    /// dose is non-positive or non-finite.
    pub fn doses(&self) -> Result<Vec<f64>, ConfigurationError> {
        let doses = match self {
            Self::Explicit(doses) => doses.clone(),
            Self::Linear {
                lower,
                upper,
                count,
            } => spaced(*lower, *upper, *count)?,
            Self::Logarithmic {
                lower,
                upper,
                count,
            } => {
                if !(*lower > 0.0) {
                    return Err(ConfigurationError::InvalidDoseGrid);
                }
                spaced(lower.ln(), upper.ln(), *count)?
                    .into_iter()
                    .map(f64::exp)
                    .collect()
            }
        };
        if doses.is_empty() || doses.iter().any(|dose| !(dose.is_finite() && *dose > 0.0)) {
            return Err(ConfigurationError::InvalidDoseGrid);
        }
        Ok(doses)
    }
}

fn spaced(lower: f64, upper: f64, count: usize) -> Result<Vec<f64>, ConfigurationError> {
    if count == 0 || !(lower.is_finite() && upper.is_finite()) || lower > upper {
        return Err(ConfigurationError::InvalidDoseGrid);
    }
    if count == 1 {
        return Ok(vec![lower]);
    }
    let step = (upper - lower) / usize_to_f64(count - 1);
    Ok((0..count)
        .map(|index| step.mul_add(usize_to_f64(index), lower))
        .collect())
}

/// Which curve a predictive point summarises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredictiveTarget {
    /// Average of the trial-specific curves over the trials observed for the group.
    #[default]
    FittedTrials,
    /// Group-level curve with every trial deviation set to zero.
    Population,
}

#[derive(Debug, Clone, Copy)]
pub struct PredictiveOptions {
    pub credible_mass: f64,
    pub target: PredictiveTarget,
}

impl Default for PredictiveOptions {
    fn default() -> Self {
        Self {
            credible_mass: 0.95,
            target: PredictiveTarget::default(),
        }
    }
}

impl PredictiveOptions {
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidCredibleMass` outside `(0, 1)`.
    pub fn validate(self) -> Result<(), ConfigurationError> {
        if self.credible_mass > 0.0 && self.credible_mass < 1.0 {
            Ok(())
        } else {
            Err(ConfigurationError::InvalidCredibleMass(self.credible_mass))
        }
    }
}

/// Predictive summary of one group's curve at one dose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictivePoint {
    pub dose: f64,
    pub species: usize,
    pub level: usize,
    pub mean: f64,
    pub median: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Evaluate every group's curve at each grid dose across draws.
///
/// With `PredictiveTarget::FittedTrials` each draw contributes the mean of the
/// group's trial-specific curves, which is what the data identify when trials
/// are few. Uses the sign convention of the response type the model was fit
/// to. Points are ordered by group, then by dose.
///
/// # Errors
///
/// Returns `HormesisError` if the grid or options are invalid, there are no
/// draws, or a draw does not match the model's groups.
pub fn posterior_predictive_curves(
    model: &HormesisModel,
    samples: &PosteriorSamples,
    grid: &DoseGrid,
    options: PredictiveOptions,
) -> Result<Vec<PredictivePoint>, HormesisError> {
    options.validate()?;
    let doses = grid.doses()?;
    check_draws(model, samples)?;

    let data = model.data();
    let dims = model.dimensions();
    let sign = model.sign();
    let alpha = model.shape_exponent();
    let mut points = Vec::with_capacity(dims.groups() * doses.len());
    let mut values = Vec::with_capacity(samples.len());
    for group in 0..dims.groups() {
        let (species, level) = dims.group_label(group);
        let trials = match options.target {
            PredictiveTarget::FittedTrials => data.group_cells[group]
                .iter()
                .map(|cell| data.cells[*cell].trial)
                .collect::<Vec<_>>(),
            PredictiveTarget::Population => Vec::new(),
        };
        for dose in doses.iter().copied() {
            values.clear();
            values.extend(samples.draws.iter().map(|draw| {
                let parameters = &draw.groups[group];
                if trials.is_empty() || draw.random_effects.is_none() {
                    return evaluate_curve(parameters, dose, alpha, sign);
                }
                let total = trials
                    .iter()
                    .map(|trial| {
                        let shifted = row_effect(draw, *trial).apply(parameters);
                        evaluate_curve(&shifted, dose, alpha, sign)
                    })
                    .sum::<f64>();
                total / usize_to_f64(trials.len())
            }));
            let summary = summarize_interval(&values, options.credible_mass);
            points.push(PredictivePoint {
                dose,
                species,
                level,
                mean: summary.mean,
                median: summary.median,
                lower: summary.lower,
                upper: summary.upper,
            });
        }
    }
    Ok(points)
}

/// Observed group mean against the posterior of the fitted mean and residual RMSE.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictiveCheck {
    pub species: usize,
    pub level: usize,
    pub observed_mean: f64,
    pub fitted_mean: IntervalSummary,
    pub residual_rmse: IntervalSummary,
}

impl PredictiveCheck {
    #[must_use]
    pub fn covers_observed_mean(&self) -> bool {
        (self.fitted_mean.lower..=self.fitted_mean.upper).contains(&self.observed_mean)
    }
}

/// Per-group posterior predictive check using each row's trial-specific curve.
///
/// # Errors
///
/// Returns `HormesisError` if the options are invalid, there are no draws, or
/// a draw does not match the model layout.
pub fn posterior_predictive_check(
    model: &HormesisModel,
    samples: &PosteriorSamples,
    options: PredictiveOptions,
) -> Result<Vec<PredictiveCheck>, HormesisError> {
    options.validate()?;
    check_draws(model, samples)?;

    let data = model.data();
    let dims = model.dimensions();
    let sign = model.sign();
    let mut checks = Vec::with_capacity(dims.groups());
    for group in 0..dims.groups() {
        let (species, level) = dims.group_label(group);
        let rows = data.group_rows(group).collect::<Vec<_>>();
        let n = usize_to_f64(rows.len());
        let observed_mean = rows.iter().map(|row| data.response[*row]).sum::<f64>() / n;

        let mut fitted_means = Vec::with_capacity(samples.len());
        let mut rmse = Vec::with_capacity(samples.len());
        for draw in &samples.draws {
            let mut fitted_sum = 0.0;
            let mut squared_sum = 0.0;
            for row in rows.iter().copied() {
                let parameters = row_effect(draw, data.row_trial[row]).apply(&draw.groups[group]);
                let fitted =
                    evaluate_curve(&parameters, data.dose[row], model.shape_exponent(), sign);
                let residual = data.response[row] - fitted;
                fitted_sum += fitted;
                squared_sum += residual * residual;
            }
            fitted_means.push(fitted_sum / n);
            rmse.push((squared_sum / n).sqrt());
        }

        checks.push(PredictiveCheck {
            species,
            level,
            observed_mean,
            fitted_mean: summarize_interval(&fitted_means, options.credible_mass),
            residual_rmse: summarize_interval(&rmse, options.credible_mass),
        });
    }
    Ok(checks)
}

fn row_effect(draw: &PosteriorDraw, trial: usize) -> TrialEffect {
    draw.random_effects
        .as_ref()
        .map_or_else(TrialEffect::default, |block| block.trial_effects[trial])
}

fn check_draws(model: &HormesisModel, samples: &PosteriorSamples) -> Result<(), HormesisError> {
    if samples.is_empty() {
        return Err(HormesisError::EmptyPosterior);
    }
    let dims = model.dimensions();
    if samples.draws.iter().any(|draw| {
        draw.groups.len() != dims.groups()
            || draw
                .random_effects
                .as_ref()
                .is_some_and(|block| block.trial_effects.len() != dims.trials)
    }) {
        return Err(HormesisError::InconsistentPosteriorDimensions);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{DoseResponseInput, ResponseType};
    use crate::models::hormesis::curve::{CurveParameters, HormesisTerm, log_logistic_mean};
    use crate::models::hormesis::effects::{EFFECT_CHANNELS, off_diagonal_count};
    use crate::models::hormesis::model::ModelConfig;
    use crate::models::hormesis::posterior::RandomEffectDraw;
    use crate::models::hormesis::types::{ModelDimensions, RandomEffectsStructure};
    use approx::assert_relative_eq;

    fn model(response_type: ResponseType) -> HormesisModel {
        model_with(response_type, RandomEffectsStructure::Disabled)
    }

    fn model_with(
        response_type: ResponseType,
        random_effects: RandomEffectsStructure,
    ) -> HormesisModel {
        let dose = vec![0.1, 1.0, 10.0, 0.1, 1.0, 10.0];
        let response = dose
            .iter()
            .map(|x| log_logistic_mean(0.0, 1.0, 1.0, 2.0, *x))
            .collect();
        let mut config = ModelConfig::new(ModelDimensions {
            species: 2,
            levels: 1,
            trials: 1,
        });
        config.random_effects = random_effects;
        HormesisModel::build(
            &DoseResponseInput::new(
                dose,
                response,
                vec![1, 1, 1, 2, 2, 2],
                vec![1; 6],
                response_type,
            ),
            config,
        )
        .expect("valid model")
    }

    fn samples(hormesis: HormesisTerm) -> PosteriorSamples {
        let group = CurveParameters {
            floor: 0.0,
            ceiling: 1.0,
            effective_dose: 1.0,
            slope: 2.0,
            hormesis,
        };
        PosteriorSamples {
            draws: vec![
                PosteriorDraw {
                    groups: vec![group, group],
                    residual_variance: 1.0e-4,
                    random_effects: None,
                    effective_dose_differences: vec![0.0],
                    ceiling_differences: vec![0.0],
                };
                5
            ],
        }
    }

    #[test]
    fn grids_produce_positive_doses() {
        let linear = DoseGrid::Linear {
            lower: 1.0,
            upper: 3.0,
            count: 3,
        };
        assert_eq!(linear.doses().expect("valid grid"), vec![1.0, 2.0, 3.0]);
        let log = DoseGrid::Logarithmic {
            lower: 0.1,
            upper: 10.0,
            count: 3,
        }
        .doses()
        .expect("valid grid");
        assert_relative_eq!(log[1], 1.0, epsilon = 1.0e-12);
        assert!(DoseGrid::Explicit(vec![0.0, 1.0]).doses().is_err());
        assert!(DoseGrid::Explicit(Vec::new()).doses().is_err());
        assert!(
            DoseGrid::Linear {
                lower: 0.0,
                upper: 1.0,
                count: 2
            }
            .doses()
            .is_err()
        );
    }

    #[test]
    fn curves_match_the_analytic_mean() {
        let model = model(ResponseType::Absorbance);
        let points = posterior_predictive_curves(
            &model,
            &samples(HormesisTerm::Inactive),
            &DoseGrid::Explicit(vec![0.1, 1.0, 10.0]),
            PredictiveOptions::default(),
        )
        .expect("valid draws");
        assert_eq!(points.len(), 6);
        assert_eq!((points[4].species, points[4].level), (2, 1));
        for point in &points {
            let expected = log_logistic_mean(0.0, 1.0, 1.0, 2.0, point.dose);
            assert_relative_eq!(point.median, expected, epsilon = 1.0e-12);
            assert!(point.lower <= point.median && point.median <= point.upper);
        }
    }

    #[test]
    fn curves_follow_the_fitted_sign() {
        let grid = DoseGrid::Explicit(vec![1.0]);
        let stimulatory = posterior_predictive_curves(
            &model(ResponseType::Absorbance),
            &samples(HormesisTerm::Active(0.5)),
            &grid,
            PredictiveOptions::default(),
        )
        .expect("valid draws");
        let inhibitory = posterior_predictive_curves(
            &model(ResponseType::Inhibition),
            &samples(HormesisTerm::Active(0.5)),
            &grid,
            PredictiveOptions::default(),
        )
        .expect("valid draws");
        assert!(stimulatory[0].median > 0.5);
        assert!(inhibitory[0].median < 0.5);
    }

    #[test]
    fn fitted_trials_target_includes_trial_deviations() {
        let model = model_with(ResponseType::Absorbance, RandomEffectsStructure::CorrelatedTrials);
        let mut draws = samples(HormesisTerm::Inactive);
        for draw in &mut draws.draws {
            draw.random_effects = Some(RandomEffectDraw {
                scales: [1.0; EFFECT_CHANNELS],
                correlation: vec![0.0; off_diagonal_count(EFFECT_CHANNELS)],
                trial_effects: vec![TrialEffect {
                    deviations: [0.0, 0.0, 2.0_f64.ln(), 0.0],
                }],
            });
        }
        let grid = DoseGrid::Explicit(vec![1.0]);
        let fitted =
            posterior_predictive_curves(&model, &draws, &grid, PredictiveOptions::default())
                .expect("valid draws");
        let population = posterior_predictive_curves(
            &model,
            &draws,
            &grid,
            PredictiveOptions {
                target: PredictiveTarget::Population,
                ..PredictiveOptions::default()
            },
        )
        .expect("valid draws");
        let shifted = log_logistic_mean(0.0, 1.0, 2.0, 2.0, 1.0);
        assert_relative_eq!(fitted[0].median, shifted, epsilon = 1.0e-12);
        assert_relative_eq!(population[0].median, 0.5, epsilon = 1.0e-12);

        for draw in &mut draws.draws {
            if let Some(block) = draw.random_effects.as_mut() {
                block.trial_effects.push(TrialEffect::default());
            }
        }
        assert_eq!(
            posterior_predictive_curves(&model, &draws, &grid, PredictiveOptions::default()),
            Err(HormesisError::InconsistentPosteriorDimensions)
        );
    }

    #[test]
    fn check_covers_exact_fit() {
        let model = model(ResponseType::Absorbance);
        let checks = posterior_predictive_check(
            &model,
            &samples(HormesisTerm::Inactive),
            PredictiveOptions::default(),
        )
        .expect("valid draws");
        assert_eq!(checks.len(), 2);
        for check in &checks {
            assert!(check.covers_observed_mean());
            assert!(check.residual_rmse.median < 1.0e-12);
        }
        assert_eq!(
            posterior_predictive_check(
                &model,
                &PosteriorSamples::default(),
                PredictiveOptions::default()
            ),
            Err(HormesisError::EmptyPosterior)
        );
    }
}
