//! Posterior storage and summaries for the hormesis model.

use crate::utils::{percentile, usize_to_f64};

use super::curve::{CurveParameters, HormesisTerm};
use super::diagnostics::{effective_sample_size, split_rhat};
use super::effects::{EFFECT_CHANNELS, EffectChannel, TrialEffect, correlation_pairs};
use super::graph::{NodeId, difference_pairs};
use super::model::HormesisModel;
use super::types::{ConfigurationError, HormesisError, RandomEffectsStructure};

/// Random-effect block of one draw.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomEffectDraw {
    pub scales: [f64; EFFECT_CHANNELS],
    /// Upper off-diagonal correlations in `correlation_pairs` order.
    pub correlation: Vec<f64>,
    pub trial_effects: Vec<TrialEffect>,
}

/// A single posterior draw, including derived quantities.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorDraw {
    /// Population curve parameters per group.
    pub groups: Vec<CurveParameters>,
    pub residual_variance: f64,
    pub random_effects: Option<RandomEffectDraw>,
    /// `e_g - e_h` for every group pair `g < h`.
    pub effective_dose_differences: Vec<f64>,
    /// `d_g - d_h` for every group pair `g < h`.
    pub ceiling_differences: Vec<f64>,
}

impl PosteriorDraw {
    /// Flatten the draw in [`parameter_names`] order.
    #[must_use]
    pub fn scalars(&self) -> Vec<f64> {
        let mut values = Vec::with_capacity(6 * self.groups.len() + 1);
        for group in &self.groups {
            values.push(group.floor);
            values.push(group.ceiling);
            values.push(group.effective_dose);
            values.push(group.slope);
            values.push(if group.hormesis.is_active() { 1.0 } else { 0.0 });
            values.push(group.hormesis.contribution());
        }
        values.push(self.residual_variance.sqrt());
        if let Some(block) = &self.random_effects {
            values.extend_from_slice(&block.scales);
            values.extend_from_slice(&block.correlation);
            for effect in &block.trial_effects {
                values.extend_from_slice(&effect.deviations);
            }
        }
        values.extend_from_slice(&self.effective_dose_differences);
        values.extend_from_slice(&self.ceiling_differences);
        values
    }

    fn matches(&self, model: &HormesisModel) -> bool {
        let dims = model.dimensions();
        let pairs = difference_pairs(dims.groups()).len();
        let structure = model.random_effects();
        let block_matches = match (&self.random_effects, structure) {
            (None, RandomEffectsStructure::Disabled) => true,
            (Some(block), RandomEffectsStructure::CorrelatedTrials) => {
                let channels = structure.random_effect_dimension();
                block.trial_effects.len() == dims.trials
                    && block.correlation.len() == correlation_pairs(channels).len()
            }
            _ => false,
        };
        self.groups.len() == dims.groups()
            && self.effective_dose_differences.len() == pairs
            && self.ceiling_differences.len() == pairs
            && block_matches
    }
}

/// Retained draws of one chain.
#[derive(Debug, Clone, Default)]
pub struct PosteriorSamples {
    pub draws: Vec<PosteriorDraw>,
}

impl PosteriorSamples {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.draws.len()
    }

    /// Concatenate chains in order.
    #[must_use]
    pub fn pooled(chains: &[Self]) -> Self {
        Self {
            draws: chains
                .iter()
                .flat_map(|chain| chain.draws.iter().cloned())
                .collect(),
        }
    }
}

/// Mean, median and equal-tailed credible bounds of a scalar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalSummary {
    pub mean: f64,
    pub lower: f64,
    pub median: f64,
    pub upper: f64,
}

/// Summarize `values` with an equal-tailed interval holding `credible_mass`.
#[must_use]
pub fn summarize_interval(values: &[f64], credible_mass: f64) -> IntervalSummary {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let tail = 0.5 * (1.0 - credible_mass);
    IntervalSummary {
        mean: crate::utils::mean(values),
        lower: percentile(&sorted, tail),
        median: percentile(&sorted, 0.5),
        upper: percentile(&sorted, 1.0 - tail),
    }
}

/// Scalar posterior summary statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub lower: f64,
    pub median: f64,
    pub upper: f64,
    /// `None` when a chain retained fewer than four draws.
    pub split_rhat: Option<f64>,
    /// Summed over chains.
    pub ess: f64,
}

impl ParameterSummary {
    fn from_chains(name: String, chains: &[Vec<f64>], credible_mass: f64) -> Self {
        let pooled = chains.iter().flatten().copied().collect::<Vec<_>>();
        let interval = summarize_interval(&pooled, credible_mass);
        let n = usize_to_f64(pooled.len()).max(1.0);
        let variance = pooled
            .iter()
            .map(|value| {
                let centered = value - interval.mean;
                centered * centered
            })
            .sum::<f64>()
            / n;
        Self {
            name,
            mean: interval.mean,
            sd: variance.sqrt(),
            lower: interval.lower,
            median: interval.median,
            upper: interval.upper,
            split_rhat: split_rhat(chains).ok(),
            ess: chains
                .iter()
                .map(|chain| effective_sample_size(chain))
                .sum(),
        }
    }
}

/// Posterior inclusion of one group's hormesis term.
#[derive(Debug, Clone, PartialEq)]
pub struct InclusionSummary {
    pub species: usize,
    pub level: usize,
    /// Fraction of retained draws with `w = 1`.
    pub probability: f64,
    /// Summary of `f` over draws with `w = 1`; `None` if it was never active.
    pub magnitude: Option<ParameterSummary>,
}

/// Pooled posterior summary.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorSummary {
    pub draws: usize,
    pub credible_mass: f64,
    pub parameters: Vec<ParameterSummary>,
    pub inclusion: Vec<InclusionSummary>,
}

impl PosteriorSummary {
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&ParameterSummary> {
        self.parameters.iter().find(|parameter| parameter.name == name)
    }
}

/// Names of the scalars returned by [`PosteriorDraw::scalars`].
#[must_use]
pub fn parameter_names(model: &HormesisModel) -> Vec<String> {
    let dims = model.dimensions();
    let mut names = Vec::new();
    for group in 0..dims.groups() {
        let suffix = model.group_suffix(group);
        for prefix in ["c", "d", "e", "b", "w", "wf"] {
            names.push(format!("{prefix}{suffix}"));
        }
    }
    names.push("sigma_y".to_owned());
    if model.random_effects() == RandomEffectsStructure::CorrelatedTrials {
        for channel in EffectChannel::ALL {
            names.push(format!("sigma[{}]", channel.label()));
        }
        for (first, second) in correlation_pairs(EFFECT_CHANNELS) {
            names.push(format!(
                "corr[{},{}]",
                EffectChannel::ALL[first].label(),
                EffectChannel::ALL[second].label()
            ));
        }
        for trial in 0..dims.trials {
            for channel in EffectChannel::ALL {
                names.push(format!("delta[{},{}]", trial + 1, channel.label()));
            }
        }
    }
    let pairs = difference_pairs(dims.groups());
    for (first, second) in &pairs {
        names.push(model.parameter_label(NodeId::EffectiveDoseDifference(*first, *second)));
    }
    for (first, second) in &pairs {
        names.push(model.parameter_label(NodeId::CeilingDifference(*first, *second)));
    }
    names
}

/// Fraction of draws with an active hormesis term, per group.
#[must_use]
pub fn inclusion_probabilities(samples: &PosteriorSamples) -> Vec<f64> {
    let groups = samples.draws.first().map_or(0, |draw| draw.groups.len());
    let n = usize_to_f64(samples.len()).max(1.0);
    (0..groups)
        .map(|group| {
            let active = samples
                .draws
                .iter()
                .filter(|draw| draw.groups[group].hormesis.is_active())
                .count();
            usize_to_f64(active) / n
        })
        .collect()
}

/// Summarize chains pooled together, with per-parameter split-R-hat and ESS.
///
/// Chains without draws are ignored.
///
/// # Errors
///
/// Returns `HormesisError` if `credible_mass` is outside `(0, 1)`, no chain
/// holds a draw, or a draw does not match the model layout.
pub fn summarize_posterior(
    model: &HormesisModel,
    chains: &[PosteriorSamples],
    credible_mass: f64,
) -> Result<PosteriorSummary, HormesisError> {
    if !(credible_mass > 0.0 && credible_mass < 1.0) {
        return Err(ConfigurationError::InvalidCredibleMass(credible_mass).into());
    }
    let chains = chains
        .iter()
        .filter(|chain| !chain.is_empty())
        .collect::<Vec<_>>();
    if chains.is_empty() {
        return Err(HormesisError::EmptyPosterior);
    }
    if chains
        .iter()
        .flat_map(|chain| chain.draws.iter())
        .any(|draw| !draw.matches(model))
    {
        return Err(HormesisError::InconsistentPosteriorDimensions);
    }

    let names = parameter_names(model);
    let mut columns = vec![vec![Vec::new(); chains.len()]; names.len()];
    for (chain_index, chain) in chains.iter().enumerate() {
        for draw in &chain.draws {
            for (column, value) in columns.iter_mut().zip(draw.scalars()) {
                column[chain_index].push(value);
            }
        }
    }
    let parameters = names
        .into_iter()
        .zip(columns.iter())
        .map(|(name, column)| ParameterSummary::from_chains(name, column, credible_mass))
        .collect();

    let dims = model.dimensions();
    let inclusion = (0..dims.groups())
        .map(|group| {
            let (species, level) = dims.group_label(group);
            let active = chains
                .iter()
                .map(|chain| {
                    chain
                        .draws
                        .iter()
                        .filter_map(|draw| match draw.groups[group].hormesis {
                            HormesisTerm::Active(value) => Some(value),
                            HormesisTerm::Inactive => None,
                        })
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>();
            let active_count = active.iter().map(Vec::len).sum::<usize>();
            let total = chains.iter().map(|chain| chain.len()).sum::<usize>();
            InclusionSummary {
                species,
                level,
                probability: usize_to_f64(active_count) / usize_to_f64(total),
                magnitude: (active_count > 0).then(|| {
                    ParameterSummary::from_chains(
                        format!("f{}", model.group_suffix(group)),
                        &active,
                        credible_mass,
                    )
                }),
            }
        })
        .collect();

    Ok(PosteriorSummary {
        draws: chains.iter().map(|chain| chain.len()).sum(),
        credible_mass,
        parameters,
        inclusion,
    })
}
