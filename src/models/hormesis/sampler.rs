//! Single-chain RJMCMC sampler driven by the model graph's kernel registry.

use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use crate::inference::{McmcConfig, ProposalStats};
use crate::utils::{sample_gamma, sample_standard_normal, sample_truncated_normal, usize_to_f64};

use super::curve::{CurveParameters, CurveSign, HormesisTerm, evaluate_curve};
use super::effects::{
    CholeskyFactor, EFFECT_CHANNELS, RandomEffectState, TrialEffect, correlation_entries,
    correlation_pairs, trial_effect,
};
use super::graph::{
    NodeId, NodeKind, ScheduledUpdate, UpdateKernel, difference_pairs, difference_position,
};
use super::likelihood::{LikelihoodCache, cell_sum_squares, gaussian_log_likelihood};
use super::model::HormesisModel;
use super::posterior::{PosteriorDraw, PosteriorSamples, RandomEffectDraw};
use super::priors::{
    ScalarPrior, log_exponential_density, log_inverse_gamma_density, log_normal_density,
    log_uniform_density,
};
use super::types::{
    AcceptanceRates, ChainStage, ChainStatus, ConfigurationError, HormesisError, InitialValues,
    ProposalTuning, RandomEffectsStructure, SamplerConfig,
};

/// Starting random-effect scale as a fraction of the prior mean `1 / rate`.
const INITIAL_EFFECT_SCALE: f64 = 0.1;
const MIN_RESIDUAL_VARIANCE: f64 = 1.0e-6;

/// Current values of every stochastic and deterministic node of one chain.
#[derive(Debug, Clone)]
struct ChainState {
    groups: Vec<CurveParameters>,
    residual_variance: f64,
    random_effects: Option<RandomEffectState>,
    /// Zero deviations when random effects are disabled.
    trial_effects: Vec<TrialEffect>,
    correlation: Vec<f64>,
    effective_dose_differences: Vec<f64>,
    ceiling_differences: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Accepted,
    Rejected,
    OutOfSupport,
    NonFinite,
    Skipped,
}

/// Kernel families reported in the acceptance summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KernelFamily {
    EffectiveDose,
    Slope,
    HormesisJump,
    EffectScales,
    Correlation,
    TrialLatents,
}

impl KernelFamily {
    const COUNT: usize = 6;

    const fn of(id: NodeId) -> Option<Self> {
        match id {
            NodeId::EffectiveDose(_) => Some(Self::EffectiveDose),
            NodeId::Slope(_) => Some(Self::Slope),
            NodeId::HormesisIndicator(_) => Some(Self::HormesisJump),
            NodeId::EffectScale(_) => Some(Self::EffectScales),
            NodeId::CorrelationFactor => Some(Self::Correlation),
            NodeId::TrialLatent(_) => Some(Self::TrialLatents),
            _ => None,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }

    const fn is_adaptive(self) -> bool {
        !matches!(self, Self::HormesisJump)
    }
}

/// Curve parameter a conjugate-normal update targets.
#[derive(Debug, Clone, Copy)]
enum LinearSlot {
    Floor,
    Ceiling,
    Magnitude,
}

impl LinearSlot {
    const fn with(self, parameters: CurveParameters, value: f64) -> CurveParameters {
        let mut updated = parameters;
        match self {
            Self::Floor => updated.floor = value,
            Self::Ceiling => updated.ceiling = value,
            Self::Magnitude => updated.hormesis = HormesisTerm::Active(value),
        }
        updated
    }
}

/// Outcome of one chain run.
#[derive(Debug, Clone)]
pub(crate) struct ChainRun {
    pub status: ChainStatus,
    pub samples: PosteriorSamples,
    pub iterations_completed: usize,
    pub acceptance_rates: AcceptanceRates,
    pub numeric_rejections: usize,
    pub support_rejections: usize,
}

struct ChainSampler<'a> {
    model: &'a HormesisModel,
    sign: CurveSign,
    tuning: ProposalTuning,
    rng: StdRng,
    state: ChainState,
    cache: LikelihoodCache,
    /// Deterministic nodes awaiting recomputation.
    stale: Vec<bool>,
    scales: Vec<f64>,
    windows: Vec<ProposalStats>,
    totals: [ProposalStats; KernelFamily::COUNT],
    /// Consecutive non-finite outcomes per node.
    failures: Vec<usize>,
    numeric_rejections: usize,
    support_rejections: usize,
}

/// Run one chain from `seed`, stopping early if `cancel` is raised.
///
/// Failures are reported through the returned status; draws retained before a
/// failure or cancellation are kept.
pub(crate) fn run_chain(
    model: &HormesisModel,
    config: &SamplerConfig,
    seed: u64,
    cancel: Option<&AtomicBool>,
) -> ChainRun {
    log::debug!("chain seed {seed}: initializing");
    match ChainSampler::initialize(model, config, seed) {
        Ok(sampler) => sampler.run(config.schedule, seed, cancel),
        Err(error) => {
            log::warn!("chain seed {seed}: initialization failed: {error}");
            ChainRun {
                status: ChainStatus::Failed {
                    stage: ChainStage::Initializing,
                    error,
                },
                samples: PosteriorSamples::default(),
                iterations_completed: 0,
                acceptance_rates: AcceptanceRates::default(),
                numeric_rejections: 0,
                support_rejections: 0,
            }
        }
    }
}

impl<'a> ChainSampler<'a> {
    fn initialize(
        model: &'a HormesisModel,
        config: &SamplerConfig,
        seed: u64,
    ) -> Result<Self, HormesisError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let tuning = config.proposal_tuning;
        let initial = config.initial_values.as_ref();
        let groups = initial_groups(model, initial, tuning.initial_jitter, &mut rng)?;

        let dims = model.dimensions();
        let random_effects = match model.random_effects() {
            RandomEffectsStructure::Disabled => None,
            RandomEffectsStructure::CorrelatedTrials => Some(RandomEffectState::centered(
                dims.trials,
                INITIAL_EFFECT_SCALE / model.priors().effect_scale_rate,
            )),
        };
        let trial_effects = random_effects.as_ref().map_or_else(
            || vec![TrialEffect::default(); dims.trials],
            RandomEffectState::build_trial_effects,
        );
        let correlation = vec![
            0.0;
            if random_effects.is_some() {
                correlation_pairs(EFFECT_CHANNELS).len()
            } else {
                0
            }
        ];
        let pairs = difference_pairs(dims.groups()).len();

        let graph = model.graph();
        let mut sampler = Self {
            model,
            sign: model.sign(),
            tuning,
            rng,
            state: ChainState {
                groups,
                residual_variance: 1.0,
                random_effects,
                trial_effects,
                correlation,
                effective_dose_differences: vec![0.0; pairs],
                ceiling_differences: vec![0.0; pairs],
            },
            cache: LikelihoodCache::new(model.data().cells.len()),
            stale: (0..graph.len())
                .map(|node| graph.node(node).kind == NodeKind::Deterministic)
                .collect(),
            scales: (0..graph.len())
                .map(|node| initial_scale(graph.node(node).id, tuning))
                .collect(),
            windows: vec![ProposalStats::default(); graph.len()],
            totals: [ProposalStats::default(); KernelFamily::COUNT],
            failures: vec![0; graph.len()],
            numeric_rejections: 0,
            support_rejections: 0,
        };

        if !sampler.refresh_all_cells() {
            return Err(HormesisError::DegenerateInitialState);
        }
        sampler.state.residual_variance = match initial.and_then(|values| values.residual_variance)
        {
            Some(value) if value.is_finite() && value > 0.0 => value,
            Some(value) => {
                return Err(HormesisError::DomainViolation {
                    parameter: model.parameter_label(NodeId::ResidualVariance),
                    value,
                });
            }
            None => (sampler.cache.total() / usize_to_f64(model.n_observations()))
                .max(MIN_RESIDUAL_VARIANCE),
        };
        sampler.refresh_stale();
        if !sampler.log_posterior().is_finite() {
            return Err(HormesisError::DegenerateInitialState);
        }
        Ok(sampler)
    }

    /// Drive an initialized sampler through `schedule`.
    fn run(mut self, schedule: McmcConfig, seed: u64, cancel: Option<&AtomicBool>) -> ChainRun {
        log::debug!("chain seed {seed}: sampling");
        let mut draws = Vec::with_capacity(schedule.retained_draws());
        let mut status = ChainStatus::Completed;
        let mut iterations_completed = 0;
        for iter in 0..schedule.iterations {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                status = ChainStatus::Cancelled {
                    iterations_completed: iter,
                };
                break;
            }
            if let Err(error) = self.sweep() {
                log::warn!("chain seed {seed}: failed at iteration {iter}: {error}");
                status = ChainStatus::Failed {
                    stage: ChainStage::Sampling,
                    error,
                };
                break;
            }

            #[cfg(debug_assertions)]
            if iter.is_multiple_of(25) && self.failures.iter().all(|count| *count == 0) {
                self.debug_check_cache();
            }

            if schedule.adapt_during_burn_in
                && iter < schedule.burn_in
                && (iter + 1).is_multiple_of(self.tuning.adaptation_interval)
            {
                self.adapt();
            }

            if schedule.retains(iter) {
                draws.push(self.record_draw());
            }
            iterations_completed = iter + 1;
        }

        ChainRun {
            status,
            samples: PosteriorSamples { draws },
            iterations_completed,
            acceptance_rates: self.acceptance_rates(),
            numeric_rejections: self.numeric_rejections,
            support_rejections: self.support_rejections,
        }
    }

    /// One full sweep over the scheduled stochastic nodes.
    fn sweep(&mut self) -> Result<(), HormesisError> {
        let model = self.model;
        for update in model.graph().schedule() {
            let outcome = match update.kernel {
                UpdateKernel::ConjugateNormal => self.conjugate_normal(update),
                UpdateKernel::LogRandomWalk => self.log_random_walk(update),
                UpdateKernel::ReversibleJump => self.reversible_jump(update),
                UpdateKernel::ConjugateInverseGamma => self.conjugate_inverse_gamma(),
                UpdateKernel::CholeskyRandomWalk => self.cholesky_random_walk(update),
                UpdateKernel::LatentBlockRandomWalk => self.latent_random_walk(update),
            };
            self.register(update, outcome)?;
        }
        Ok(())
    }

    fn register(
        &mut self,
        update: &ScheduledUpdate,
        outcome: StepOutcome,
    ) -> Result<(), HormesisError> {
        if outcome != StepOutcome::Skipped
            && let Some(family) = KernelFamily::of(update.id)
        {
            let accepted = outcome == StepOutcome::Accepted;
            self.windows[update.node].record(accepted);
            self.totals[family.index()].record(accepted);
        }

        match outcome {
            StepOutcome::NonFinite => {
                self.numeric_rejections += 1;
                self.failures[update.node] += 1;
                let consecutive = self.failures[update.node];
                if consecutive > self.tuning.max_consecutive_numeric_failures {
                    let parameter = self.model.parameter_label(update.id);
                    log::warn!("{parameter}: {consecutive} consecutive non-finite evaluations");
                    return Err(HormesisError::NumericInstability {
                        parameter,
                        consecutive,
                    });
                }
            }
            StepOutcome::OutOfSupport => {
                self.support_rejections += 1;
                self.failures[update.node] = 0;
            }
            StepOutcome::Accepted | StepOutcome::Rejected | StepOutcome::Skipped => {
                self.failures[update.node] = 0;
            }
        }
        Ok(())
    }

    /// Closed-form truncated-normal draw for a parameter entering the mean linearly.
    fn conjugate_normal(&mut self, update: &ScheduledUpdate) -> StepOutcome {
        let model = self.model;
        let priors = model.priors();
        let (group, slot, prior) = match update.id {
            NodeId::Floor(group) => (group, LinearSlot::Floor, priors.floor),
            NodeId::Ceiling(group) => (group, LinearSlot::Ceiling, priors.ceiling),
            NodeId::HormesisMagnitude(group) => {
                if !self.state.groups[group].hormesis.is_active() {
                    return StepOutcome::Skipped;
                }
                (group, LinearSlot::Magnitude, priors.hormesis_magnitude)
            }
            _ => return StepOutcome::Skipped,
        };

        let terms = prior.conjugate_terms();
        let mut precision = terms.precision;
        let mut linear = terms.linear;
        let inverse_variance = self.state.residual_variance.recip();
        let current = self.state.groups[group];
        let data = model.data();
        for cell in &data.group_cells[group] {
            let rows = &data.cells[*cell];
            let effect = &self.state.trial_effects[rows.trial];
            let at_zero = effect.apply(&slot.with(current, 0.0));
            let at_one = effect.apply(&slot.with(current, 1.0));
            for row in rows.rows.iter().copied() {
                let dose = data.dose[row];
                let intercept = evaluate_curve(&at_zero, dose, model.shape_exponent(), self.sign);
                let coefficient =
                    evaluate_curve(&at_one, dose, model.shape_exponent(), self.sign) - intercept;
                precision += coefficient * coefficient * inverse_variance;
                linear += coefficient * (data.response[row] - intercept) * inverse_variance;
            }
        }
        if !(precision.is_finite() && linear.is_finite()) {
            return StepOutcome::NonFinite;
        }
        if precision <= 0.0 {
            return StepOutcome::Skipped;
        }

        let value = sample_truncated_normal(
            &mut self.rng,
            linear / precision,
            precision.sqrt().recip(),
            terms.lower,
            terms.upper,
        );
        if !value.is_finite() {
            return StepOutcome::NonFinite;
        }
        self.state.groups[group] = slot.with(current, value);
        self.cache.mark_dirty(model.graph().affected_cells(update.node));
        self.propagate(update.node);
        StepOutcome::Accepted
    }

    /// Metropolis random walk on `ln(theta)` for positive non-conjugate parameters.
    fn log_random_walk(&mut self, update: &ScheduledUpdate) -> StepOutcome {
        let model = self.model;
        let cells = model.graph().affected_cells(update.node);
        if !self.refresh_cells(cells) {
            return StepOutcome::NonFinite;
        }
        let step = self.scales[update.node] * sample_standard_normal(&mut self.rng);

        match update.id {
            NodeId::EffectiveDose(group) => {
                let current = self.state.groups[group].effective_dose;
                let proposed = current * step.exp();
                if !(proposed > 0.0 && proposed <= model.effective_dose_upper()) {
                    return StepOutcome::OutOfSupport;
                }
                self.state.groups[group].effective_dose = proposed;
                let outcome = self.decide(cells, step);
                if outcome == StepOutcome::Accepted {
                    self.propagate(update.node);
                } else {
                    self.state.groups[group].effective_dose = current;
                }
                outcome
            }
            NodeId::Slope(group) => {
                let prior = model.priors().slope;
                let current = self.state.groups[group].slope;
                let proposed = current * step.exp();
                if !(proposed > 0.0 && prior.contains(proposed)) {
                    return StepOutcome::OutOfSupport;
                }
                self.state.groups[group].slope = proposed;
                let ratio = prior.log_density(proposed) - prior.log_density(current) + step;
                let outcome = self.decide(cells, ratio);
                if outcome != StepOutcome::Accepted {
                    self.state.groups[group].slope = current;
                }
                outcome
            }
            NodeId::EffectScale(channel) => {
                let Some(current) = self
                    .state
                    .random_effects
                    .as_ref()
                    .map(|block| block.scales[channel])
                else {
                    return StepOutcome::Skipped;
                };
                let proposed = current * step.exp();
                if !(proposed.is_finite() && proposed > 0.0) {
                    return StepOutcome::OutOfSupport;
                }
                let rate = model.priors().effect_scale_rate;
                let ratio = log_exponential_density(proposed, rate)
                    - log_exponential_density(current, rate)
                    + step;
                self.set_effect_scale(channel, proposed);
                self.propagate(update.node);
                let outcome = self.decide(cells, ratio);
                if outcome != StepOutcome::Accepted {
                    self.set_effect_scale(channel, current);
                    self.propagate(update.node);
                }
                outcome
            }
            _ => StepOutcome::Skipped,
        }
    }

    /// Toggle the hormesis indicator, drawing or discarding its magnitude.
    ///
    /// The magnitude is injected unchanged across the two sub-models, so the
    /// Jacobian of the move is one.
    fn reversible_jump(&mut self, update: &ScheduledUpdate) -> StepOutcome {
        let NodeId::HormesisIndicator(group) = update.id else {
            return StepOutcome::Skipped;
        };
        let model = self.model;
        let cells = model.graph().affected_cells(update.node);
        if !self.refresh_cells(cells) {
            return StepOutcome::NonFinite;
        }

        let priors = model.priors();
        let magnitude_prior = priors.hormesis_magnitude;
        let proposal = priors.magnitude_jump_proposal();
        let log_odds = priors.inclusion_probability.ln() - (-priors.inclusion_probability).ln_1p();
        let current = self.state.groups[group].hormesis;
        let (proposed, ratio) = match current {
            HormesisTerm::Inactive => {
                let magnitude = proposal.sample(&mut self.rng);
                if !magnitude_prior.contains(magnitude) {
                    return StepOutcome::OutOfSupport;
                }
                (
                    HormesisTerm::Active(magnitude),
                    log_odds + magnitude_prior.log_density(magnitude)
                        - proposal.log_density(magnitude),
                )
            }
            HormesisTerm::Active(magnitude) => (
                HormesisTerm::Inactive,
                -log_odds - magnitude_prior.log_density(magnitude)
                    + proposal.log_density(magnitude),
            ),
        };

        self.state.groups[group].hormesis = proposed;
        let outcome = self.decide(cells, ratio);
        if outcome != StepOutcome::Accepted {
            self.state.groups[group].hormesis = current;
        }
        outcome
    }

    /// Closed-form inverse-gamma draw of the residual variance.
    fn conjugate_inverse_gamma(&mut self) -> StepOutcome {
        if !self.refresh_all_cells() {
            return StepOutcome::NonFinite;
        }
        let priors = self.model.priors();
        let shape = 0.5f64.mul_add(
            usize_to_f64(self.model.n_observations()),
            priors.residual_variance_shape,
        );
        let scale = 0.5f64.mul_add(self.cache.total(), priors.residual_variance_scale);
        let precision = sample_gamma(&mut self.rng, shape, scale.recip());
        let variance = precision.recip();
        if !(variance.is_finite() && variance > 0.0) {
            return StepOutcome::NonFinite;
        }
        self.state.residual_variance = variance;
        StepOutcome::Accepted
    }

    /// Joint random walk on the unconstrained coordinates of the correlation factor.
    fn cholesky_random_walk(&mut self, update: &ScheduledUpdate) -> StepOutcome {
        let model = self.model;
        let cells = model.graph().affected_cells(update.node);
        if !self.refresh_cells(cells) {
            return StepOutcome::NonFinite;
        }
        let Some(block) = &self.state.random_effects else {
            return StepOutcome::Skipped;
        };
        let scale = self.scales[update.node];
        let current = block.factor.clone();
        let coordinates = current
            .unconstrained()
            .iter()
            .map(|value| scale.mul_add(sample_standard_normal(&mut self.rng), *value))
            .collect::<Vec<_>>();
        let Some(proposed) = CholeskyFactor::from_unconstrained(current.dim(), &coordinates)
        else {
            return StepOutcome::NonFinite;
        };

        let eta = model.priors().lkj_shape;
        let ratio = proposed.log_prior_density(eta) - current.log_prior_density(eta);
        self.set_factor(proposed);
        self.propagate(update.node);
        let outcome = self.decide(cells, ratio);
        if outcome != StepOutcome::Accepted {
            self.set_factor(current);
            self.propagate(update.node);
        }
        outcome
    }

    /// Block random walk on one trial's standard-normal latent vector.
    fn latent_random_walk(&mut self, update: &ScheduledUpdate) -> StepOutcome {
        let NodeId::TrialLatent(trial) = update.id else {
            return StepOutcome::Skipped;
        };
        let model = self.model;
        let cells = model.graph().affected_cells(update.node);
        if !self.refresh_cells(cells) {
            return StepOutcome::NonFinite;
        }
        let Some(current) = self
            .state
            .random_effects
            .as_ref()
            .map(|block| block.latents[trial])
        else {
            return StepOutcome::Skipped;
        };

        let scale = self.scales[update.node];
        let mut proposed = current;
        for value in &mut proposed {
            *value = scale.mul_add(sample_standard_normal(&mut self.rng), *value);
        }
        let squared_norm =
            |latent: &[f64; EFFECT_CHANNELS]| latent.iter().map(|z| z * z).sum::<f64>();
        let ratio = -0.5 * (squared_norm(&proposed) - squared_norm(&current));

        self.set_latent(trial, proposed);
        self.propagate(update.node);
        let outcome = self.decide(cells, ratio);
        if outcome != StepOutcome::Accepted {
            self.set_latent(trial, current);
            self.propagate(update.node);
        }
        outcome
    }

    /// Metropolis decision for a state already holding the candidate values.
    ///
    /// `cells` must be clean; on acceptance their cached sums are replaced.
    fn decide(&mut self, cells: &[usize], log_prior_ratio: f64) -> StepOutcome {
        let current = self.cache.sum(cells);
        let mut candidate = Vec::with_capacity(cells.len());
        for cell in cells.iter().copied() {
            match self.cell_sum_squares(cell) {
                Some(sum_squares) => candidate.push(sum_squares),
                None => return StepOutcome::NonFinite,
            }
        }
        let delta = candidate.iter().sum::<f64>() - current;
        let log_acceptance =
            (-0.5 * delta).mul_add(self.state.residual_variance.recip(), log_prior_ratio);
        if log_acceptance.is_nan() {
            return StepOutcome::NonFinite;
        }
        if should_accept(log_acceptance, &mut self.rng) {
            for (cell, sum_squares) in cells.iter().zip(candidate) {
                self.cache.set(*cell, sum_squares);
            }
            StepOutcome::Accepted
        } else {
            StepOutcome::Rejected
        }
    }

    fn cell_sum_squares(&self, cell: usize) -> Option<f64> {
        let data = self.model.data();
        let rows = &data.cells[cell];
        cell_sum_squares(
            &rows.rows,
            &data.dose,
            &data.response,
            &self.state.groups[rows.group],
            &self.state.trial_effects[rows.trial],
            self.model.shape_exponent(),
            self.sign,
        )
    }

    /// Recompute dirty cells among `cells`; `false` if any is non-finite.
    fn refresh_cells(&mut self, cells: &[usize]) -> bool {
        for cell in cells.iter().copied() {
            if self.cache.is_dirty(cell) {
                match self.cell_sum_squares(cell) {
                    Some(sum_squares) => self.cache.set(cell, sum_squares),
                    None => return false,
                }
            }
        }
        true
    }

    fn refresh_all_cells(&mut self) -> bool {
        if !self.cache.any_dirty() {
            return true;
        }
        for cell in 0..self.model.data().cells.len() {
            if self.cache.is_dirty(cell) {
                match self.cell_sum_squares(cell) {
                    Some(sum_squares) => self.cache.set(cell, sum_squares),
                    None => return false,
                }
            }
        }
        true
    }

    /// Recompute trial effects downstream of `node` and flag the other
    /// deterministic descendants as stale.
    fn propagate(&mut self, node: usize) {
        let model = self.model;
        let graph = model.graph();
        for descendant in graph.deterministic_descendants(node).iter().copied() {
            match graph.node(descendant).id {
                NodeId::TrialEffect(trial) => self.recompute_trial_effect(trial),
                _ => self.stale[descendant] = true,
            }
        }
    }

    fn recompute_trial_effect(&mut self, trial: usize) {
        let state = &mut self.state;
        if let Some(block) = &state.random_effects {
            state.trial_effects[trial] =
                trial_effect(&block.scales, &block.factor, &block.latents[trial]);
        }
    }

    /// Bring every stale deterministic node up to date in topological order.
    fn refresh_stale(&mut self) {
        let model = self.model;
        let graph = model.graph();
        let groups = model.dimensions().groups();
        for node in graph.topological_order().iter().copied() {
            if !self.stale[node] {
                continue;
            }
            self.stale[node] = false;
            match graph.node(node).id {
                NodeId::TrialEffect(trial) => self.recompute_trial_effect(trial),
                NodeId::Correlation => {
                    if let Some(block) = &self.state.random_effects {
                        self.state.correlation = correlation_entries(&block.factor.correlation());
                    }
                }
                NodeId::EffectiveDoseDifference(first, second) => {
                    self.state.effective_dose_differences
                        [difference_position(groups, first, second)] = self.state.groups[first]
                        .effective_dose
                        - self.state.groups[second].effective_dose;
                }
                NodeId::CeilingDifference(first, second) => {
                    self.state.ceiling_differences[difference_position(groups, first, second)] =
                        self.state.groups[first].ceiling - self.state.groups[second].ceiling;
                }
                _ => {}
            }
        }
    }

    fn set_effect_scale(&mut self, channel: usize, value: f64) {
        if let Some(block) = self.state.random_effects.as_mut() {
            block.scales[channel] = value;
        }
    }

    fn set_factor(&mut self, factor: CholeskyFactor) {
        if let Some(block) = self.state.random_effects.as_mut() {
            block.factor = factor;
        }
    }

    fn set_latent(&mut self, trial: usize, latent: [f64; EFFECT_CHANNELS]) {
        if let Some(block) = self.state.random_effects.as_mut() {
            block.latents[trial] = latent;
        }
    }

    /// Unnormalized log posterior of the current state.
    fn log_posterior(&self) -> f64 {
        let priors = self.model.priors();
        let variance = self.state.residual_variance;
        let log_likelihood =
            gaussian_log_likelihood(self.model.n_observations(), self.cache.total(), variance);
        let mut total = log_likelihood
            + log_inverse_gamma_density(
                variance,
                priors.residual_variance_shape,
                priors.residual_variance_scale,
            );

        let upper = self.model.effective_dose_upper();
        let inclusion = priors.inclusion_probability;
        for group in &self.state.groups {
            total += priors.floor.log_density(group.floor)
                + priors.ceiling.log_density(group.ceiling)
                + log_uniform_density(group.effective_dose, 0.0, upper)
                + priors.slope.log_density(group.slope);
            total += match group.hormesis {
                HormesisTerm::Inactive => (-inclusion).ln_1p(),
                HormesisTerm::Active(magnitude) => {
                    inclusion.ln() + priors.hormesis_magnitude.log_density(magnitude)
                }
            };
        }

        if let Some(block) = &self.state.random_effects {
            for scale in block.scales {
                total += log_exponential_density(scale, priors.effect_scale_rate);
            }
            total += block.factor.log_prior_density(priors.lkj_shape);
            for latent in &block.latents {
                for value in latent {
                    total += log_normal_density(*value, 0.0, 1.0);
                }
            }
        }
        total
    }

    fn adapt(&mut self) {
        let model = self.model;
        for update in model.graph().schedule() {
            let window = std::mem::take(&mut self.windows[update.node]);
            if window.proposed > 0
                && KernelFamily::of(update.id).is_some_and(KernelFamily::is_adaptive)
            {
                self.scales[update.node] = adapt_scalar_scale(
                    self.scales[update.node],
                    window.acceptance_rate(),
                    self.tuning,
                );
            }
        }
    }

    fn record_draw(&mut self) -> PosteriorDraw {
        self.refresh_stale();
        let state = &self.state;
        PosteriorDraw {
            groups: state.groups.clone(),
            residual_variance: state.residual_variance,
            random_effects: state.random_effects.as_ref().map(|block| RandomEffectDraw {
                scales: block.scales,
                correlation: state.correlation.clone(),
                trial_effects: state.trial_effects.clone(),
            }),
            effective_dose_differences: state.effective_dose_differences.clone(),
            ceiling_differences: state.ceiling_differences.clone(),
        }
    }

    fn acceptance_rates(&self) -> AcceptanceRates {
        let rate = |family: KernelFamily| self.totals[family.index()].acceptance_rate();
        AcceptanceRates {
            effective_dose: rate(KernelFamily::EffectiveDose),
            slope: rate(KernelFamily::Slope),
            hormesis_jump: rate(KernelFamily::HormesisJump),
            effect_scales: rate(KernelFamily::EffectScales),
            correlation: rate(KernelFamily::Correlation),
            trial_latents: rate(KernelFamily::TrialLatents),
        }
    }

    #[cfg(debug_assertions)]
    fn debug_check_cache(&self) {
        for cell in 0..self.model.data().cells.len() {
            if !self.cache.is_dirty(cell) {
                let recomputed = self.cell_sum_squares(cell).unwrap_or(f64::NAN);
                let cached = self.cache.get(cell);
                debug_assert!((recomputed - cached).abs() <= 1.0e-8 * (1.0 + cached.abs()));
            }
        }
        debug_assert!(self.log_posterior().is_finite());
    }
}

fn initial_scale(id: NodeId, tuning: ProposalTuning) -> f64 {
    match id {
        NodeId::EffectiveDose(_) => tuning.effective_dose_draw_scale,
        NodeId::Slope(_) => tuning.slope_draw_scale,
        NodeId::EffectScale(_) => tuning.effect_scale_draw_scale,
        NodeId::CorrelationFactor => tuning.correlation_draw_scale,
        NodeId::TrialLatent(_) => tuning.latent_draw_scale,
        _ => 0.0,
    }
}

/// Starting curve parameters: supplied values where given, data-derived defaults otherwise.
fn initial_groups(
    model: &HormesisModel,
    initial: Option<&InitialValues>,
    jitter: f64,
    rng: &mut StdRng,
) -> Result<Vec<CurveParameters>, HormesisError> {
    let group_count = model.dimensions().groups();
    let supplied = initial.map_or(&[][..], |values| values.groups.as_slice());
    if !supplied.is_empty() && supplied.len() != group_count {
        return Err(ConfigurationError::InitialValueGroupMismatch {
            expected: group_count,
            found: supplied.len(),
        }
        .into());
    }

    let priors = model.priors();
    let upper = model.effective_dose_upper();
    (0..group_count)
        .map(|group| {
            let given = supplied.get(group).copied().unwrap_or_default();
            let (low_dose_mean, high_dose_mean, mid_dose) = data_anchors(model, group);
            let effective_dose = given.effective_dose.unwrap_or_else(|| {
                (mid_dose * (jitter * sample_standard_normal(rng)).exp()).min(upper)
            });
            let slope = given.slope.unwrap_or_else(|| {
                clamp_to_support(priors.slope, (jitter * sample_standard_normal(rng)).exp())
                    .max(f64::MIN_POSITIVE)
            });
            let parameters = CurveParameters {
                floor: given
                    .floor
                    .unwrap_or_else(|| clamp_to_support(priors.floor, high_dose_mean)),
                ceiling: given
                    .ceiling
                    .unwrap_or_else(|| clamp_to_support(priors.ceiling, low_dose_mean)),
                effective_dose,
                slope,
                hormesis: given.hormesis.unwrap_or_default(),
            };
            check_support(model, group, &parameters)?;
            Ok(parameters)
        })
        .collect()
}

/// Mean response at the group's lowest and highest dose, and their geometric mid dose.
fn data_anchors(model: &HormesisModel, group: usize) -> (f64, f64, f64) {
    let data = model.data();
    let (min_dose, max_dose) = data
        .group_rows(group)
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(low, high), row| {
            (low.min(data.dose[row]), high.max(data.dose[row]))
        });
    let mean_at = |dose: f64| {
        let (sum, count) = data
            .group_rows(group)
            .filter(|row| (data.dose[*row] - dose).abs() <= f64::EPSILON * dose.abs())
            .fold((0.0, 0usize), |(sum, count), row| (sum + data.response[row], count + 1));
        sum / usize_to_f64(count.max(1))
    };
    (mean_at(min_dose), mean_at(max_dose), (min_dose * max_dose).sqrt())
}

fn clamp_to_support(prior: ScalarPrior, value: f64) -> f64 {
    let (lower, upper) = prior.support();
    value.clamp(lower, upper)
}

fn check_support(
    model: &HormesisModel,
    group: usize,
    parameters: &CurveParameters,
) -> Result<(), HormesisError> {
    let priors = model.priors();
    let upper = model.effective_dose_upper();
    let violation = |id: NodeId, value: f64| {
        Err(HormesisError::DomainViolation {
            parameter: model.parameter_label(id),
            value,
        })
    };
    if !priors.floor.contains(parameters.floor) {
        return violation(NodeId::Floor(group), parameters.floor);
    }
    if !priors.ceiling.contains(parameters.ceiling) {
        return violation(NodeId::Ceiling(group), parameters.ceiling);
    }
    if !(parameters.effective_dose > 0.0 && parameters.effective_dose <= upper) {
        return violation(NodeId::EffectiveDose(group), parameters.effective_dose);
    }
    if !(parameters.slope > 0.0 && priors.slope.contains(parameters.slope)) {
        return violation(NodeId::Slope(group), parameters.slope);
    }
    if let HormesisTerm::Active(magnitude) = parameters.hormesis
        && !priors.hormesis_magnitude.contains(magnitude)
    {
        return violation(NodeId::HormesisMagnitude(group), magnitude);
    }
    Ok(())
}

fn should_accept(log_acceptance: f64, rng: &mut StdRng) -> bool {
    log_acceptance >= 0.0 || rng.random::<f64>().ln() < log_acceptance
}

fn adapt_scalar_scale(scale: f64, acceptance: f64, tuning: ProposalTuning) -> f64 {
    (scale * adaptation_factor(acceptance, tuning)).max(tuning.min_draw_scale)
}

fn adaptation_factor(acceptance: f64, tuning: ProposalTuning) -> f64 {
    if acceptance < tuning.acceptance_target_low {
        tuning.scale_decrease_factor
    } else if acceptance > tuning.acceptance_target_high {
        tuning.scale_increase_factor
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{DoseResponseInput, ResponseType};
    use crate::models::hormesis::curve::log_logistic_mean;
    use crate::models::hormesis::effects::{EffectChannel, off_diagonal_count};
    use crate::models::hormesis::model::ModelConfig;
    use crate::models::hormesis::types::{GroupInitialValues, ModelDimensions};

    fn model(random_effects: RandomEffectsStructure) -> HormesisModel {
        let doses = [0.1, 0.3, 1.0, 3.0, 10.0];
        let mut dose = Vec::new();
        let mut response = Vec::new();
        let mut trial_ids = Vec::new();
        for (index, x) in doses.iter().cycle().take(20).enumerate() {
            let noise = if index % 2 == 0 { 0.01 } else { -0.01 };
            dose.push(*x);
            response.push(log_logistic_mean(0.0, 1.0, 1.0, 2.0, *x) + noise);
            trial_ids.push(index / 10 + 1);
        }
        let input = DoseResponseInput::new(
            dose,
            response,
            vec![1; 20],
            trial_ids,
            ResponseType::Absorbance,
        );
        let mut config = ModelConfig::new(ModelDimensions {
            species: 1,
            levels: 1,
            trials: 2,
        });
        config.random_effects = random_effects;
        HormesisModel::build(&input, config).expect("valid model")
    }

    fn sampler_config(iterations: usize, burn_in: usize, thin: usize) -> SamplerConfig {
        SamplerConfig {
            schedule: McmcConfig {
                iterations,
                burn_in,
                thin,
                seed: 3,
                adapt_during_burn_in: true,
            },
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn identical_seeds_give_identical_draws() {
        let model = model(RandomEffectsStructure::CorrelatedTrials);
        let config = sampler_config(120, 20, 2);
        let first = run_chain(&model, &config, 11, None);
        let second = run_chain(&model, &config, 11, None);
        assert!(first.status.is_completed());
        assert_eq!(first.samples.draws, second.samples.draws);
        let other = run_chain(&model, &config, 12, None);
        assert_ne!(first.samples.draws, other.samples.draws);
    }

    #[test]
    fn retained_draws_follow_thinning() {
        let model = model(RandomEffectsStructure::Disabled);
        let config = sampler_config(103, 20, 4);
        let run = run_chain(&model, &config, 5, None);
        assert_eq!(run.samples.len(), (103 - 20) / 4);
        assert_eq!(run.iterations_completed, 103);
    }

    #[test]
    fn inactive_draws_carry_no_magnitude() {
        let model = model(RandomEffectsStructure::Disabled);
        let run = run_chain(&model, &sampler_config(200, 50, 1), 8, None);
        for draw in &run.samples.draws {
            let group = draw.groups[0];
            if !group.hormesis.is_active() {
                assert!(group.hormesis.magnitude().is_none());
            }
            assert!(group.effective_dose > 0.0 && group.effective_dose <= 10.0);
        }
        let rates = run.acceptance_rates;
        assert!((0.0..=1.0).contains(&rates.hormesis_jump));
        assert!(rates.effective_dose > 0.0);
    }

    #[test]
    fn raised_cancel_flag_stops_before_first_iteration() {
        let model = model(RandomEffectsStructure::Disabled);
        let cancel = AtomicBool::new(true);
        let run = run_chain(&model, &sampler_config(50, 10, 1), 1, Some(&cancel));
        assert_eq!(
            run.status,
            ChainStatus::Cancelled {
                iterations_completed: 0
            }
        );
        assert!(run.samples.is_empty());
    }

    #[test]
    fn out_of_support_initial_values_fail_initialization() {
        let model = model(RandomEffectsStructure::Disabled);
        let mut config = sampler_config(50, 10, 1);
        config.initial_values = Some(InitialValues {
            groups: vec![GroupInitialValues {
                effective_dose: Some(50.0),
                ..GroupInitialValues::default()
            }],
            residual_variance: None,
        });
        let run = run_chain(&model, &config, 1, None);
        match run.status {
            ChainStatus::Failed {
                stage: ChainStage::Initializing,
                error: HormesisError::DomainViolation { parameter, value },
            } => {
                assert_eq!(parameter, "e[1,1]");
                assert!((value - 50.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn overflowing_start_is_a_degenerate_initial_state() {
        let model = model(RandomEffectsStructure::Disabled);
        let mut config = sampler_config(50, 10, 1);
        config.initial_values = Some(InitialValues {
            groups: vec![GroupInitialValues {
                ceiling: Some(1.0e200),
                ..GroupInitialValues::default()
            }],
            residual_variance: None,
        });
        let run = run_chain(&model, &config, 1, None);
        assert!(matches!(
            run.status,
            ChainStatus::Failed {
                stage: ChainStage::Initializing,
                error: HormesisError::DegenerateInitialState,
            }
        ));
        assert_eq!(run.iterations_completed, 0);
    }

    #[test]
    fn persistent_non_finite_likelihood_fails_while_sampling() {
        let model = model(RandomEffectsStructure::CorrelatedTrials);
        let mut config = sampler_config(50, 10, 1);
        config.proposal_tuning.max_consecutive_numeric_failures = 1;
        let mut sampler = ChainSampler::initialize(&model, &config, 4).expect("finite start");

        // A runaway ceiling deviation overflows every residual of the first trial.
        sampler.set_effect_scale(EffectChannel::Ceiling.index(), 1.0e300);
        sampler.set_latent(0, [1.0, 0.0, 0.0, 0.0]);
        sampler.state.trial_effects = sampler
            .state
            .random_effects
            .as_ref()
            .map(RandomEffectState::build_trial_effects)
            .expect("random effects enabled");
        let cells = (0..model.data().cells.len()).collect::<Vec<_>>();
        sampler.cache.mark_dirty(&cells);

        let run = sampler.run(config.schedule, 4, None);
        assert!(matches!(
            run.status,
            ChainStatus::Failed {
                stage: ChainStage::Sampling,
                error: HormesisError::NumericInstability { consecutive: 2, .. },
            }
        ));
        assert_eq!(run.iterations_completed, 1);
        assert!(run.numeric_rejections >= 2);
        assert!(run.samples.is_empty());
    }

    #[test]
    fn initial_value_group_count_is_checked() {
        let model = model(RandomEffectsStructure::Disabled);
        let mut config = sampler_config(50, 10, 1);
        config.initial_values = Some(InitialValues {
            groups: vec![GroupInitialValues::default(); 2],
            residual_variance: None,
        });
        let run = run_chain(&model, &config, 1, None);
        assert!(matches!(
            run.status,
            ChainStatus::Failed {
                error: HormesisError::Configuration(
                    ConfigurationError::InitialValueGroupMismatch {
                        expected: 1,
                        found: 2
                    }
                ),
                ..
            }
        ));
    }

    #[test]
    fn cache_matches_recomputation_after_sweeps() {
        let model = model(RandomEffectsStructure::CorrelatedTrials);
        let config = sampler_config(10, 0, 1);
        let mut sampler = ChainSampler::initialize(&model, &config, 21).expect("valid start");
        for _ in 0..30 {
            sampler.sweep().expect("finite sweep");
        }
        assert!(sampler.refresh_all_cells());
        for cell in 0..model.data().cells.len() {
            let recomputed = sampler.cell_sum_squares(cell).expect("finite cell");
            assert!((recomputed - sampler.cache.get(cell)).abs() < 1.0e-9);
        }
        let expected_effects = sampler
            .state
            .random_effects
            .as_ref()
            .expect("random effects enabled")
            .build_trial_effects();
        assert_eq!(sampler.state.trial_effects, expected_effects);
        assert!(sampler.log_posterior().is_finite());
    }

    #[test]
    fn recorded_draw_refreshes_derived_nodes() {
        let model = model(RandomEffectsStructure::CorrelatedTrials);
        let config = sampler_config(10, 0, 1);
        let mut sampler = ChainSampler::initialize(&model, &config, 4).expect("valid start");
        for _ in 0..5 {
            sampler.sweep().expect("finite sweep");
        }
        let draw = sampler.record_draw();
        let block = draw.random_effects.expect("random effects enabled");
        let factor = &sampler
            .state
            .random_effects
            .as_ref()
            .expect("random effects enabled")
            .factor;
        assert_eq!(block.correlation, correlation_entries(&factor.correlation()));
        assert_eq!(block.correlation.len(), off_diagonal_count(EFFECT_CHANNELS));
        assert!(sampler.stale.iter().all(|stale| !stale));
    }

    #[test]
    fn adaptation_moves_scales_toward_target_window() {
        let tuning = ProposalTuning::default();
        assert!((adapt_scalar_scale(1.0, 0.05, tuning) - 0.8).abs() < 1.0e-12);
        assert!((adapt_scalar_scale(1.0, 0.9, tuning) - 1.25).abs() < 1.0e-12);
        assert!((adapt_scalar_scale(1.0, 0.3, tuning) - 1.0).abs() < 1.0e-12);
        assert!((adapt_scalar_scale(1.0e-6, 0.0, tuning) - tuning.min_draw_scale).abs() < 1.0e-15);
    }
}
