//! Core public types for the hormesis dose-response module.

use thiserror::Error;

use crate::inference::{InferenceError, McmcConfig};
use crate::input::InputError;

use super::curve::HormesisTerm;
use super::diagnostics::{ConvergenceThresholds, ConvergenceWarning};
use super::posterior::PosteriorSummary;

/// Malformed model or run specification; fatal at build time.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error(transparent)]
    InvalidInput(#[from] InputError),
    #[error(transparent)]
    InvalidSchedule(#[from] InferenceError),
    #[error("{dimension} count must be positive")]
    EmptyDimension { dimension: &'static str },
    #[error("{dimension} id {id} at row {row} exceeds configured count {count}")]
    DimensionMismatch {
        dimension: &'static str,
        id: usize,
        row: usize,
        count: usize,
    },
    #[error("species {species} at level {level} has no observations")]
    EmptyGroup { species: usize, level: usize },
    #[error("trial {trial} has no observations")]
    EmptyTrial { trial: usize },
    #[error("expected {expected} initial-value groups; found {found}")]
    InitialValueGroupMismatch { expected: usize, found: usize },
    #[error("{found} per-chain initial values supplied for {chains} chains")]
    InitialValueChainMismatch { chains: usize, found: usize },
    #[error("invalid prior for {parameter}")]
    InvalidPrior { parameter: &'static str },
    #[error("invalid proposal tuning configuration")]
    InvalidProposalTuning,
    #[error("hormesis shape exponent must be positive and finite; found {0}")]
    InvalidShapeExponent(f64),
    #[error("runs require at least {min} chains; found {found}")]
    InvalidChainCount { min: usize, found: usize },
    #[error("multi-chain seed stride must be positive")]
    InvalidSeedStride,
    #[error("dose grid must contain positive, finite doses")]
    InvalidDoseGrid,
    #[error("credible mass must lie strictly between 0 and 1; found {0}")]
    InvalidCredibleMass(f64),
    #[error("convergence thresholds must be positive")]
    InvalidConvergenceThresholds,
    #[error("model graph contains a dependency cycle")]
    CyclicGraph,
}

/// Errors returned by model building, sampling, and posterior processing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HormesisError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("value {value} for {parameter} lies outside its support")]
    DomainViolation { parameter: String, value: f64 },
    #[error("{parameter} produced {consecutive} consecutive non-finite evaluations")]
    NumericInstability {
        parameter: String,
        consecutive: usize,
    },
    #[error("initial state yields a non-finite log posterior")]
    DegenerateInitialState,
    #[error("posterior draws are required")]
    EmptyPosterior,
    #[error("each chain must retain at least {minimum} draws; minimum found {found}")]
    InsufficientChainDraws { minimum: usize, found: usize },
    #[error("posterior dimensions differ from the model layout")]
    InconsistentPosteriorDimensions,
    #[error("chain {index} panicked")]
    ChainPanicked { index: usize },
}

/// Random-effects structure shared across trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RandomEffectsStructure {
    /// No trial-level deviations.
    Disabled,
    /// Correlated four-channel trial deviations (d, f, e, b).
    #[default]
    CorrelatedTrials,
}

impl RandomEffectsStructure {
    /// Number of random-effect channels per trial implied by the structure.
    #[must_use]
    pub const fn random_effect_dimension(self) -> usize {
        match self {
            Self::Disabled => 0,
            Self::CorrelatedTrials => super::effects::EFFECT_CHANNELS,
        }
    }
}

/// Index-array dimensions a model is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDimensions {
    pub species: usize,
    pub levels: usize,
    pub trials: usize,
}

impl ModelDimensions {
    /// Number of (species, level) groups.
    #[must_use]
    pub const fn groups(self) -> usize {
        self.species * self.levels
    }

    /// Zero-based group index of 1-based `(species, level)`.
    #[must_use]
    pub const fn group_index(self, species: usize, level: usize) -> usize {
        (species - 1) * self.levels + (level - 1)
    }

    /// 1-based `(species, level)` of a zero-based group index.
    #[must_use]
    pub const fn group_label(self, group: usize) -> (usize, usize) {
        (group / self.levels + 1, group % self.levels + 1)
    }

    /// # Errors
    ///
    /// Returns `ConfigurationError` if any count is zero.
    pub const fn validate(self) -> Result<(), ConfigurationError> {
        if self.species == 0 {
            return Err(ConfigurationError::EmptyDimension {
                dimension: "species",
            });
        }
        if self.levels == 0 {
            return Err(ConfigurationError::EmptyDimension { dimension: "level" });
        }
        if self.trials == 0 {
            return Err(ConfigurationError::EmptyDimension { dimension: "trial" });
        }
        Ok(())
    }
}

/// Optional starting values for one (species, level) group.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GroupInitialValues {
    pub floor: Option<f64>,
    pub ceiling: Option<f64>,
    pub effective_dose: Option<f64>,
    pub slope: Option<f64>,
    pub hormesis: Option<HormesisTerm>,
}

/// Optional starting values; anything left `None` is derived from the data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitialValues {
    /// One entry per group in group-index order.
    pub groups: Vec<GroupInitialValues>,
    pub residual_variance: Option<f64>,
}

/// Proposal-scale and adaptation controls for the random-walk kernels.
#[derive(Debug, Clone, Copy)]
pub struct ProposalTuning {
    /// Minimum allowed proposal scale.
    pub min_draw_scale: f64,
    /// Initial log-scale random-walk step for effective doses.
    pub effective_dose_draw_scale: f64,
    /// Initial log-scale random-walk step for slopes.
    pub slope_draw_scale: f64,
    /// Initial log-scale random-walk step for random-effect scales.
    pub effect_scale_draw_scale: f64,
    /// Initial step for the unconstrained Cholesky coordinates.
    pub correlation_draw_scale: f64,
    /// Initial step for per-trial standard-normal latents.
    pub latent_draw_scale: f64,
    /// Adapt every `adaptation_interval` iterations during burn-in.
    pub adaptation_interval: usize,
    /// Lower acceptance-rate target for adaptation.
    pub acceptance_target_low: f64,
    /// Upper acceptance-rate target for adaptation.
    pub acceptance_target_high: f64,
    /// Multiplicative scale decrease when acceptance is below target.
    pub scale_decrease_factor: f64,
    /// Multiplicative scale increase when acceptance is above target.
    pub scale_increase_factor: f64,
    /// Log-normal jitter applied to data-derived starting doses and slopes.
    pub initial_jitter: f64,
    /// Consecutive non-finite evaluations tolerated before a chain fails.
    pub max_consecutive_numeric_failures: usize,
}

impl Default for ProposalTuning {
    fn default() -> Self {
        Self {
            min_draw_scale: 1.0e-4,
            effective_dose_draw_scale: 0.1,
            slope_draw_scale: 0.1,
            effect_scale_draw_scale: 0.2,
            correlation_draw_scale: 0.1,
            latent_draw_scale: 0.3,
            adaptation_interval: 50,
            acceptance_target_low: 0.2,
            acceptance_target_high: 0.35,
            scale_decrease_factor: 0.8,
            scale_increase_factor: 1.25,
            initial_jitter: 0.1,
            max_consecutive_numeric_failures: 1_000,
        }
    }
}

impl ProposalTuning {
    /// Whether proposal tuning settings are numerically valid.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.min_draw_scale > 0.0
            && self.effective_dose_draw_scale > 0.0
            && self.slope_draw_scale > 0.0
            && self.effect_scale_draw_scale > 0.0
            && self.correlation_draw_scale > 0.0
            && self.latent_draw_scale > 0.0
            && self.adaptation_interval > 0
            && self.acceptance_target_low >= 0.0
            && self.acceptance_target_high <= 1.0
            && self.acceptance_target_low < self.acceptance_target_high
            && self.scale_decrease_factor > 0.0
            && self.scale_increase_factor > 0.0
            && self.initial_jitter >= 0.0
            && self.max_consecutive_numeric_failures > 0
    }
}

/// Per-run sampler configuration.
#[derive(Debug, Clone, Default)]
pub struct SamplerConfig {
    pub schedule: McmcConfig,
    pub proposal_tuning: ProposalTuning,
    /// Starting values shared by every chain.
    pub initial_values: Option<InitialValues>,
    /// Per-chain starting values; chain `i` uses entry `i` in place of
    /// `initial_values` when present.
    pub chain_initial_values: Vec<InitialValues>,
}

impl SamplerConfig {
    /// # Errors
    ///
    /// Returns `ConfigurationError` if any configuration block is invalid.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.schedule.validate()?;
        if !self.proposal_tuning.is_valid() {
            return Err(ConfigurationError::InvalidProposalTuning);
        }
        Ok(())
    }

    /// Configuration seen by chain `index`.
    #[must_use]
    pub fn for_chain(&self, index: usize) -> Self {
        let mut config = self.clone();
        if let Some(values) = self.chain_initial_values.get(index) {
            config.initial_values = Some(values.clone());
        }
        config.chain_initial_values = Vec::new();
        config
    }
}

/// Configuration for running multiple independent MCMC chains.
#[derive(Debug, Clone, Copy)]
pub struct MultiChainOptions {
    /// Number of independent chains to run.
    pub chains: usize,
    /// Seed increment between adjacent chains.
    ///
    /// Chain `i` uses `base_seed + i * seed_stride` with wrapping arithmetic.
    pub seed_stride: u64,
    /// Credible mass of the pooled summary intervals.
    pub credible_mass: f64,
    pub convergence: ConvergenceThresholds,
}

impl Default for MultiChainOptions {
    fn default() -> Self {
        Self {
            chains: 4,
            seed_stride: 10_000,
            credible_mass: 0.95,
            convergence: ConvergenceThresholds::default(),
        }
    }
}

impl MultiChainOptions {
    /// # Errors
    ///
    /// Returns `ConfigurationError` if multi-chain options are invalid.
    pub fn validate(self) -> Result<(), ConfigurationError> {
        if self.chains == 0 {
            return Err(ConfigurationError::InvalidChainCount {
                min: 1,
                found: self.chains,
            });
        }
        if self.seed_stride == 0 {
            return Err(ConfigurationError::InvalidSeedStride);
        }
        if !(self.credible_mass > 0.0 && self.credible_mass < 1.0) {
            return Err(ConfigurationError::InvalidCredibleMass(self.credible_mass));
        }
        self.convergence.validate()
    }

    /// Seed used by chain `index`.
    #[must_use]
    pub fn chain_seed(self, base_seed: u64, index: usize) -> u64 {
        let index_u64 = u64::try_from(index).unwrap_or(u64::MAX);
        base_seed.wrapping_add(index_u64.saturating_mul(self.seed_stride))
    }
}

/// Lifecycle stage of one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStage {
    Initializing,
    Sampling,
}

/// Terminal or in-flight status of one chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainStatus {
    Initializing,
    Sampling,
    Completed,
    /// Stopped at an iteration boundary; retained draws are a consistent prefix.
    Cancelled {
        iterations_completed: usize,
    },
    Failed {
        stage: ChainStage,
        error: HormesisError,
    },
}

impl ChainStatus {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Kernel-family acceptance rates from one chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptanceRates {
    pub effective_dose: f64,
    pub slope: f64,
    pub hormesis_jump: f64,
    pub effect_scales: f64,
    pub correlation: f64,
    pub trial_latents: f64,
}

/// Sampler diagnostics for one chain.
#[derive(Debug, Clone)]
pub struct ChainReport {
    pub index: usize,
    pub seed: u64,
    pub status: ChainStatus,
    pub iterations_completed: usize,
    pub retained_draws: usize,
    pub acceptance_rates: AcceptanceRates,
    /// Proposals rejected because the curve or likelihood was non-finite.
    pub numeric_rejections: usize,
    /// Proposals rejected because they left a parameter's support.
    pub support_rejections: usize,
}

/// Output report for a multi-chain run.
#[derive(Debug, Clone, Default)]
pub struct MultiChainReport {
    /// Chain-specific reports in chain-index order.
    pub chain_reports: Vec<ChainReport>,
    /// Number of chains that completed every iteration.
    pub completed_chains: usize,
    /// Posterior summary pooled across completed chains.
    pub pooled_summary: Option<PosteriorSummary>,
    /// Diagnostic-only convergence warnings.
    pub warnings: Vec<ConvergenceWarning>,
}
