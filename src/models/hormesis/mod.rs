//! Hierarchical Bayesian hormesis dose-response model.
//!
//! A four-parameter log-logistic curve per (species, level) group, extended
//! with a low-dose hormesis bump whose presence is selected by reversible-jump
//! MCMC. Trial-level deviations of the ceiling, bump magnitude, effective dose
//! and slope are modelled as correlated, non-centered random effects.
//!
//! The sampler walks a precomputed dependency graph: conjugate blocks are drawn
//! exactly, the rest use adaptive random-walk kernels, and derived quantities
//! are refreshed lazily before each retained draw.

pub mod chains;
pub mod curve;
pub mod diagnostics;
pub mod effects;
pub mod graph;
mod input;
pub mod likelihood;
pub mod model;
pub mod posterior;
pub mod predictive;
pub mod priors;
mod sampler;
pub mod types;

pub use chains::{fit_chain, fit_hormesis_model, run_chains};
pub use curve::{CurveParameters, CurveSign, HormesisTerm, evaluate_curve, log_logistic_mean};
pub use diagnostics::{
    ConvergenceThresholds, ConvergenceWarning, autocorrelation, convergence_warnings,
    effective_sample_size, split_rhat,
};
pub use effects::{CholeskyFactor, EffectChannel, RandomEffectState, TrialEffect};
pub use graph::{ModelGraph, NodeId, UpdateKernel};
pub use model::{HormesisModel, ModelConfig};
pub use posterior::{
    InclusionSummary, IntervalSummary, ParameterSummary, PosteriorDraw, PosteriorSamples,
    PosteriorSummary, RandomEffectDraw, inclusion_probabilities, parameter_names,
    summarize_interval, summarize_posterior,
};
pub use predictive::{
    DoseGrid, PredictiveCheck, PredictiveOptions, PredictivePoint, PredictiveTarget,
    posterior_predictive_check, posterior_predictive_curves,
};
pub use priors::{PriorConfig, ScalarPrior};
pub use types::{
    AcceptanceRates, ChainReport, ChainStage, ChainStatus, ConfigurationError, GroupInitialValues,
    HormesisError, InitialValues, ModelDimensions, MultiChainOptions, MultiChainReport,
    ProposalTuning, RandomEffectsStructure, SamplerConfig,
};
