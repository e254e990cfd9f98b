#![forbid(unsafe_code)]

//! # `dose_response_models`
//!
//! Hierarchical Bayesian dose-response fitting for toxicity screens:
//! four-parameter log-logistic curves per (species, level) group, a
//! reversible-jump-selected hormesis bump, correlated trial random effects,
//! multi-chain MCMC with convergence diagnostics, and posterior predictive
//! summaries.
//!
//! The crate was developed for solvent and extract toxicity assays, but the
//! sampler makes no assumption about what a "species" or "level" is.

pub mod inference;
pub mod input;
pub mod models;
pub mod preprocess;
pub mod utils;

pub use inference::{InferenceError, McmcConfig, ProposalStats};
pub use input::{DoseResponseInput, InputError, Observation, ResponseType};
pub use preprocess::{
    CatchAllLevel, PreprocessReport, PreprocessRule, ResponseDiagnostics, apply_preprocess_rule,
    response_diagnostics,
};

pub use models::hormesis::{
    AcceptanceRates, ChainReport, ChainStage, ChainStatus, CholeskyFactor, ConfigurationError,
    ConvergenceThresholds, ConvergenceWarning, CurveParameters, CurveSign, DoseGrid,
    EffectChannel, GroupInitialValues, HormesisError, HormesisModel, HormesisTerm,
    InclusionSummary, InitialValues, IntervalSummary, ModelConfig, ModelDimensions,
    MultiChainOptions, MultiChainReport, ParameterSummary, PosteriorDraw, PosteriorSamples,
    PosteriorSummary, PredictiveCheck, PredictiveOptions, PredictivePoint, PredictiveTarget,
    PriorConfig, ProposalTuning, RandomEffectDraw, RandomEffectState, RandomEffectsStructure,
    SamplerConfig, ScalarPrior, TrialEffect, autocorrelation, convergence_warnings,
    effective_sample_size, evaluate_curve, fit_chain, fit_hormesis_model, inclusion_probabilities,
    log_logistic_mean, posterior_predictive_check, posterior_predictive_curves, run_chains,
    split_rhat, summarize_posterior,
};
