//! Multi-chain driver and public fitting entrypoints.

use std::sync::atomic::AtomicBool;

use crate::input::DoseResponseInput;

use super::diagnostics::convergence_warnings;
use super::model::{HormesisModel, ModelConfig};
use super::posterior::{PosteriorSamples, summarize_posterior};
use super::sampler::{ChainRun, run_chain};
use super::types::{
    AcceptanceRates, ChainReport, ChainStage, ChainStatus, ConfigurationError, HormesisError,
    MultiChainOptions, MultiChainReport, SamplerConfig,
};

/// Run a single chain seeded with `config.schedule.seed`.
///
/// Chain failures are reported through the returned status, not as `Err`.
///
/// # Errors
///
/// Returns `HormesisError` if the sampler configuration is invalid.
pub fn fit_chain(
    model: &HormesisModel,
    config: &SamplerConfig,
) -> Result<(ChainReport, PosteriorSamples), HormesisError> {
    config.validate()?;
    let seed = config.schedule.seed;
    let run = run_chain(model, &config.for_chain(0), seed, None);
    Ok(into_report(0, seed, run))
}

/// Run independent chains on scoped threads.
///
/// Chain `i` is seeded with `seed + i * seed_stride`. A failing or panicking
/// chain is reported as `Failed` and never affects its siblings. Raising
/// `cancel` stops every chain at its next iteration boundary. The pooled
/// summary covers completed chains only; posteriors are returned for every
/// chain in index order.
///
/// # Errors
///
/// Returns `HormesisError` if the sampler or multi-chain configuration is invalid.
pub fn run_chains(
    model: &HormesisModel,
    config: &SamplerConfig,
    multi_chain: MultiChainOptions,
    cancel: Option<&AtomicBool>,
) -> Result<(MultiChainReport, Vec<PosteriorSamples>), HormesisError> {
    config.validate()?;
    multi_chain.validate()?;
    if config.chain_initial_values.len() > multi_chain.chains {
        return Err(ConfigurationError::InitialValueChainMismatch {
            chains: multi_chain.chains,
            found: config.chain_initial_values.len(),
        }
        .into());
    }

    let base_seed = config.schedule.seed;
    let runs = std::thread::scope(|scope| {
        let handles = (0..multi_chain.chains)
            .map(|index| {
                let seed = multi_chain.chain_seed(base_seed, index);
                let chain_config = config.for_chain(index);
                let handle = scope.spawn(move || run_chain(model, &chain_config, seed, cancel));
                (index, seed, handle)
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|(index, seed, handle)| {
                let run = handle.join().unwrap_or_else(|_| {
                    log::warn!("chain {index} panicked");
                    ChainRun {
                        status: ChainStatus::Failed {
                            stage: ChainStage::Sampling,
                            error: HormesisError::ChainPanicked { index },
                        },
                        samples: PosteriorSamples::default(),
                        iterations_completed: 0,
                        acceptance_rates: AcceptanceRates::default(),
                        numeric_rejections: 0,
                        support_rejections: 0,
                    }
                });
                (index, seed, run)
            })
            .collect::<Vec<_>>()
    });

    let mut chain_reports = Vec::with_capacity(runs.len());
    let mut posteriors = Vec::with_capacity(runs.len());
    for (index, seed, run) in runs {
        let (report, samples) = into_report(index, seed, run);
        chain_reports.push(report);
        posteriors.push(samples);
    }

    let completed = chain_reports
        .iter()
        .zip(posteriors.iter())
        .filter(|(report, _)| report.status.is_completed())
        .map(|(_, samples)| samples.clone())
        .collect::<Vec<_>>();
    let pooled_summary = if completed.iter().any(|samples| !samples.is_empty()) {
        Some(summarize_posterior(
            model,
            &completed,
            multi_chain.credible_mass,
        )?)
    } else {
        None
    };
    let warnings = pooled_summary
        .as_ref()
        .map(|summary| convergence_warnings(summary, multi_chain.convergence))
        .unwrap_or_default();

    log::info!(
        "{} of {} chains completed; {} pooled draws; {} convergence warnings",
        completed.len(),
        multi_chain.chains,
        pooled_summary.as_ref().map_or(0, |summary| summary.draws),
        warnings.len()
    );

    Ok((
        MultiChainReport {
            chain_reports,
            completed_chains: completed.len(),
            pooled_summary,
            warnings,
        },
        posteriors,
    ))
}

/// Build the model, then run every chain.
///
/// # Errors
///
/// Returns `HormesisError` if the input or any configuration block is invalid.
pub fn fit_hormesis_model(
    input: &DoseResponseInput,
    model_config: ModelConfig,
    sampler_config: &SamplerConfig,
    multi_chain: MultiChainOptions,
) -> Result<(HormesisModel, MultiChainReport, Vec<PosteriorSamples>), HormesisError> {
    let model = HormesisModel::build(input, model_config)?;
    let (report, posteriors) = run_chains(&model, sampler_config, multi_chain, None)?;
    Ok((model, report, posteriors))
}

fn into_report(index: usize, seed: u64, run: ChainRun) -> (ChainReport, PosteriorSamples) {
    match &run.status {
        ChainStatus::Completed => log::debug!("chain {index}: completed"),
        ChainStatus::Cancelled {
            iterations_completed,
        } => log::debug!("chain {index}: cancelled after {iterations_completed} iterations"),
        ChainStatus::Failed { stage, error } => {
            log::warn!("chain {index}: failed while {stage:?}: {error}");
        }
        ChainStatus::Initializing | ChainStatus::Sampling => {}
    }
    (
        ChainReport {
            index,
            seed,
            status: run.status,
            iterations_completed: run.iterations_completed,
            retained_draws: run.samples.len(),
            acceptance_rates: run.acceptance_rates,
            numeric_rejections: run.numeric_rejections,
            support_rejections: run.support_rejections,
        },
        run.samples,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::McmcConfig;
    use crate::input::ResponseType;
    use crate::models::hormesis::curve::log_logistic_mean;
    use crate::models::hormesis::types::{
        ConfigurationError, GroupInitialValues, InitialValues, ModelDimensions,
        RandomEffectsStructure,
    };

    fn model() -> HormesisModel {
        let dose = [0.2, 0.5, 1.0, 2.0, 5.0]
            .iter()
            .cycle()
            .take(10)
            .copied()
            .collect::<Vec<_>>();
        let response = dose
            .iter()
            .enumerate()
            .map(|(index, x)| {
                let noise = if index % 2 == 0 { 0.02 } else { -0.02 };
                log_logistic_mean(0.0, 1.0, 1.0, 2.0, *x) + noise
            })
            .collect::<Vec<_>>();
        let mut config = ModelConfig::new(ModelDimensions {
            species: 1,
            levels: 1,
            trials: 1,
        });
        config.random_effects = RandomEffectsStructure::Disabled;
        HormesisModel::build(
            &DoseResponseInput::new(
                dose,
                response,
                vec![1; 10],
                vec![1; 10],
                ResponseType::Absorbance,
            ),
            config,
        )
        .expect("valid model")
    }

    fn config() -> SamplerConfig {
        SamplerConfig {
            schedule: McmcConfig {
                iterations: 80,
                burn_in: 20,
                thin: 2,
                seed: 9,
                adapt_during_burn_in: true,
            },
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn chains_use_strided_seeds_and_pool_draws() {
        let model = model();
        let multi = MultiChainOptions {
            chains: 3,
            seed_stride: 7,
            ..MultiChainOptions::default()
        };
        let (report, posteriors) = run_chains(&model, &config(), multi, None).expect("valid run");
        assert_eq!(report.completed_chains, 3);
        assert_eq!(
            report
                .chain_reports
                .iter()
                .map(|chain| chain.seed)
                .collect::<Vec<_>>(),
            vec![9, 16, 23]
        );
        assert!(posteriors.iter().all(|samples| samples.len() == 30));
        assert_eq!(report.pooled_summary.expect("pooled").draws, 90);

        let (single, samples) = fit_chain(&model, &config()).expect("valid run");
        assert_eq!(single.seed, 9);
        assert_eq!(samples.draws, posteriors[0].draws);
    }

    #[test]
    fn failed_initialization_leaves_no_pooled_summary() {
        let model = model();
        let mut config = config();
        config.initial_values = Some(InitialValues {
            groups: vec![GroupInitialValues {
                slope: Some(-1.0),
                ..GroupInitialValues::default()
            }],
            residual_variance: None,
        });
        let (report, _) = run_chains(&model, &config, MultiChainOptions::default(), None)
            .expect("configuration is valid");
        assert_eq!(report.completed_chains, 0);
        assert!(report.pooled_summary.is_none());
        assert!(report.chain_reports.iter().all(|chain| chain.status.is_failed()));
    }

    #[test]
    fn one_failing_chain_leaves_its_siblings_running() {
        let model = model();
        let mut staggered = config();
        staggered.chain_initial_values = vec![
            InitialValues::default(),
            InitialValues {
                groups: vec![GroupInitialValues {
                    slope: Some(-1.0),
                    ..GroupInitialValues::default()
                }],
                residual_variance: None,
            },
        ];
        let multi = MultiChainOptions {
            chains: 3,
            ..MultiChainOptions::default()
        };
        let (report, posteriors) = run_chains(&model, &staggered, multi, None).expect("valid run");

        assert_eq!(report.completed_chains, 2);
        assert!(matches!(
            report.chain_reports[1].status,
            ChainStatus::Failed {
                stage: ChainStage::Initializing,
                error: HormesisError::DomainViolation { .. },
            }
        ));
        assert!(report.chain_reports[0].status.is_completed());
        assert!(report.chain_reports[2].status.is_completed());
        assert!(posteriors[1].is_empty());
        assert_eq!(report.pooled_summary.expect("pooled").draws, 60);

        let alone = MultiChainOptions {
            chains: 1,
            ..MultiChainOptions::default()
        };
        let (_, first_alone) = run_chains(&model, &config(), alone, None).expect("valid run");
        assert_eq!(first_alone[0].draws, posteriors[0].draws);
    }

    #[test]
    fn surplus_per_chain_initial_values_are_rejected() {
        let model = model();
        let mut config = config();
        config.chain_initial_values = vec![InitialValues::default(); 2];
        let multi = MultiChainOptions {
            chains: 1,
            ..MultiChainOptions::default()
        };
        assert!(matches!(
            run_chains(&model, &config, multi, None),
            Err(HormesisError::Configuration(
                ConfigurationError::InitialValueChainMismatch { chains: 1, found: 2 }
            ))
        ));
    }

    #[test]
    fn invalid_multi_chain_options_are_rejected() {
        let model = model();
        let multi = MultiChainOptions {
            chains: 0,
            ..MultiChainOptions::default()
        };
        assert!(matches!(
            run_chains(&model, &config(), multi, None),
            Err(HormesisError::Configuration(
                ConfigurationError::InvalidChainCount { min: 1, found: 0 }
            ))
        ));
    }
}
