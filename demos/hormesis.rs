use dose_response_models::{
    DoseGrid, DoseResponseInput, McmcConfig, ModelConfig, ModelDimensions, MultiChainOptions,
    PosteriorSamples, PredictiveOptions, PreprocessRule, ResponseType, SamplerConfig,
    apply_preprocess_rule, fit_hormesis_model, log_logistic_mean, posterior_predictive_check,
    posterior_predictive_curves, response_diagnostics,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let raw = build_synthetic_input(2, 3);
    let diagnostics = response_diagnostics(&raw);
    println!(
        "Raw table: rows={}, non-finite={}, non-positive doses={}, dose range=[{:.3}, {:.3}]",
        diagnostics.n_rows,
        diagnostics.n_non_finite,
        diagnostics.n_non_positive_dose,
        diagnostics.min_dose,
        diagnostics.max_dose
    );

    let (input, preprocess) = apply_preprocess_rule(&raw, &PreprocessRule::default())?;
    println!(
        "Preprocess: kept {} of {} rows ({} non-positive dose, {} non-finite)",
        preprocess.rows_out,
        preprocess.rows_in,
        preprocess.dropped_non_positive_dose,
        preprocess.dropped_non_finite
    );

    let model_config = ModelConfig::new(ModelDimensions {
        species: 2,
        levels: 1,
        trials: 3,
    });
    let sampler_config = SamplerConfig {
        schedule: McmcConfig {
            iterations: 1_500,
            burn_in: 500,
            thin: 5,
            seed: 2_026,
            adapt_during_burn_in: true,
        },
        ..SamplerConfig::default()
    };
    let multi = MultiChainOptions {
        chains: 2,
        ..MultiChainOptions::default()
    };

    let (model, report, posteriors) =
        fit_hormesis_model(&input, model_config, &sampler_config, multi)?;

    println!(
        "Hormesis fit: observations={}, completed chains={}/{}",
        model.n_observations(),
        report.completed_chains,
        report.chain_reports.len()
    );
    for chain in &report.chain_reports {
        let rates = chain.acceptance_rates;
        println!(
            "Chain {} (seed {}): draws={}, acceptance e={:.2}, b={:.2}, jump={:.2}, \
             scales={:.2}, corr={:.2}, latents={:.2}",
            chain.index,
            chain.seed,
            chain.retained_draws,
            rates.effective_dose,
            rates.slope,
            rates.hormesis_jump,
            rates.effect_scales,
            rates.correlation,
            rates.trial_latents
        );
    }

    if let Some(summary) = &report.pooled_summary {
        println!("Pooled draws: {}", summary.draws);
        for name in ["c[1,1]", "d[1,1]", "e[1,1]", "b[1,1]", "e[2,1]", "sigma_y"] {
            if let Some(parameter) = summary.parameter(name) {
                println!(
                    "{name}: mean={:.3}, 95% CrI [{:.3}, {:.3}], R-hat={}, ESS={:.0}",
                    parameter.mean,
                    parameter.lower,
                    parameter.upper,
                    parameter
                        .split_rhat
                        .map_or_else(|| "n/a".to_owned(), |rhat| format!("{rhat:.3}")),
                    parameter.ess
                );
            }
        }
        for inclusion in &summary.inclusion {
            println!(
                "Hormesis [{},{}]: P(w=1)={:.2}{}",
                inclusion.species,
                inclusion.level,
                inclusion.probability,
                inclusion
                    .magnitude
                    .as_ref()
                    .map_or_else(String::new, |magnitude| format!(
                        ", f median={:.3}",
                        magnitude.median
                    ))
            );
        }
    }
    for warning in &report.warnings {
        println!("Warning: {warning}");
    }

    let pooled = PosteriorSamples::pooled(&posteriors);
    let grid = DoseGrid::Logarithmic {
        lower: 0.01,
        upper: 20.0,
        count: 6,
    };
    let points = posterior_predictive_curves(&model, &pooled, &grid, PredictiveOptions::default())?;
    for point in points {
        println!(
            "[{},{}] dose={:.3}: median={:.3}, 95% CrI [{:.3}, {:.3}]",
            point.species, point.level, point.dose, point.median, point.lower, point.upper
        );
    }
    for check in posterior_predictive_check(&model, &pooled, PredictiveOptions::default())? {
        println!(
            "PPC [{},{}]: observed mean={:.3}, fitted mean={:.3} (covered={}), RMSE={:.4}",
            check.species,
            check.level,
            check.observed_mean,
            check.fitted_mean.mean,
            check.covers_observed_mean(),
            check.residual_rmse.mean
        );
    }

    Ok(())
}

fn build_synthetic_input(n_species: usize, n_trials: usize) -> DoseResponseInput {
    let doses: [f64; 9] = [0.0, 0.01, 0.05, 0.2, 0.5, 1.0, 2.0, 5.0, 20.0];
    let mut dose = Vec::new();
    let mut response = Vec::new();
    let mut species_ids = Vec::new();
    let mut trial_ids = Vec::new();
    for species in 1..=n_species {
        for trial in 1..=n_trials {
            for (index, x) in doses.iter().enumerate() {
                let effective_dose = if species == 1 { 1.0 } else { 4.0 };
                let bump = if species == 1 && *x > 0.0 {
                    0.6 * (-1.0 / x.sqrt()).exp() / (1.0 + (x / effective_dose).powi(2))
                } else {
                    0.0
                };
                let step = u8::try_from((index + trial) % 5).unwrap_or(0);
                let wobble = 0.01 * (f64::from(step) - 2.0);
                dose.push(*x);
                let mean = log_logistic_mean(0.05, 1.0, effective_dose, 2.0, *x);
                response.push(mean + bump + wobble);
                species_ids.push(species);
                trial_ids.push(trial);
            }
        }
    }
    DoseResponseInput::new(dose, response, species_ids, trial_ids, ResponseType::Absorbance)
}
