use dose_response_models::utils::sample_standard_normal;
use dose_response_models::{
    CurveParameters, CurveSign, DoseGrid, DoseResponseInput, EffectChannel, HormesisTerm,
    McmcConfig, ModelConfig, ModelDimensions, MultiChainOptions, PosteriorSamples,
    PredictiveOptions, PredictiveTarget, RandomEffectState, ResponseType, SamplerConfig,
    evaluate_curve, fit_hormesis_model, inclusion_probabilities, posterior_predictive_curves,
};
use rand::SeedableRng;
use rand::rngs::StdRng;

const N_TRIALS: usize = 4;
const REPLICATES: usize = 3;
const NOISE_SD: f64 = 0.02;
const SHAPE_EXPONENT: f64 = 0.5;
const SIMULATION_SEED: u64 = 41;
const DOSES: [f64; 8] = [0.01, 0.05, 0.2, 0.5, 1.0, 2.0, 8.0, 40.0];

#[allow(clippy::too_many_lines)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let truths = [
        CurveParameters {
            floor: 0.05,
            ceiling: 1.0,
            effective_dose: 2.0,
            slope: 2.0,
            hormesis: HormesisTerm::Active(0.8),
        },
        CurveParameters {
            floor: 0.0,
            ceiling: 0.9,
            effective_dose: 5.0,
            slope: 1.5,
            hormesis: HormesisTerm::Inactive,
        },
    ];

    let mut rng = StdRng::seed_from_u64(SIMULATION_SEED);
    let effects = RandomEffectState::draw_from_prior(N_TRIALS, 20.0, 2.0, &mut rng);
    let input = simulate(&truths, &effects, &mut rng);

    let model_config = ModelConfig::new(ModelDimensions {
        species: truths.len(),
        levels: 1,
        trials: N_TRIALS,
    });
    let sampler_config = SamplerConfig {
        schedule: McmcConfig {
            iterations: 6_000,
            burn_in: 3_000,
            thin: 5,
            seed: 2_026,
            adapt_during_burn_in: true,
        },
        ..SamplerConfig::default()
    };
    let multi = MultiChainOptions {
        chains: 4,
        ..MultiChainOptions::default()
    };
    let (model, report, posteriors) =
        fit_hormesis_model(&input, model_config, &sampler_config, multi)?;

    println!("Hormesis recovery validation");
    println!(
        "Synthetic screen: species={}, trials={N_TRIALS}, rows={}",
        truths.len(),
        input.len()
    );
    println!(
        "True trial-effect scales: {}",
        EffectChannel::ALL
            .iter()
            .map(|channel| format!("{}={:.3}", channel.label(), effects.scales[channel.index()]))
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "Completed chains: {}/{}; convergence warnings: {}",
        report.completed_chains,
        report.chain_reports.len(),
        report.warnings.len()
    );

    let pooled = PosteriorSamples::pooled(&posteriors);
    let inclusion = inclusion_probabilities(&pooled);
    for (species, truth) in truths.iter().enumerate() {
        println!(
            "Species {}: true hormesis={}, P(w=1)={:.2}",
            species + 1,
            truth.hormesis.is_active(),
            inclusion.get(species).copied().unwrap_or(f64::NAN)
        );
    }

    if let Some(summary) = &report.pooled_summary {
        for (species, truth) in truths.iter().enumerate() {
            let name = format!("e[{},1]", species + 1);
            if let Some(parameter) = summary.parameter(&name) {
                println!(
                    "{name}: truth={:.3}, median={:.3}, 95% CrI [{:.3}, {:.3}], covered={}",
                    truth.effective_dose,
                    parameter.median,
                    parameter.lower,
                    parameter.upper,
                    (parameter.lower..=parameter.upper).contains(&truth.effective_dose)
                );
            }
        }
    }

    let grid = DoseGrid::Explicit(vec![0.1, 1.0, 10.0]);
    let mut worst_error = 0.0f64;
    let population = PredictiveOptions {
        target: PredictiveTarget::Population,
        ..PredictiveOptions::default()
    };
    for point in posterior_predictive_curves(&model, &pooled, &grid, population)? {
        let truth = evaluate_curve(
            &truths[point.species - 1],
            point.dose,
            SHAPE_EXPONENT,
            CurveSign::Stimulatory,
        );
        worst_error = worst_error.max((point.median - truth).abs());
        println!(
            "Species {} dose={:.2}: truth={truth:.3}, median={:.3}, 95% CrI [{:.3}, {:.3}]",
            point.species, point.dose, point.median, point.lower, point.upper
        );
    }
    println!("Largest absolute curve error on the grid: {worst_error:.4}");

    Ok(())
}

fn simulate(
    truths: &[CurveParameters],
    effects: &RandomEffectState,
    rng: &mut StdRng,
) -> DoseResponseInput {
    let trial_effects = effects.build_trial_effects();
    let mut dose = Vec::new();
    let mut response = Vec::new();
    let mut species_ids = Vec::new();
    let mut trial_ids = Vec::new();
    for (species, truth) in truths.iter().enumerate() {
        for (trial, effect) in trial_effects.iter().enumerate() {
            let parameters = effect.apply(truth);
            for x in DOSES {
                let mean = evaluate_curve(&parameters, x, SHAPE_EXPONENT, CurveSign::Stimulatory);
                for _ in 0..REPLICATES {
                    dose.push(x);
                    response.push(NOISE_SD.mul_add(sample_standard_normal(rng), mean));
                    species_ids.push(species + 1);
                    trial_ids.push(trial + 1);
                }
            }
        }
    }
    DoseResponseInput::new(dose, response, species_ids, trial_ids, ResponseType::Absorbance)
}
