//! MCMC convergence diagnostics.

use std::fmt;

use crate::utils::usize_to_f64;

use super::posterior::PosteriorSummary;
use super::types::{ConfigurationError, HormesisError};

/// Lag-`k` autocorrelation for a scalar chain.
#[must_use]
pub fn autocorrelation(series: &[f64], lag: usize) -> f64 {
    if series.is_empty() || lag >= series.len() {
        return 0.0;
    }

    let n = series.len() - lag;
    let mean = series.iter().sum::<f64>() / usize_to_f64(series.len());

    let mut numerator = 0.0;
    let mut denominator = 0.0;

    for value in series {
        let centered = value - mean;
        denominator += centered * centered;
    }

    if denominator <= 0.0 {
        return 0.0;
    }

    for idx in 0..n {
        numerator += (series[idx] - mean) * (series[idx + lag] - mean);
    }

    numerator / denominator
}

/// Heuristic effective sample size using positive autocorrelation truncation.
#[must_use]
pub fn effective_sample_size(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 2 {
        return usize_to_f64(n);
    }

    let mut rho_sum = 0.0;
    for lag in 1..n {
        let rho = autocorrelation(series, lag);
        if rho <= 0.0 {
            break;
        }
        rho_sum += rho;
    }

    usize_to_f64(n) / (2.0f64.mul_add(rho_sum, 1.0)).max(1.0)
}

/// Split-R-hat of one scalar across chains.
///
/// Every chain is truncated to the shortest chain's even length and split in
/// half, so a single chain already yields two comparable segments.
///
/// # Errors
///
/// Returns `HormesisError` if there are no chains or fewer than 4 usable draws per chain.
pub fn split_rhat(chains: &[Vec<f64>]) -> Result<f64, HormesisError> {
    let min_draws = chains.iter().map(Vec::len).min().ok_or(
        HormesisError::InsufficientChainDraws {
            minimum: 4,
            found: 0,
        },
    )?;
    let used = min_draws - (min_draws % 2);
    if used < 4 {
        return Err(HormesisError::InsufficientChainDraws {
            minimum: 4,
            found: used,
        });
    }

    let half = used / 2;
    let mut split_chains = Vec::with_capacity(chains.len() * 2);
    for chain in chains {
        split_chains.push(&chain[..half]);
        split_chains.push(&chain[half..used]);
    }
    Ok(rhat_of_segments(&split_chains, half))
}

fn rhat_of_segments(segments: &[&[f64]], n: usize) -> f64 {
    let means = segments
        .iter()
        .map(|segment| segment.iter().sum::<f64>() / usize_to_f64(n))
        .collect::<Vec<_>>();
    let variances = segments
        .iter()
        .zip(means.iter())
        .map(|(segment, mean)| sample_variance(segment, *mean))
        .collect::<Vec<_>>();

    let m = segments.len();
    let mean_of_means = means.iter().sum::<f64>() / usize_to_f64(m);
    let between = usize_to_f64(n)
        * means
            .iter()
            .map(|mean| {
                let centered = *mean - mean_of_means;
                centered * centered
            })
            .sum::<f64>()
        / usize_to_f64(m - 1);
    let within = variances.iter().sum::<f64>() / usize_to_f64(m);

    if !(within.is_finite() && within > 0.0 && between.is_finite()) {
        return 1.0;
    }

    let n_f64 = usize_to_f64(n);
    let var_plus = ((n_f64 - 1.0) / n_f64).mul_add(within, between / n_f64);
    if !var_plus.is_finite() || var_plus <= 0.0 {
        return 1.0;
    }

    (var_plus / within).sqrt().max(1.0)
}

fn sample_variance(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values
        .iter()
        .map(|value| {
            let centered = value - mean;
            centered * centered
        })
        .sum::<f64>()
        / usize_to_f64(values.len() - 1)
}

/// Limits beyond which a parameter is flagged as unconverged.
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceThresholds {
    pub max_split_rhat: f64,
    pub min_effective_sample_size: f64,
}

impl Default for ConvergenceThresholds {
    fn default() -> Self {
        Self {
            max_split_rhat: 1.1,
            min_effective_sample_size: 100.0,
        }
    }
}

impl ConvergenceThresholds {
    /// # Errors
    ///
    /// Returns `ConfigurationError` if a threshold is not positive.
    pub fn validate(self) -> Result<(), ConfigurationError> {
        if self.max_split_rhat > 0.0
            && self.min_effective_sample_size > 0.0
            && self.max_split_rhat.is_finite()
            && self.min_effective_sample_size.is_finite()
        {
            Ok(())
        } else {
            Err(ConfigurationError::InvalidConvergenceThresholds)
        }
    }
}

/// Diagnostic-only flag raised after a run; sampling is never aborted for it.
#[derive(Debug, Clone, PartialEq)]
pub enum ConvergenceWarning {
    HighSplitRhat {
        parameter: String,
        value: f64,
        threshold: f64,
    },
    LowEffectiveSampleSize {
        parameter: String,
        value: f64,
        threshold: f64,
    },
}

impl ConvergenceWarning {
    #[must_use]
    pub fn parameter(&self) -> &str {
        match self {
            Self::HighSplitRhat { parameter, .. }
            | Self::LowEffectiveSampleSize { parameter, .. } => parameter,
        }
    }
}

impl fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighSplitRhat {
                parameter,
                value,
                threshold,
            } => write!(f, "{parameter}: split R-hat {value:.3} exceeds {threshold}"),
            Self::LowEffectiveSampleSize {
                parameter,
                value,
                threshold,
            } => write!(f, "{parameter}: effective sample size {value:.1} below {threshold}"),
        }
    }
}

/// Flag parameters whose split-R-hat or ESS cross `thresholds`, logging each.
///
/// Degenerate parameters (zero posterior spread, such as a fixed indicator) are
/// not flagged for low ESS.
#[must_use]
pub fn convergence_warnings(
    summary: &PosteriorSummary,
    thresholds: ConvergenceThresholds,
) -> Vec<ConvergenceWarning> {
    let mut warnings = Vec::new();
    for parameter in &summary.parameters {
        if let Some(rhat) = parameter.split_rhat
            && rhat > thresholds.max_split_rhat
        {
            warnings.push(ConvergenceWarning::HighSplitRhat {
                parameter: parameter.name.clone(),
                value: rhat,
                threshold: thresholds.max_split_rhat,
            });
        }
        if parameter.sd > 0.0 && parameter.ess < thresholds.min_effective_sample_size {
            warnings.push(ConvergenceWarning::LowEffectiveSampleSize {
                parameter: parameter.name.clone(),
                value: parameter.ess,
                threshold: thresholds.min_effective_sample_size,
            });
        }
    }
    for warning in &warnings {
        log::warn!("non-convergence: {warning}");
    }
    warnings
}
