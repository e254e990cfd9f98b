//! Explicit row-exclusion and level-bucketing rules applied before fitting.
//!
//! Nothing here is applied implicitly: a fit only sees rows a caller passed
//! through [`apply_preprocess_rule`] with a rule they chose.

use crate::input::{DoseResponseInput, InputError, ResponseType};
use crate::utils::usize_to_f64;

/// Folds several solvent levels into a single catch-all level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchAllLevel {
    /// Levels to relabel.
    pub levels: Vec<usize>,
    /// Level id assigned to the relabelled rows.
    pub into: usize,
}

/// Row filters and relabelling applied to an observation table.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessRule {
    /// Drop rows with `dose <= 0`; hormesis-bearing fits require positive doses.
    pub drop_non_positive_doses: bool,
    /// Drop inhibition rows whose response is strictly below this threshold.
    ///
    /// Only applied to [`ResponseType::Inhibition`] tables.
    pub inhibition_floor: Option<f64>,
    /// Optional bucketing of solvent levels.
    pub catch_all_level: Option<CatchAllLevel>,
}

impl Default for PreprocessRule {
    fn default() -> Self {
        Self {
            drop_non_positive_doses: true,
            inhibition_floor: None,
            catch_all_level: None,
        }
    }
}

/// Row counts removed or relabelled by a [`PreprocessRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreprocessReport {
    pub rows_in: usize,
    pub rows_out: usize,
    pub dropped_non_positive_dose: usize,
    pub dropped_non_finite: usize,
    pub dropped_below_floor: usize,
    pub relabelled_levels: usize,
}

/// Apply `rule` to `input`, returning the retained rows and a count report.
///
/// Rows with non-finite dose or response are always dropped.
///
/// # Errors
///
/// Returns `InputError::LengthMismatch` if the columns are ragged.
pub fn apply_preprocess_rule(
    input: &DoseResponseInput,
    rule: &PreprocessRule,
) -> Result<(DoseResponseInput, PreprocessReport), InputError> {
    input.validate_columns()?;
    let mut report = PreprocessReport {
        rows_in: input.len(),
        ..PreprocessReport::default()
    };
    let mut kept = Vec::with_capacity(input.len());

    for row in 0..input.len() {
        let dose = input.dose[row];
        let response = input.response[row];
        if !(dose.is_finite() && response.is_finite()) {
            report.dropped_non_finite += 1;
            continue;
        }
        if rule.drop_non_positive_doses && dose <= 0.0 {
            report.dropped_non_positive_dose += 1;
            continue;
        }
        if input.response_type == ResponseType::Inhibition
            && rule.inhibition_floor.is_some_and(|floor| response < floor)
        {
            report.dropped_below_floor += 1;
            continue;
        }
        kept.push(row);
    }

    let relabel = |level: usize| match &rule.catch_all_level {
        Some(bucket) if bucket.levels.contains(&level) => bucket.into,
        _ => level,
    };
    let level_ids = input.level_ids.as_ref().map(|levels| {
        kept.iter()
            .map(|row| {
                let level = levels[*row];
                let relabelled = relabel(level);
                if relabelled != level {
                    report.relabelled_levels += 1;
                }
                relabelled
            })
            .collect::<Vec<_>>()
    });

    let output = DoseResponseInput {
        dose: kept.iter().map(|row| input.dose[*row]).collect(),
        response: kept.iter().map(|row| input.response[*row]).collect(),
        species_ids: kept.iter().map(|row| input.species_ids[*row]).collect(),
        trial_ids: kept.iter().map(|row| input.trial_ids[*row]).collect(),
        level_ids,
        response_type: input.response_type,
    };
    report.rows_out = output.len();
    Ok((output, report))
}

/// Summary of dose and response ranges in a table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResponseDiagnostics {
    pub n_rows: usize,
    pub n_finite: usize,
    pub n_non_finite: usize,
    pub n_non_positive_dose: usize,
    pub min_dose: f64,
    pub max_dose: f64,
    pub min_response: f64,
    pub max_response: f64,
    pub mean_response: f64,
}

#[must_use]
pub fn response_diagnostics(input: &DoseResponseInput) -> ResponseDiagnostics {
    let n_rows = input.len();
    let mut n_finite = 0usize;
    let mut n_non_positive_dose = 0usize;
    let mut min_dose = f64::INFINITY;
    let mut max_dose = f64::NEG_INFINITY;
    let mut min_response = f64::INFINITY;
    let mut max_response = f64::NEG_INFINITY;
    let mut response_sum = 0.0;

    for (dose, response) in input.dose.iter().zip(input.response.iter()) {
        if !(dose.is_finite() && response.is_finite()) {
            continue;
        }
        n_finite += 1;
        if *dose <= 0.0 {
            n_non_positive_dose += 1;
        }
        min_dose = min_dose.min(*dose);
        max_dose = max_dose.max(*dose);
        min_response = min_response.min(*response);
        max_response = max_response.max(*response);
        response_sum += response;
    }

    let mean_response = if n_finite > 0 {
        response_sum / usize_to_f64(n_finite)
    } else {
        f64::NAN
    };

    ResponseDiagnostics {
        n_rows,
        n_finite,
        n_non_finite: n_rows.saturating_sub(n_finite),
        n_non_positive_dose,
        min_dose,
        max_dose,
        min_response,
        max_response,
        mean_response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inhibition_input() -> DoseResponseInput {
        DoseResponseInput::new(
            vec![0.0, 0.5, 1.0, 2.0, f64::NAN],
            vec![0.0, -30.0, 20.0, 80.0, 10.0],
            vec![1, 1, 1, 1, 1],
            vec![1, 1, 2, 2, 2],
            ResponseType::Inhibition,
        )
        .with_level_ids(vec![1, 2, 3, 3, 1])
    }

    #[test]
    fn default_rule_only_drops_non_positive_and_non_finite() {
        let (output, report) =
            apply_preprocess_rule(&inhibition_input(), &PreprocessRule::default())
                .expect("aligned columns");
        assert_eq!(report.rows_in, 5);
        assert_eq!(report.rows_out, 3);
        assert_eq!(report.dropped_non_positive_dose, 1);
        assert_eq!(report.dropped_non_finite, 1);
        assert_eq!(report.dropped_below_floor, 0);
        assert!(output.validate().is_ok());
    }

    #[test]
    fn inhibition_floor_and_catch_all_level_are_explicit() {
        let rule = PreprocessRule {
            inhibition_floor: Some(-20.0),
            catch_all_level: Some(CatchAllLevel {
                levels: vec![3],
                into: 2,
            }),
            ..PreprocessRule::default()
        };
        let (output, report) =
            apply_preprocess_rule(&inhibition_input(), &rule).expect("aligned columns");
        assert_eq!(report.dropped_below_floor, 1);
        assert_eq!(report.relabelled_levels, 2);
        assert_eq!(output.level_ids, Some(vec![2, 2]));
        assert_eq!(output.dose, vec![1.0, 2.0]);
    }

    #[test]
    fn floor_is_ignored_for_absorbance() {
        let mut input = inhibition_input();
        input.response_type = ResponseType::Absorbance;
        let rule = PreprocessRule {
            inhibition_floor: Some(1.0e9),
            ..PreprocessRule::default()
        };
        let (_, report) = apply_preprocess_rule(&input, &rule).expect("aligned columns");
        assert_eq!(report.dropped_below_floor, 0);
    }

    #[test]
    fn ragged_columns_are_rejected_before_filtering() {
        let mut input = inhibition_input();
        input.species_ids.truncate(2);
        assert_eq!(
            apply_preprocess_rule(&input, &PreprocessRule::default()).err(),
            Some(InputError::LengthMismatch {
                column: "species",
                len: 2,
                rows: 5,
            })
        );

        let mut input = inhibition_input();
        input.level_ids = Some(vec![1, 2]);
        assert!(matches!(
            apply_preprocess_rule(&input, &PreprocessRule::default()),
            Err(InputError::LengthMismatch { column: "level", .. })
        ));
    }

    #[test]
    fn diagnostics_track_ranges() {
        let diag = response_diagnostics(&inhibition_input());
        assert_eq!(diag.n_rows, 5);
        assert_eq!(diag.n_finite, 4);
        assert_eq!(diag.n_non_positive_dose, 1);
        assert!((diag.max_dose - 2.0).abs() < 1e-12);
        assert!((diag.min_response + 30.0).abs() < 1e-12);
        assert!((diag.mean_response - 17.5).abs() < 1e-12);
    }
}
