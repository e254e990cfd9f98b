//! Input preparation: row-to-group mapping and (group, trial) likelihood cells.

use std::collections::BTreeMap;

use crate::input::DoseResponseInput;

use super::types::{ConfigurationError, ModelDimensions};

/// Rows sharing one (group, trial) pair; the unit of incremental likelihood caching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CellRows {
    pub group: usize,
    pub trial: usize,
    pub rows: Vec<usize>,
}

/// Prepared input view reused by the graph builder and sampler.
#[derive(Debug, Clone)]
pub(crate) struct PreparedInput {
    pub dose: Vec<f64>,
    pub response: Vec<f64>,
    /// Zero-based trial of each row.
    pub row_trial: Vec<usize>,
    pub cells: Vec<CellRows>,
    /// Cell indices owned by each group.
    pub group_cells: Vec<Vec<usize>>,
    pub max_dose: f64,
}

impl PreparedInput {
    #[must_use]
    pub(crate) const fn n_rows(&self) -> usize {
        self.dose.len()
    }

    /// Rows of `group`, cell by cell.
    pub(crate) fn group_rows(&self, group: usize) -> impl Iterator<Item = usize> + '_ {
        self.group_cells[group]
            .iter()
            .flat_map(|cell| self.cells[*cell].rows.iter().copied())
    }
}

/// # Errors
///
/// Returns `ConfigurationError` if the table is malformed, an id exceeds its
/// configured count, or a (species, level) group or a trial has no rows.
pub(crate) fn prepare_input(
    input: &DoseResponseInput,
    dimensions: ModelDimensions,
) -> Result<PreparedInput, ConfigurationError> {
    dimensions.validate()?;
    input.validate()?;

    let mut row_group = Vec::with_capacity(input.len());
    let mut row_trial = Vec::with_capacity(input.len());
    for row in 0..input.len() {
        let species = input.species_ids[row];
        let level = input.level(row);
        let trial = input.trial_ids[row];
        check_dimension("species", species, row, dimensions.species)?;
        check_dimension("level", level, row, dimensions.levels)?;
        check_dimension("trial", trial, row, dimensions.trials)?;
        row_group.push(dimensions.group_index(species, level));
        row_trial.push(trial - 1);
    }

    let mut grouped: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
    for (row, (group, trial)) in row_group.iter().zip(row_trial.iter()).enumerate() {
        grouped.entry((*group, *trial)).or_default().push(row);
    }

    let mut group_cells = vec![Vec::new(); dimensions.groups()];
    let mut trial_observed = vec![false; dimensions.trials];
    let cells = grouped
        .into_iter()
        .enumerate()
        .map(|(index, ((group, trial), rows))| {
            group_cells[group].push(index);
            trial_observed[trial] = true;
            CellRows { group, trial, rows }
        })
        .collect::<Vec<_>>();

    if let Some(group) = group_cells.iter().position(Vec::is_empty) {
        let (species, level) = dimensions.group_label(group);
        return Err(ConfigurationError::EmptyGroup { species, level });
    }
    if let Some(trial) = trial_observed.iter().position(|observed| !observed) {
        return Err(ConfigurationError::EmptyTrial { trial: trial + 1 });
    }

    Ok(PreparedInput {
        dose: input.dose.clone(),
        response: input.response.clone(),
        row_trial,
        cells,
        group_cells,
        max_dose: input.max_dose().unwrap_or(f64::NAN),
    })
}

const fn check_dimension(
    dimension: &'static str,
    id: usize,
    row: usize,
    count: usize,
) -> Result<(), ConfigurationError> {
    if id > count {
        Err(ConfigurationError::DimensionMismatch {
            dimension,
            id,
            row,
            count,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::ResponseType;

    fn dims(species: usize, levels: usize, trials: usize) -> ModelDimensions {
        ModelDimensions {
            species,
            levels,
            trials,
        }
    }

    fn two_species_input() -> DoseResponseInput {
        DoseResponseInput::new(
            vec![0.1, 1.0, 10.0, 0.1, 1.0, 10.0],
            vec![1.0, 0.5, 0.0, 1.1, 0.6, 0.1],
            vec![1, 1, 1, 2, 2, 2],
            vec![1, 2, 1, 1, 2, 2],
            ResponseType::Absorbance,
        )
    }

    #[test]
    fn prepare_input_partitions_rows_into_cells() {
        let prepared = prepare_input(&two_species_input(), dims(2, 1, 2)).expect("valid input");
        assert_eq!(prepared.n_rows(), 6);
        assert_eq!(prepared.cells.len(), 4);
        assert_eq!(prepared.cells[0].rows, vec![0, 2]);
        assert_eq!(prepared.group_cells[1], vec![2, 3]);
        assert_eq!(prepared.row_trial, vec![0, 1, 0, 0, 1, 1]);
        assert_eq!((prepared.cells[3].group, prepared.cells[3].trial), (1, 1));
        assert_eq!(prepared.group_rows(0).collect::<Vec<_>>(), vec![0, 2, 1]);
        assert!((prepared.max_dose - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn prepare_input_rejects_ids_beyond_dimensions() {
        let error = prepare_input(&two_species_input(), dims(1, 1, 2)).expect_err("species 2");
        assert_eq!(
            error,
            ConfigurationError::DimensionMismatch {
                dimension: "species",
                id: 2,
                row: 3,
                count: 1,
            }
        );
    }

    #[test]
    fn prepare_input_rejects_empty_groups() {
        let error = prepare_input(&two_species_input(), dims(3, 1, 2)).expect_err("species 3");
        assert_eq!(
            error,
            ConfigurationError::EmptyGroup {
                species: 3,
                level: 1,
            }
        );
    }

    #[test]
    fn prepare_input_rejects_trials_without_rows() {
        let input = DoseResponseInput::new(
            vec![0.1, 1.0, 10.0],
            vec![1.0, 0.5, 0.0],
            vec![1; 3],
            vec![1; 3],
            ResponseType::Absorbance,
        );
        assert!(prepare_input(&input, dims(1, 1, 1)).is_ok());
        let error = prepare_input(&input, dims(1, 1, 5)).expect_err("trials 2..=5 are empty");
        assert_eq!(error, ConfigurationError::EmptyTrial { trial: 2 });
    }

    #[test]
    fn levels_default_to_one() {
        let error = prepare_input(&two_species_input(), dims(2, 2, 2)).expect_err("level 2");
        assert!(matches!(error, ConfigurationError::EmptyGroup { level: 2, .. }));
    }
}
