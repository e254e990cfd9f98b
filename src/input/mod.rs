//! # Model inputs
//!
//! Column-oriented container for dose-response observations as delivered by
//! upstream data preparation.
//!
//! # Examples
//!
//! ```
//! use dose_response_models::{DoseResponseInput, ResponseType};
//!
//! let input = DoseResponseInput::new(
//!     vec![0.1, 1.0, 10.0],
//!     vec![0.98, 0.51, 0.01],
//!     vec![1, 1, 1],
//!     vec![1, 1, 1],
//!     ResponseType::Absorbance,
//! );
//!
//! assert!(input.validate().is_ok());
//! ```
//!
//! ```
//! use dose_response_models::{DoseResponseInput, ResponseType};
//!
//! let input = DoseResponseInput::new(
//!     vec![0.1, 1.0],
//!     vec![0.98, 0.51, 0.01],
//!     vec![1, 1],
//!     vec![1, 1],
//!     ResponseType::Absorbance,
//! );
//!
//! assert!(input.validate().is_err());
//! ```

use thiserror::Error;

/// Errors returned when validating dose-response inputs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("input must contain at least one observation")]
    Empty,
    #[error("{column} length ({len}) must equal number of doses ({rows})")]
    LengthMismatch {
        column: &'static str,
        len: usize,
        rows: usize,
    },
    #[error("doses contain non-finite values")]
    NonFiniteDose,
    #[error("doses must be strictly positive; row {row} is not")]
    NonPositiveDose { row: usize },
    #[error("responses contain non-finite values")]
    NonFiniteResponse,
    #[error("{column} ids are 1-based; row {row} has id 0")]
    ZeroId { column: &'static str, row: usize },
    #[error("observations mix absorbance and inhibition responses")]
    MixedResponseTypes,
}

/// Measured response scale, which fixes the curve's sign convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Growth measured as absorbance; the hormesis bump raises the response.
    #[default]
    Absorbance,
    /// Percent inhibition; the hormesis bump lowers the response.
    Inhibition,
}

/// A single measured response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub dose: f64,
    pub species: usize,
    pub level: usize,
    pub trial: usize,
    pub response: f64,
    pub response_type: ResponseType,
}

/// Observation table for a single fit.
#[derive(Debug, Clone)]
pub struct DoseResponseInput {
    pub dose: Vec<f64>,
    pub response: Vec<f64>,
    pub species_ids: Vec<usize>,
    pub trial_ids: Vec<usize>,
    /// Solvent-level ids; `None` for single-factor experiments (all level 1).
    pub level_ids: Option<Vec<usize>>,
    pub response_type: ResponseType,
}

impl DoseResponseInput {
    #[must_use]
    pub const fn new(
        dose: Vec<f64>,
        response: Vec<f64>,
        species_ids: Vec<usize>,
        trial_ids: Vec<usize>,
        response_type: ResponseType,
    ) -> Self {
        Self {
            dose,
            response,
            species_ids,
            trial_ids,
            level_ids: None,
            response_type,
        }
    }

    #[must_use]
    pub fn with_level_ids(mut self, level_ids: Vec<usize>) -> Self {
        self.level_ids = Some(level_ids);
        self
    }

    /// Build a column-oriented input from row records.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if the slice is empty or mixes response types.
    pub fn from_observations(observations: &[Observation]) -> Result<Self, InputError> {
        let first = observations.first().ok_or(InputError::Empty)?;
        if observations
            .iter()
            .any(|observation| observation.response_type != first.response_type)
        {
            return Err(InputError::MixedResponseTypes);
        }

        let input = Self {
            dose: observations.iter().map(|row| row.dose).collect(),
            response: observations.iter().map(|row| row.response).collect(),
            species_ids: observations.iter().map(|row| row.species).collect(),
            trial_ids: observations.iter().map(|row| row.trial).collect(),
            level_ids: Some(observations.iter().map(|row| row.level).collect()),
            response_type: first.response_type,
        };
        input.validate()?;
        Ok(input)
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.dose.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.dose.is_empty()
    }

    /// Solvent-level id of `row` (1 when no levels were supplied).
    #[must_use]
    pub fn level(&self, row: usize) -> usize {
        self.level_ids.as_ref().map_or(1, |levels| levels[row])
    }

    /// Row records of this table.
    #[must_use]
    pub fn observations(&self) -> Vec<Observation> {
        (0..self.len())
            .map(|row| Observation {
                dose: self.dose[row],
                species: self.species_ids[row],
                level: self.level(row),
                trial: self.trial_ids[row],
                response: self.response[row],
                response_type: self.response_type,
            })
            .collect()
    }

    /// Largest dose in the table, or `None` when empty.
    #[must_use]
    pub fn max_dose(&self) -> Option<f64> {
        self.dose.iter().copied().reduce(f64::max)
    }

    /// Check that every column has one entry per dose.
    ///
    /// # Errors
    ///
    /// Returns `InputError::LengthMismatch` for the first ragged column.
    pub fn validate_columns(&self) -> Result<(), InputError> {
        let rows = self.dose.len();
        check_length("response", self.response.len(), rows)?;
        check_length("species", self.species_ids.len(), rows)?;
        check_length("trial", self.trial_ids.len(), rows)?;
        if let Some(levels) = &self.level_ids {
            check_length("level", levels.len(), rows)?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `InputError` if lengths or values are malformed.
    pub fn validate(&self) -> Result<(), InputError> {
        if self.dose.is_empty() {
            return Err(InputError::Empty);
        }
        self.validate_columns()?;

        if self.dose.iter().any(|value| !value.is_finite()) {
            return Err(InputError::NonFiniteDose);
        }
        if let Some(row) = self.dose.iter().position(|value| *value <= 0.0) {
            return Err(InputError::NonPositiveDose { row });
        }
        if self.response.iter().any(|value| !value.is_finite()) {
            return Err(InputError::NonFiniteResponse);
        }

        check_ids("species", &self.species_ids)?;
        check_ids("trial", &self.trial_ids)?;
        if let Some(levels) = &self.level_ids {
            check_ids("level", levels)?;
        }
        Ok(())
    }
}

const fn check_length(column: &'static str, len: usize, rows: usize) -> Result<(), InputError> {
    if len == rows {
        Ok(())
    } else {
        Err(InputError::LengthMismatch { column, len, rows })
    }
}

fn check_ids(column: &'static str, ids: &[usize]) -> Result<(), InputError> {
    match ids.iter().position(|id| *id == 0) {
        Some(row) => Err(InputError::ZeroId { column, row }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(dose: f64, response_type: ResponseType) -> Observation {
        Observation {
            dose,
            species: 1,
            level: 1,
            trial: 1,
            response: 0.5,
            response_type,
        }
    }

    #[test]
    fn validate_accepts_well_formed_input() {
        let input = DoseResponseInput::new(
            vec![0.5, 1.0, 2.0],
            vec![1.0, 0.6, 0.2],
            vec![1, 1, 2],
            vec![1, 2, 1],
            ResponseType::Absorbance,
        )
        .with_level_ids(vec![1, 2, 1]);
        assert!(input.validate().is_ok());
        assert_eq!(input.level(1), 2);
        assert_eq!(input.max_dose(), Some(2.0));
    }

    #[test]
    fn validate_rejects_trial_length_mismatch() {
        let input = DoseResponseInput::new(
            vec![0.5, 1.0],
            vec![1.0, 0.6],
            vec![1, 1],
            vec![1],
            ResponseType::Absorbance,
        );
        let error = input.validate().expect_err("trial mismatch should fail");
        assert!(matches!(
            error,
            InputError::LengthMismatch {
                column: "trial",
                ..
            }
        ));
    }

    #[test]
    fn validate_rejects_zero_dose() {
        let input = DoseResponseInput::new(
            vec![0.0, 1.0],
            vec![1.0, 0.6],
            vec![1, 1],
            vec![1, 1],
            ResponseType::Inhibition,
        );
        assert_eq!(
            input.validate(),
            Err(InputError::NonPositiveDose { row: 0 })
        );
    }

    #[test]
    fn from_observations_rejects_mixed_response_types() {
        let rows = [
            observation(1.0, ResponseType::Absorbance),
            observation(2.0, ResponseType::Inhibition),
        ];
        assert_eq!(
            DoseResponseInput::from_observations(&rows).expect_err("mixed types"),
            InputError::MixedResponseTypes
        );
    }

    #[test]
    fn observations_round_trip_through_columns() {
        let rows = [
            observation(1.0, ResponseType::Inhibition),
            observation(2.0, ResponseType::Inhibition),
        ];
        let input = DoseResponseInput::from_observations(&rows).expect("valid rows");
        assert_eq!(input.response_type, ResponseType::Inhibition);
        assert_eq!(input.observations(), rows.to_vec());
    }
}
