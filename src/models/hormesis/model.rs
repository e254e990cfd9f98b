//! Model specification and the built, immutable model context.

use crate::input::{DoseResponseInput, ResponseType};

use super::curve::CurveSign;
use super::effects::EffectChannel;
use super::graph::{ModelGraph, NodeId};
use super::input::{PreparedInput, prepare_input};
use super::priors::PriorConfig;
use super::types::{ConfigurationError, ModelDimensions, RandomEffectsStructure};

/// Structural configuration of one model build.
#[derive(Debug, Clone, Copy)]
pub struct ModelConfig {
    pub dimensions: ModelDimensions,
    /// Fixed exponent `alpha` of the hormesis decay `exp(-1 / x^alpha)`.
    pub shape_exponent: f64,
    pub random_effects: RandomEffectsStructure,
    pub priors: PriorConfig,
}

impl ModelConfig {
    /// Configuration with default priors, correlated trial effects and `alpha = 0.5`.
    #[must_use]
    pub fn new(dimensions: ModelDimensions) -> Self {
        Self {
            dimensions,
            shape_exponent: 0.5,
            random_effects: RandomEffectsStructure::default(),
            priors: PriorConfig::default(),
        }
    }

    /// # Errors
    ///
    /// Returns `ConfigurationError` if dimensions, shape exponent or priors are invalid.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.dimensions.validate()?;
        if !(self.shape_exponent.is_finite() && self.shape_exponent > 0.0) {
            return Err(ConfigurationError::InvalidShapeExponent(self.shape_exponent));
        }
        self.priors.validate()
    }
}

/// A built model: validated data layout, dependency graph and resolved priors.
///
/// Immutable once built; every chain borrows it and owns its own state and RNG.
#[derive(Debug, Clone)]
pub struct HormesisModel {
    config: ModelConfig,
    response_type: ResponseType,
    effective_dose_upper: f64,
    data: PreparedInput,
    graph: ModelGraph,
}

impl HormesisModel {
    /// Validate `input` against `config` and assemble the model graph.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the configuration is invalid, an index
    /// array disagrees with the configured dimensions, or a group or trial has
    /// no rows.
    pub fn build(
        input: &DoseResponseInput,
        config: ModelConfig,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let data = prepare_input(input, config.dimensions)?;
        let effective_dose_upper = config.priors.effective_dose_upper.unwrap_or(data.max_dose);
        let graph = ModelGraph::build(&data, config.dimensions, config.random_effects)?;
        log::debug!(
            "built hormesis model: {} rows, {} groups, {} cells, {} graph nodes",
            data.n_rows(),
            config.dimensions.groups(),
            data.cells.len(),
            graph.len()
        );
        Ok(Self {
            config,
            response_type: input.response_type,
            effective_dose_upper,
            data,
            graph,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ModelConfig {
        &self.config
    }

    #[must_use]
    pub const fn dimensions(&self) -> ModelDimensions {
        self.config.dimensions
    }

    #[must_use]
    pub const fn shape_exponent(&self) -> f64 {
        self.config.shape_exponent
    }

    #[must_use]
    pub const fn priors(&self) -> &PriorConfig {
        &self.config.priors
    }

    #[must_use]
    pub const fn random_effects(&self) -> RandomEffectsStructure {
        self.config.random_effects
    }

    #[must_use]
    pub const fn response_type(&self) -> ResponseType {
        self.response_type
    }

    /// Curve sign fixed by the response type the model was built for.
    #[must_use]
    pub fn sign(&self) -> CurveSign {
        CurveSign::from(self.response_type)
    }

    /// Upper bound of the effective-dose support.
    #[must_use]
    pub const fn effective_dose_upper(&self) -> f64 {
        self.effective_dose_upper
    }

    #[must_use]
    pub const fn graph(&self) -> &ModelGraph {
        &self.graph
    }

    #[must_use]
    pub const fn n_observations(&self) -> usize {
        self.data.n_rows()
    }

    pub(crate) const fn data(&self) -> &PreparedInput {
        &self.data
    }

    /// `[species,level]` suffix of a group.
    #[must_use]
    pub fn group_suffix(&self, group: usize) -> String {
        let (species, level) = self.config.dimensions.group_label(group);
        format!("[{species},{level}]")
    }

    /// Human-readable name of a graph node.
    #[must_use]
    pub fn parameter_label(&self, id: NodeId) -> String {
        match id {
            NodeId::Floor(group) => format!("c{}", self.group_suffix(group)),
            NodeId::Ceiling(group) => format!("d{}", self.group_suffix(group)),
            NodeId::EffectiveDose(group) => format!("e{}", self.group_suffix(group)),
            NodeId::Slope(group) => format!("b{}", self.group_suffix(group)),
            NodeId::HormesisIndicator(group) => format!("w{}", self.group_suffix(group)),
            NodeId::HormesisMagnitude(group) => format!("f{}", self.group_suffix(group)),
            NodeId::ResidualVariance => "sigma_y".to_owned(),
            NodeId::EffectScale(channel) => format!(
                "sigma[{}]",
                EffectChannel::ALL
                    .get(channel)
                    .map_or("?", |channel| channel.label())
            ),
            NodeId::CorrelationFactor => "L".to_owned(),
            NodeId::TrialLatent(trial) => format!("z[{}]", trial + 1),
            NodeId::TrialEffect(trial) => format!("delta[{}]", trial + 1),
            NodeId::Correlation => "R".to_owned(),
            NodeId::EffectiveDoseDifference(first, second) => format!(
                "e{}-e{}",
                self.group_suffix(first),
                self.group_suffix(second)
            ),
            NodeId::CeilingDifference(first, second) => format!(
                "d{}-d{}",
                self.group_suffix(first),
                self.group_suffix(second)
            ),
            NodeId::Likelihood(cell) => format!("y[{}]", cell + 1),
        }
    }
}
