//! Model dependency graph and build-time kernel registry.
//!
//! Every parameter, derived quantity and likelihood cell is a node. Edges run
//! from a node to the nodes whose value depends on it. The graph is checked for
//! cycles and sorted once at build time; each stochastic node then carries the
//! likelihood cells it reaches, its deterministic descendants and the update
//! kernel its structural class maps to.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::effects::EFFECT_CHANNELS;
use super::input::PreparedInput;
use super::types::{ConfigurationError, ModelDimensions, RandomEffectsStructure};

/// Identity of one node in the model graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeId {
    Floor(usize),
    Ceiling(usize),
    EffectiveDose(usize),
    Slope(usize),
    HormesisIndicator(usize),
    HormesisMagnitude(usize),
    ResidualVariance,
    EffectScale(usize),
    CorrelationFactor,
    TrialLatent(usize),
    TrialEffect(usize),
    Correlation,
    EffectiveDoseDifference(usize, usize),
    CeilingDifference(usize, usize),
    /// Likelihood of one (group, trial) cell.
    Likelihood(usize),
}

/// Static structural classification of a stochastic node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralClass {
    /// Enters the curve mean linearly under a Gaussian likelihood.
    LinearInMean,
    /// Positive and non-linear in the mean.
    NonlinearPositive,
    /// Binary indicator that switches a continuous partner on and off.
    IndicatorWithPartner,
    /// Variance of the Gaussian likelihood.
    GaussianVariance,
    /// Positive hierarchical scale without a conjugate form.
    PositiveScale,
    /// Cholesky factor of a correlation matrix.
    CorrelationCholesky,
    /// Standard-normal latent vector of a non-centered effect.
    StandardNormalLatent,
}

/// Update kernels available to the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKernel {
    /// Closed-form truncated normal draw.
    ConjugateNormal,
    /// Metropolis random walk on the log scale.
    LogRandomWalk,
    /// Trans-dimensional toggle of an indicator and its partner.
    ReversibleJump,
    /// Closed-form inverse-gamma draw.
    ConjugateInverseGamma,
    /// Random walk on the unconstrained Cholesky coordinates.
    CholeskyRandomWalk,
    /// Block random walk on a latent vector.
    LatentBlockRandomWalk,
}

impl UpdateKernel {
    /// Kernel registry keyed on structural class.
    #[must_use]
    pub const fn for_class(class: StructuralClass) -> Self {
        match class {
            StructuralClass::LinearInMean => Self::ConjugateNormal,
            StructuralClass::NonlinearPositive | StructuralClass::PositiveScale => {
                Self::LogRandomWalk
            }
            StructuralClass::IndicatorWithPartner => Self::ReversibleJump,
            StructuralClass::GaussianVariance => Self::ConjugateInverseGamma,
            StructuralClass::CorrelationCholesky => Self::CholeskyRandomWalk,
            StructuralClass::StandardNormalLatent => Self::LatentBlockRandomWalk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Stochastic(StructuralClass),
    Deterministic,
    Observed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Indices of the nodes this node's value depends on.
    pub parents: Vec<usize>,
}

/// One entry of the per-iteration update sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledUpdate {
    pub node: usize,
    pub id: NodeId,
    pub kernel: UpdateKernel,
}

/// Directed acyclic model graph with precomputed dependency sets.
#[derive(Debug, Clone)]
pub struct ModelGraph {
    nodes: Vec<GraphNode>,
    index: BTreeMap<NodeId, usize>,
    order: Vec<usize>,
    affected_cells: Vec<Vec<usize>>,
    deterministic_descendants: Vec<Vec<usize>>,
    schedule: Vec<ScheduledUpdate>,
}

impl ModelGraph {
    /// Build the graph for a prepared input.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::CyclicGraph` if the dependencies are cyclic.
    pub(crate) fn build(
        prepared: &PreparedInput,
        dimensions: ModelDimensions,
        random_effects: RandomEffectsStructure,
    ) -> Result<Self, ConfigurationError> {
        let mut builder = GraphBuilder::default();
        let groups = dimensions.groups();
        let correlated = random_effects == RandomEffectsStructure::CorrelatedTrials;

        for group in 0..groups {
            builder.add(NodeId::Floor(group), StructuralClass::LinearInMean.into(), &[]);
            builder.add(NodeId::Ceiling(group), StructuralClass::LinearInMean.into(), &[]);
            builder.add(
                NodeId::EffectiveDose(group),
                StructuralClass::NonlinearPositive.into(),
                &[],
            );
            builder.add(NodeId::Slope(group), StructuralClass::NonlinearPositive.into(), &[]);
            builder.add(
                NodeId::HormesisIndicator(group),
                StructuralClass::IndicatorWithPartner.into(),
                &[],
            );
            builder.add(
                NodeId::HormesisMagnitude(group),
                StructuralClass::LinearInMean.into(),
                &[NodeId::HormesisIndicator(group)],
            );
        }
        builder.add(
            NodeId::ResidualVariance,
            StructuralClass::GaussianVariance.into(),
            &[],
        );

        if correlated {
            for channel in 0..EFFECT_CHANNELS {
                builder.add(
                    NodeId::EffectScale(channel),
                    StructuralClass::PositiveScale.into(),
                    &[],
                );
            }
            builder.add(
                NodeId::CorrelationFactor,
                StructuralClass::CorrelationCholesky.into(),
                &[],
            );
            for trial in 0..dimensions.trials {
                builder.add(
                    NodeId::TrialLatent(trial),
                    StructuralClass::StandardNormalLatent.into(),
                    &[],
                );
            }
            for trial in 0..dimensions.trials {
                let mut parents = (0..EFFECT_CHANNELS)
                    .map(NodeId::EffectScale)
                    .collect::<Vec<_>>();
                parents.push(NodeId::CorrelationFactor);
                parents.push(NodeId::TrialLatent(trial));
                builder.add(NodeId::TrialEffect(trial), NodeKind::Deterministic, &parents);
            }
            builder.add(
                NodeId::Correlation,
                NodeKind::Deterministic,
                &[NodeId::CorrelationFactor],
            );
        }

        for (first, second) in difference_pairs(groups) {
            builder.add(
                NodeId::EffectiveDoseDifference(first, second),
                NodeKind::Deterministic,
                &[NodeId::EffectiveDose(first), NodeId::EffectiveDose(second)],
            );
            builder.add(
                NodeId::CeilingDifference(first, second),
                NodeKind::Deterministic,
                &[NodeId::Ceiling(first), NodeId::Ceiling(second)],
            );
        }

        for (cell, rows) in prepared.cells.iter().enumerate() {
            let mut parents = vec![
                NodeId::Floor(rows.group),
                NodeId::Ceiling(rows.group),
                NodeId::EffectiveDose(rows.group),
                NodeId::Slope(rows.group),
                NodeId::HormesisIndicator(rows.group),
                NodeId::HormesisMagnitude(rows.group),
                NodeId::ResidualVariance,
            ];
            if correlated {
                parents.push(NodeId::TrialEffect(rows.trial));
            }
            builder.add(NodeId::Likelihood(cell), NodeKind::Observed, &parents);
        }

        Self::from_nodes(builder.nodes)
    }

    /// Assemble a graph from explicit nodes.
    ///
    /// Parent indices must refer to nodes of the same slice.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::CyclicGraph` if no topological order exists.
    pub fn from_nodes(nodes: Vec<GraphNode>) -> Result<Self, ConfigurationError> {
        let count = nodes.len();
        let mut children = vec![Vec::new(); count];
        let mut in_degree = vec![0usize; count];
        for (node, entry) in nodes.iter().enumerate() {
            for parent in &entry.parents {
                children[*parent].push(node);
                in_degree[node] += 1;
            }
        }

        let mut queue = (0..count)
            .filter(|node| in_degree[*node] == 0)
            .collect::<VecDeque<_>>();
        let mut order = Vec::with_capacity(count);
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for child in &children[node] {
                in_degree[*child] -= 1;
                if in_degree[*child] == 0 {
                    queue.push_back(*child);
                }
            }
        }
        if order.len() != count {
            return Err(ConfigurationError::CyclicGraph);
        }

        let mut affected = vec![BTreeSet::new(); count];
        let mut deterministic = vec![BTreeSet::new(); count];
        for node in order.iter().rev().copied() {
            if let NodeId::Likelihood(cell) = nodes[node].id {
                affected[node].insert(cell);
            }
            for child in &children[node] {
                let child_cells = affected[*child].clone();
                affected[node].extend(child_cells);
                let child_deterministic = deterministic[*child].clone();
                deterministic[node].extend(child_deterministic);
                if nodes[*child].kind == NodeKind::Deterministic {
                    deterministic[node].insert(*child);
                }
            }
        }

        let schedule = nodes
            .iter()
            .enumerate()
            .filter_map(|(node, entry)| match entry.kind {
                NodeKind::Stochastic(class) => Some(ScheduledUpdate {
                    node,
                    id: entry.id,
                    kernel: UpdateKernel::for_class(class),
                }),
                NodeKind::Deterministic | NodeKind::Observed => None,
            })
            .collect();
        let index = nodes
            .iter()
            .enumerate()
            .map(|(node, entry)| (entry.id, node))
            .collect();

        Ok(Self {
            nodes,
            index,
            order,
            affected_cells: affected.into_iter().map(|set| set.into_iter().collect()).collect(),
            deterministic_descendants: deterministic
                .into_iter()
                .map(|set| set.into_iter().collect())
                .collect(),
            schedule,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn node(&self, node: usize) -> &GraphNode {
        &self.nodes[node]
    }

    #[must_use]
    pub fn node_index(&self, id: NodeId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    /// Node indices in topological order.
    #[must_use]
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Likelihood cells whose value depends on `node`.
    #[must_use]
    pub fn affected_cells(&self, node: usize) -> &[usize] {
        &self.affected_cells[node]
    }

    /// Deterministic nodes whose value depends on `node`.
    #[must_use]
    pub fn deterministic_descendants(&self, node: usize) -> &[usize] {
        &self.deterministic_descendants[node]
    }

    /// Stochastic nodes in sweep order with their resolved kernels.
    #[must_use]
    pub fn schedule(&self) -> &[ScheduledUpdate] {
        &self.schedule
    }
}

impl From<StructuralClass> for NodeKind {
    fn from(class: StructuralClass) -> Self {
        Self::Stochastic(class)
    }
}

#[derive(Default)]
struct GraphBuilder {
    nodes: Vec<GraphNode>,
    index: BTreeMap<NodeId, usize>,
}

impl GraphBuilder {
    fn add(&mut self, id: NodeId, kind: NodeKind, parents: &[NodeId]) {
        let parents = parents
            .iter()
            .filter_map(|parent| self.index.get(parent).copied())
            .collect();
        self.index.insert(id, self.nodes.len());
        self.nodes.push(GraphNode { id, kind, parents });
    }
}

/// Group pairs `(g, h)` with `g < h`, in lexicographic order.
#[must_use]
pub fn difference_pairs(groups: usize) -> Vec<(usize, usize)> {
    (0..groups)
        .flat_map(|first| ((first + 1)..groups).map(move |second| (first, second)))
        .collect()
}

/// Position of pair `(first, second)`, `first < second`, in [`difference_pairs`].
#[must_use]
pub const fn difference_position(groups: usize, first: usize, second: usize) -> usize {
    first * (2 * groups - first - 1) / 2 + (second - first - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{DoseResponseInput, ResponseType};
    use crate::models::hormesis::input::prepare_input;

    fn graph(random_effects: RandomEffectsStructure) -> ModelGraph {
        let dims = ModelDimensions {
            species: 2,
            levels: 1,
            trials: 2,
        };
        let input = DoseResponseInput::new(
            vec![0.1, 1.0, 10.0, 0.1, 1.0, 10.0],
            vec![1.0, 0.5, 0.0, 1.1, 0.6, 0.1],
            vec![1, 1, 1, 2, 2, 2],
            vec![1, 2, 1, 1, 2, 2],
            ResponseType::Absorbance,
        );
        let prepared = prepare_input(&input, dims).expect("valid input");
        ModelGraph::build(&prepared, dims, random_effects).expect("acyclic graph")
    }

    #[test]
    fn registry_resolves_kernels_by_class() {
        let graph = graph(RandomEffectsStructure::CorrelatedTrials);
        let kernel_of = |id| {
            graph
                .schedule()
                .iter()
                .find(|entry| entry.id == id)
                .map(|entry| entry.kernel)
        };
        assert_eq!(kernel_of(NodeId::Floor(0)), Some(UpdateKernel::ConjugateNormal));
        assert_eq!(
            kernel_of(NodeId::HormesisMagnitude(1)),
            Some(UpdateKernel::ConjugateNormal)
        );
        assert_eq!(
            kernel_of(NodeId::HormesisIndicator(1)),
            Some(UpdateKernel::ReversibleJump)
        );
        assert_eq!(kernel_of(NodeId::Slope(0)), Some(UpdateKernel::LogRandomWalk));
        assert_eq!(
            kernel_of(NodeId::CorrelationFactor),
            Some(UpdateKernel::CholeskyRandomWalk)
        );
        assert_eq!(kernel_of(NodeId::TrialEffect(0)), None);
    }

    #[test]
    fn indicator_precedes_its_partner_in_the_sweep() {
        let graph = graph(RandomEffectsStructure::Disabled);
        let position = |id| graph.schedule().iter().position(|entry| entry.id == id);
        assert!(position(NodeId::HormesisIndicator(0)) < position(NodeId::HormesisMagnitude(0)));
        assert_eq!(graph.schedule().len(), 2 * 6 + 1);
    }

    #[test]
    fn affected_cells_follow_dependencies() {
        let graph = graph(RandomEffectsStructure::CorrelatedTrials);
        let node = |id| graph.node_index(id).expect("node exists");
        assert_eq!(graph.affected_cells(node(NodeId::Slope(1))), &[2, 3]);
        assert_eq!(graph.affected_cells(node(NodeId::TrialLatent(1))), &[1, 3]);
        assert_eq!(
            graph.affected_cells(node(NodeId::EffectScale(2))),
            &[0, 1, 2, 3]
        );
        assert!(graph.affected_cells(node(NodeId::Correlation)).is_empty());
        assert_eq!(
            graph.deterministic_descendants(node(NodeId::Ceiling(0))),
            &[node(NodeId::CeilingDifference(0, 1))]
        );
    }

    #[test]
    fn topological_order_places_parents_first() {
        let graph = graph(RandomEffectsStructure::CorrelatedTrials);
        let mut position = vec![0; graph.len()];
        for (rank, node) in graph.topological_order().iter().enumerate() {
            position[*node] = rank;
        }
        for node in 0..graph.len() {
            for parent in &graph.node(node).parents {
                assert!(position[*parent] < position[node]);
            }
        }
    }

    #[test]
    fn cycles_are_rejected() {
        let nodes = vec![
            GraphNode {
                id: NodeId::Floor(0),
                kind: NodeKind::Deterministic,
                parents: vec![1],
            },
            GraphNode {
                id: NodeId::Ceiling(0),
                kind: NodeKind::Deterministic,
                parents: vec![0],
            },
        ];
        assert_eq!(
            ModelGraph::from_nodes(nodes).expect_err("cycle"),
            ConfigurationError::CyclicGraph
        );
    }

    #[test]
    fn difference_pairs_are_ordered() {
        assert_eq!(difference_pairs(3), vec![(0, 1), (0, 2), (1, 2)]);
        assert!(difference_pairs(1).is_empty());
        for groups in 2..6 {
            for (position, (first, second)) in difference_pairs(groups).into_iter().enumerate() {
                assert_eq!(difference_position(groups, first, second), position);
            }
        }
    }
}
