//! Contract between the simulator and the reactions it drives.

use crate::genealogy::{LineageFactory, NodeId};
use crate::sampler::Sampler;
use crate::state::State;

/// How a reaction box is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionKind {
    /// Fires at a rate given by its propensity; may be tau-leaped.
    Continuous,
    /// Continuous, but always simulated exactly.
    Migration,
    /// Fires at fixed schedule boundaries.
    Punctual,
}

impl ReactionKind {
    pub fn is_continuous(self) -> bool {
        matches!(self, Self::Continuous | Self::Migration)
    }
}

/// Lineages not yet resolved during reverse-time reconstruction.
#[derive(Debug, Default)]
pub struct LineageMap {
    active: Vec<Vec<NodeId>>,
    terminated: Vec<NodeId>,
}

impl LineageMap {
    pub fn new(n_populations: usize) -> Self {
        Self {
            active: vec![Vec::new(); n_populations],
            terminated: Vec::new(),
        }
    }

    /// Number of tracked lineages in population `pop`.
    pub fn count(&self, pop: usize) -> usize {
        self.active[pop].len()
    }

    pub fn insert(&mut self, pop: usize, lineage: NodeId) {
        self.active[pop].push(lineage);
    }

    /// Remove and return a uniformly chosen lineage of population `pop`.
    pub fn take_random(&mut self, pop: usize, sampler: &mut Sampler) -> Option<NodeId> {
        let lineages = &mut self.active[pop];
        if lineages.is_empty() {
            return None;
        }
        let idx = sampler.next_index(lineages.len());
        Some(lineages.swap_remove(idx))
    }

    /// Mark a lineage as having no ancestor among the remaining events.
    pub fn terminate(&mut self, lineage: NodeId) {
        self.terminated.push(lineage);
    }

    /// Whether no population tracks more lineages than it has individuals.
    pub fn fits(&self, state: &State) -> bool {
        self.active
            .iter()
            .enumerate()
            .all(|(pop, lineages)| lineages.len() as f64 <= state.get(pop))
    }

    /// All lineages left without an ancestor.
    pub fn roots(&self) -> Vec<NodeId> {
        self.active
            .iter()
            .flatten()
            .chain(&self.terminated)
            .copied()
            .collect()
    }
}

/// A reaction participating in a trajectory.
///
/// Every box owns a monotone sequence of interval boundaries. Continuous
/// boxes change their rate at those boundaries; punctual boxes fire there.
pub trait ReactionBox {
    fn kind(&self) -> ReactionKind;

    /// Whether firing this reaction seeds a sampled lineage.
    fn produces_samples(&self) -> bool;

    /// Recompute and store the propensity from `state`. Continuous boxes only.
    fn update_propensity(&mut self, _state: &State) -> f64 {
        0.0
    }

    /// Propensity from the last call to [`ReactionBox::update_propensity`].
    fn current_propensity(&self) -> f64 {
        0.0
    }

    /// Execute the scheduled event. Punctual boxes only.
    ///
    /// Returns the realised multiplicity, or `None` when the event cannot
    /// fire with the available reactants.
    fn implement_event(&mut self, _state: &mut State, _sampler: &mut Sampler) -> Option<f64> {
        Some(0.0)
    }

    /// Apply `k` units (possibly negative) of the reaction's effect.
    fn increment_state(&self, state: &mut State, k: f64);

    fn interval_end_time(&self) -> f64;

    fn increment_interval(&mut self);

    fn reset_interval(&mut self);

    /// Largest number of firings the reactants in `state` allow.
    fn max_react_count(&self, state: &State) -> f64;

    /// Probability that one firing of an aggregated event involves a
    /// tracked lineage. `state` holds the occupancies right after the event.
    fn lineage_inclusion_probability(&self, lineages: &LineageMap, state: &State) -> f64;

    /// Instantiate the lineage effects of one firing at `time`.
    ///
    /// `aggregated` firings were drawn by binomial thinning and are known to
    /// involve at least one tracked lineage.
    fn increment_lineages(
        &self,
        lineages: &mut LineageMap,
        time: f64,
        factory: &mut LineageFactory,
        state: &State,
        sampler: &mut Sampler,
        aggregated: bool,
    );
}
