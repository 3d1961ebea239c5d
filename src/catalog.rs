//! Mass-action reactions used to build models from configuration.

use crate::config::{ModelConfig, ProductConfig};
use crate::genealogy::{LineageFactory, NodeId};
use crate::reaction::{LineageMap, ReactionBox, ReactionKind};
use crate::sampler::{Sampler, log_choose};
use crate::state::State;
use anyhow::{Context, Result, bail};
use rand_distr::{Binomial, Distribution};

/// Product of a reaction, optionally descending from one of its reactants.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductSlot {
    pub population: usize,
    pub parent: Option<usize>,
}

/// Reactants, products and lineage links shared by all reaction kinds.
#[derive(Debug, Clone)]
pub struct Stoichiometry {
    reactants: Vec<usize>,
    products: Vec<ProductSlot>,
    reactant_counts: Vec<(usize, f64)>,
    product_counts: Vec<(usize, f64)>,
    change: Vec<(usize, f64)>,
    sample_products: bool,
    migration: bool,
}

impl Stoichiometry {
    /// Build from reactant population indices and product slots.
    pub fn new(reactants: Vec<usize>, products: Vec<ProductSlot>, state: &State) -> Result<Self> {
        for &pop in &reactants {
            if pop >= state.len() {
                bail!("reactant population {pop} does not exist");
            }
        }
        for (slot, product) in products.iter().enumerate() {
            if product.population >= state.len() {
                bail!("product population {} does not exist", product.population);
            }
            match product.parent {
                Some(parent) if parent >= reactants.len() => {
                    bail!("product {slot} has parent {parent}, but there are {} reactants", reactants.len())
                }
                None if state.is_sample(product.population) => {
                    bail!("sample product {slot} must descend from a reactant")
                }
                _ => {}
            }
        }

        let reactant_counts = tally(reactants.iter().copied());
        let product_counts = tally(
            products
                .iter()
                .map(|product| product.population)
                .filter(|&pop| !state.is_sample(pop)),
        );

        let mut change: Vec<(usize, f64)> = Vec::new();
        for &(pop, count) in &reactant_counts {
            add_change(&mut change, pop, -count);
        }
        for (pop, count) in tally(products.iter().map(|product| product.population)) {
            add_change(&mut change, pop, count);
        }
        change.retain(|&(_, delta)| delta != 0.0);

        let sample_products = products.iter().any(|product| state.is_sample(product.population));
        let migration = reactants.len() == 1
            && products.len() == 1
            && products[0].parent == Some(0)
            && products[0].population != reactants[0]
            && !state.is_sample(products[0].population);

        Ok(Self {
            reactants,
            products,
            reactant_counts,
            product_counts,
            change,
            sample_products,
            migration,
        })
    }

    pub fn produces_samples(&self) -> bool {
        self.sample_products
    }

    pub fn is_migration(&self) -> bool {
        self.migration
    }

    /// Number of distinct ordered reactant combinations in `state`.
    pub fn combinations(&self, state: &State) -> f64 {
        let mut prod = 1.0;
        for &(pop, count) in &self.reactant_counts {
            let occ = state.get(pop);
            let mut m = 0.0;
            while m < count {
                prod *= (occ - m).max(0.0);
                m += 1.0;
            }
        }
        prod
    }

    pub fn max_react_count(&self, state: &State) -> f64 {
        self.reactant_counts
            .iter()
            .map(|&(pop, count)| (state.get(pop) / count).floor().max(0.0))
            .fold(f64::INFINITY, f64::min)
    }

    pub fn apply(&self, state: &mut State, k: f64) {
        for &(pop, delta) in &self.change {
            state.add(pop, delta * k);
        }
    }

    /// One minus the probability that no product of a firing is a tracked
    /// lineage, with products drawn without replacement from the occupancies.
    pub fn inclusion_probability(&self, lineages: &LineageMap, state: &State) -> f64 {
        if self.sample_products {
            return 1.0;
        }
        let mut log_miss = 0.0;
        for &(pop, m) in &self.product_counts {
            let tracked = lineages.count(pop) as f64;
            if tracked == 0.0 {
                continue;
            }
            let occ = state.get(pop);
            if occ - tracked < m {
                return 1.0;
            }
            log_miss += log_choose(occ - tracked, m) - log_choose(occ, m);
        }
        (1.0 - log_miss.exp()).clamp(0.0, 1.0)
    }

    pub fn increment_lineages(
        &self,
        lineages: &mut LineageMap,
        time: f64,
        factory: &mut LineageFactory,
        state: &State,
        sampler: &mut Sampler,
        aggregated: bool,
    ) {
        let mut picked: Vec<Option<NodeId>> = vec![None; self.products.len()];

        for (slot, product) in self.products.iter().enumerate() {
            if let (true, Some(parent)) = (state.is_sample(product.population), product.parent) {
                picked[slot] = Some(factory.new_leaf(self.reactants[parent], time));
            }
        }

        let mut taken = vec![0.0; state.len()];
        let mut probs = vec![0.0; self.products.len()];
        for (slot, product) in self.products.iter().enumerate() {
            let pop = product.population;
            if state.is_sample(pop) {
                continue;
            }
            let tracked = lineages.count(pop) as f64;
            let remaining = state.get(pop) - taken[pop];
            probs[slot] = if remaining <= 0.0 {
                if tracked > 0.0 { 1.0 } else { 0.0 }
            } else {
                (tracked / remaining).min(1.0)
            };
            if sampler.next_uniform() < probs[slot] {
                picked[slot] = lineages.take_random(pop, sampler);
            }
            taken[pop] += 1.0;
        }

        if aggregated && picked.iter().all(Option::is_none) {
            if let Some(slot) = choose_weighted(&probs, sampler) {
                picked[slot] = lineages.take_random(self.products[slot].population, sampler);
            }
        }

        for (r_slot, &r_pop) in self.reactants.iter().enumerate() {
            let children: Vec<NodeId> = self
                .products
                .iter()
                .zip(&picked)
                .filter(|(product, _)| product.parent == Some(r_slot))
                .filter_map(|(_, &lineage)| lineage)
                .collect();
            match children.as_slice() {
                [] => {}
                [child] if factory.node(*child).population == r_pop => lineages.insert(r_pop, *child),
                _ => {
                    let node = factory.new_internal(r_pop, time, &children);
                    lineages.insert(r_pop, node);
                }
            }
        }

        for (product, &lineage) in self.products.iter().zip(&picked) {
            if let (None, Some(lineage)) = (product.parent, lineage) {
                lineages.terminate(lineage);
            }
        }
    }
}

fn tally(pops: impl Iterator<Item = usize>) -> Vec<(usize, f64)> {
    let mut counts: Vec<(usize, f64)> = Vec::new();
    for pop in pops {
        add_change(&mut counts, pop, 1.0);
    }
    counts
}

fn add_change(change: &mut Vec<(usize, f64)>, pop: usize, delta: f64) {
    match change.iter_mut().find(|(p, _)| *p == pop) {
        Some((_, val)) => *val += delta,
        None => change.push((pop, delta)),
    }
}

fn choose_weighted(weights: &[f64], sampler: &mut Sampler) -> Option<usize> {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return None;
    }
    let mut u = sampler.next_uniform() * total;
    let mut last = None;
    for (idx, &weight) in weights.iter().enumerate() {
        if weight <= 0.0 {
            continue;
        }
        if u < weight {
            return Some(idx);
        }
        u -= weight;
        last = Some(idx);
    }
    last
}

/// Value for interval `idx` of a piecewise-constant schedule.
fn piecewise(values: &[f64], idx: usize) -> f64 {
    values[idx.min(values.len() - 1)]
}

/// Reaction firing at a mass-action rate that changes at fixed times.
#[derive(Debug, Clone)]
pub struct ContinuousReaction {
    stoich: Stoichiometry,
    rates: Vec<f64>,
    change_times: Vec<f64>,
    interval: usize,
    propensity: f64,
}

impl ContinuousReaction {
    pub fn new(stoich: Stoichiometry, rates: Vec<f64>, change_times: Vec<f64>) -> Result<Self> {
        if rates.len() != change_times.len() + 1 {
            bail!(
                "expected {} rates for {} change times, but got {}",
                change_times.len() + 1,
                change_times.len(),
                rates.len()
            );
        }
        Ok(Self {
            stoich,
            rates,
            change_times,
            interval: 0,
            propensity: 0.0,
        })
    }
}

impl ReactionBox for ContinuousReaction {
    fn kind(&self) -> ReactionKind {
        if self.stoich.is_migration() {
            ReactionKind::Migration
        } else {
            ReactionKind::Continuous
        }
    }

    fn produces_samples(&self) -> bool {
        self.stoich.produces_samples()
    }

    fn update_propensity(&mut self, state: &State) -> f64 {
        self.propensity = piecewise(&self.rates, self.interval) * self.stoich.combinations(state);
        self.propensity
    }

    fn current_propensity(&self) -> f64 {
        self.propensity
    }

    fn increment_state(&self, state: &mut State, k: f64) {
        self.stoich.apply(state, k);
    }

    fn interval_end_time(&self) -> f64 {
        self.change_times
            .get(self.interval)
            .copied()
            .unwrap_or(f64::INFINITY)
    }

    fn increment_interval(&mut self) {
        self.interval += 1;
    }

    fn reset_interval(&mut self) {
        self.interval = 0;
    }

    fn max_react_count(&self, state: &State) -> f64 {
        self.stoich.max_react_count(state)
    }

    fn lineage_inclusion_probability(&self, lineages: &LineageMap, state: &State) -> f64 {
        self.stoich.inclusion_probability(lineages, state)
    }

    fn increment_lineages(
        &self,
        lineages: &mut LineageMap,
        time: f64,
        factory: &mut LineageFactory,
        state: &State,
        sampler: &mut Sampler,
        aggregated: bool,
    ) {
        self.stoich
            .increment_lineages(lineages, time, factory, state, sampler, aggregated);
    }
}

/// Amount fired by a punctual reaction at each scheduled time.
#[derive(Debug, Clone, PartialEq)]
pub enum PunctualAmount {
    /// Each available reactant combination fires independently with this probability.
    Probability(Vec<f64>),
    /// Exactly this many firings; infeasible if the reactants do not allow it.
    Count(Vec<f64>),
}

/// Reaction firing deterministically at scheduled times.
#[derive(Debug, Clone)]
pub struct PunctualReaction {
    stoich: Stoichiometry,
    times: Vec<f64>,
    amount: PunctualAmount,
    interval: usize,
}

impl PunctualReaction {
    pub fn new(stoich: Stoichiometry, times: Vec<f64>, amount: PunctualAmount) -> Result<Self> {
        let values = match &amount {
            PunctualAmount::Probability(probs) => {
                if probs.iter().any(|p| !(0.0..=1.0).contains(p)) {
                    bail!("probabilities must lie in [0, 1]");
                }
                if stoich.reactant_counts.is_empty() {
                    bail!("probability-based punctual reactions need reactants");
                }
                probs
            }
            PunctualAmount::Count(counts) => {
                if counts.iter().any(|&n| n < 0.0 || n.fract() != 0.0) {
                    bail!("counts must be non-negative integers");
                }
                counts
            }
        };
        if values.len() != 1 && values.len() != times.len() {
            bail!("expected 1 or {} values, but got {}", times.len(), values.len());
        }
        Ok(Self {
            stoich,
            times,
            amount,
            interval: 0,
        })
    }
}

impl ReactionBox for PunctualReaction {
    fn kind(&self) -> ReactionKind {
        ReactionKind::Punctual
    }

    fn produces_samples(&self) -> bool {
        self.stoich.produces_samples()
    }

    fn implement_event(&mut self, state: &mut State, sampler: &mut Sampler) -> Option<f64> {
        let max_count = self.stoich.max_react_count(state);
        let multiplicity = match &self.amount {
            PunctualAmount::Probability(probs) => {
                let dist = Binomial::new(max_count as u64, piecewise(probs, self.interval)).ok()?;
                dist.sample(sampler.rng()) as f64
            }
            PunctualAmount::Count(counts) => {
                let count = piecewise(counts, self.interval);
                if count > max_count {
                    return None;
                }
                count
            }
        };
        self.stoich.apply(state, multiplicity);
        Some(multiplicity)
    }

    fn increment_state(&self, state: &mut State, k: f64) {
        self.stoich.apply(state, k);
    }

    fn interval_end_time(&self) -> f64 {
        self.times.get(self.interval).copied().unwrap_or(f64::INFINITY)
    }

    fn increment_interval(&mut self) {
        self.interval += 1;
    }

    fn reset_interval(&mut self) {
        self.interval = 0;
    }

    fn max_react_count(&self, state: &State) -> f64 {
        self.stoich.max_react_count(state)
    }

    fn lineage_inclusion_probability(&self, lineages: &LineageMap, state: &State) -> f64 {
        self.stoich.inclusion_probability(lineages, state)
    }

    fn increment_lineages(
        &self,
        lineages: &mut LineageMap,
        time: f64,
        factory: &mut LineageFactory,
        state: &State,
        sampler: &mut Sampler,
        aggregated: bool,
    ) {
        self.stoich
            .increment_lineages(lineages, time, factory, state, sampler, aggregated);
    }
}

/// Build every reaction box described by `model`.
///
/// Continuous reactions come first, in configuration order, followed by the
/// punctual ones.
pub fn build_reactions(model: &ModelConfig, state: &State) -> Result<Vec<Box<dyn ReactionBox>>> {
    let mut boxes: Vec<Box<dyn ReactionBox>> = Vec::new();

    for (idx, reaction) in model.reactions.iter().enumerate() {
        let stoich = build_stoichiometry(&reaction.reactants, &reaction.products, state)
            .with_context(|| format!("invalid reaction {idx}"))?;
        let reaction =
            ContinuousReaction::new(stoich, reaction.rates.clone(), reaction.change_times.clone())
                .with_context(|| format!("invalid reaction {idx}"))?;
        boxes.push(Box::new(reaction));
    }

    for (idx, reaction) in model.punctual.iter().enumerate() {
        let stoich = build_stoichiometry(&reaction.reactants, &reaction.products, state)
            .with_context(|| format!("invalid punctual reaction {idx}"))?;
        let amount = match (&reaction.probs, &reaction.counts) {
            (Some(probs), None) => PunctualAmount::Probability(probs.clone()),
            (None, Some(counts)) => PunctualAmount::Count(counts.clone()),
            _ => bail!("punctual reaction {idx} needs exactly one of probs and counts"),
        };
        let reaction = PunctualReaction::new(stoich, reaction.times.clone(), amount)
            .with_context(|| format!("invalid punctual reaction {idx}"))?;
        boxes.push(Box::new(reaction));
    }

    Ok(boxes)
}

fn build_stoichiometry(
    reactants: &[String],
    products: &[ProductConfig],
    state: &State,
) -> Result<Stoichiometry> {
    let lookup = |name: &str| {
        state
            .index_of(name)
            .with_context(|| format!("unknown population {name:?}"))
    };
    let reactants = reactants
        .iter()
        .map(|name| lookup(name))
        .collect::<Result<Vec<_>>>()?;
    let products = products
        .iter()
        .map(|product| {
            Ok(ProductSlot {
                population: lookup(&product.population)?,
                parent: product.parent,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Stoichiometry::new(reactants, products, state)
}
