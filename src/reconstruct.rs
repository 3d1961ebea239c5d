//! Reverse-time reconstruction of the genealogy behind a trajectory.

use crate::error::SimulationError;
use crate::events::EventStore;
use crate::genealogy::{Genealogy, LineageFactory};
use crate::reaction::{LineageMap, ReactionBox};
use crate::sampler::Sampler;
use crate::state::State;

/// Replay `events` backwards from the final state and build the tree.
///
/// Events with multiplicity one are instantiated individually. When
/// `aggregated` is set, events of higher multiplicity are thinned: the number
/// of firings touching a tracked lineage is drawn from a binomial with the
/// box's inclusion probability, and only those firings are instantiated.
/// Each firing is instantiated against the post-event state and then undone.
/// The remaining firings are undone in bulk, unless that would leave more
/// tracked lineages in a population than individuals; such firings are
/// instantiated as well.
pub fn reconstruct(
    boxes: &[Box<dyn ReactionBox>],
    events: &EventStore,
    final_state: &State,
    sampler: &mut Sampler,
    aggregated: bool,
) -> Result<Genealogy, SimulationError> {
    let mut state = final_state.clone();
    state.reset_to_final();

    let mut lineages = LineageMap::new(state.len());
    let mut factory = LineageFactory::new();

    for event in events.iter().rev() {
        let rb = boxes
            .get(event.reaction)
            .ok_or(SimulationError::UnknownReactionBox(event.reaction))?;
        let n = event.multiplicity.round();
        if n <= 0.0 {
            continue;
        }

        if !aggregated || n == 1.0 {
            for _ in 0..n as u64 {
                rb.increment_lineages(&mut lineages, event.time, &mut factory, &state, sampler, false);
                rb.increment_state(&mut state, -1.0);
            }
            continue;
        }

        let p = rb.lineage_inclusion_probability(&lineages, &state);
        let k = sampler.next_binomial(n, p);
        for _ in 0..k as u64 {
            // Picks are drawn from the products, so instantiate before the unit is undone.
            rb.increment_lineages(&mut lineages, event.time, &mut factory, &state, sampler, true);
            rb.increment_state(&mut state, -1.0);
        }

        let rest = n - k;
        if rest <= 0.0 {
            continue;
        }
        let snapshot = state.occupancies().to_vec();
        rb.increment_state(&mut state, -rest);
        if lineages.fits(&state) {
            continue;
        }

        // Tracked lineages outnumber their population: instantiate the firings
        // that cannot be undone without one.
        state.restore(&snapshot);
        for _ in 0..rest as u64 {
            rb.increment_state(&mut state, -1.0);
            if !lineages.fits(&state) {
                rb.increment_state(&mut state, 1.0);
                rb.increment_lineages(&mut lineages, event.time, &mut factory, &state, sampler, true);
                rb.increment_state(&mut state, -1.0);
            }
        }
    }

    match lineages.roots().as_slice() {
        [] => Err(SimulationError::NoLineages),
        &[root] => {
            factory.number_internals(root);
            factory.compute_ages_from_times(root);
            Ok(factory.into_genealogy(root))
        }
        roots => Err(SimulationError::MultipleLineages { count: roots.len() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ContinuousReaction, ProductSlot, PunctualAmount, PunctualReaction, Stoichiometry};
    use crate::engine::{Engine, Settings};
    use crate::genealogy::NodeId;
    use crate::condition::HasSamples;
    use crate::reaction::ReactionKind;
    use statrs::distribution::{Binomial, Discrete};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Records how the reconstruction drives it; creates no lineages.
    struct Probe {
        id: usize,
        inclusion: f64,
        lineage_calls: Rc<Cell<usize>>,
        visits: Rc<RefCell<Vec<(usize, f64)>>>,
        undone: Rc<RefCell<Vec<(usize, f64)>>>,
    }

    impl Probe {
        fn new(id: usize, inclusion: f64) -> Self {
            Self {
                id,
                inclusion,
                lineage_calls: Rc::new(Cell::new(0)),
                visits: Rc::new(RefCell::new(Vec::new())),
                undone: Rc::new(RefCell::new(Vec::new())),
            }
        }
    }

    impl ReactionBox for Probe {
        fn kind(&self) -> ReactionKind {
            ReactionKind::Continuous
        }

        fn produces_samples(&self) -> bool {
            true
        }

        fn increment_state(&self, _state: &mut State, k: f64) {
            self.undone.borrow_mut().push((self.id, -k));
        }

        fn interval_end_time(&self) -> f64 {
            f64::INFINITY
        }

        fn increment_interval(&mut self) {}

        fn reset_interval(&mut self) {}

        fn max_react_count(&self, _state: &State) -> f64 {
            f64::INFINITY
        }

        fn lineage_inclusion_probability(&self, _lineages: &LineageMap, _state: &State) -> f64 {
            self.inclusion
        }

        fn increment_lineages(
            &self,
            _lineages: &mut LineageMap,
            time: f64,
            _factory: &mut LineageFactory,
            _state: &State,
            _sampler: &mut Sampler,
            _aggregated: bool,
        ) {
            self.lineage_calls.set(self.lineage_calls.get() + 1);
            self.visits.borrow_mut().push((self.id, time));
        }
    }

    fn slot(population: usize, parent: Option<usize>) -> ProductSlot {
        ProductSlot { population, parent }
    }

    #[test]
    fn thinning_is_binomial() {
        let probe = Probe::new(0, 0.3);
        let calls = Rc::clone(&probe.lineage_calls);
        let boxes: Vec<Box<dyn ReactionBox>> = vec![Box::new(probe)];
        let state = State::new([("X", 0.0, false)]);
        let mut events = EventStore::new();
        events.push(1.0, 0, 10.0, true).unwrap();

        let n_reps = 10_000;
        let mut hist = [0usize; 11];
        let mut sampler = Sampler::from_seed(31);
        for _ in 0..n_reps {
            calls.set(0);
            let err = reconstruct(&boxes, &events, &state, &mut sampler, true).unwrap_err();
            assert_eq!(err, SimulationError::NoLineages);
            hist[calls.get()] += 1;
        }

        let binomial = Binomial::new(0.3, 10).unwrap();
        for (k, &count) in hist.iter().enumerate() {
            let expected = binomial.pmf(k as u64);
            let freq = count as f64 / n_reps as f64;
            let tol = 4.0 * (expected * (1.0 - expected) / n_reps as f64).sqrt() + 1e-3;
            assert!((freq - expected).abs() < tol, "k = {k}: {freq} vs {expected}");
        }
    }

    #[test]
    fn exact_replay_itemizes_events() {
        let probe = Probe::new(0, 0.3);
        let calls = Rc::clone(&probe.lineage_calls);
        let boxes: Vec<Box<dyn ReactionBox>> = vec![Box::new(probe)];
        let state = State::new([("X", 0.0, false)]);
        let mut events = EventStore::new();
        events.push(1.0, 0, 4.0, true).unwrap();

        let mut sampler = Sampler::from_seed(32);
        let _ = reconstruct(&boxes, &events, &state, &mut sampler, false);
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn events_are_consumed_in_reverse() {
        let first = Probe::new(0, 1.0);
        let visits = Rc::clone(&first.visits);
        let undone = Rc::clone(&first.undone);
        let second = Probe {
            visits: Rc::clone(&first.visits),
            undone: Rc::clone(&first.undone),
            ..Probe::new(1, 1.0)
        };
        let boxes: Vec<Box<dyn ReactionBox>> = vec![Box::new(first), Box::new(second)];
        let state = State::new([("X", 0.0, false)]);

        let mut events = EventStore::new();
        events.push(0.5, 0, 3.0, true).unwrap();
        events.push(1.5, 1, 1.0, true).unwrap();
        events.push(2.5, 0, 2.0, true).unwrap();

        let mut sampler = Sampler::from_seed(33);
        let _ = reconstruct(&boxes, &events, &state, &mut sampler, true);
        assert_eq!(
            *visits.borrow(),
            vec![(0, 2.5), (0, 2.5), (1, 1.5), (0, 0.5), (0, 0.5), (0, 0.5)]
        );
        // Every instantiated firing is undone before the next one is drawn.
        assert_eq!(undone.borrow().len(), 6);
        assert!(undone.borrow().iter().all(|&(_, k)| k == 1.0));
    }

    #[test]
    fn untouched_firings_are_undone_together() {
        let probe = Probe::new(0, 0.0);
        let calls = Rc::clone(&probe.lineage_calls);
        let undone = Rc::clone(&probe.undone);
        let boxes: Vec<Box<dyn ReactionBox>> = vec![Box::new(probe)];
        let state = State::new([("X", 0.0, false)]);
        let mut events = EventStore::new();
        events.push(1.0, 0, 3.0, true).unwrap();

        let mut sampler = Sampler::from_seed(36);
        let _ = reconstruct(&boxes, &events, &state, &mut sampler, true);
        assert_eq!(calls.get(), 0);
        assert_eq!(*undone.borrow(), vec![(0, 3.0)]);
    }

    #[test]
    fn aggregated_moves_never_strand_lineages() {
        // Forward: X -> 2X twice, all three X move to Y, two Y are sampled.
        let state = State::new([("X", 0.0, false), ("Y", 1.0, false), ("S", 2.0, true)]);
        let reaction = |reactants: Vec<usize>, products: Vec<ProductSlot>| {
            let stoich = Stoichiometry::new(reactants, products, &state).unwrap();
            Box::new(ContinuousReaction::new(stoich, vec![1.0], vec![]).unwrap()) as Box<dyn ReactionBox>
        };
        let boxes = vec![
            reaction(vec![0], vec![slot(0, Some(0)), slot(0, Some(0))]),
            reaction(vec![0], vec![slot(1, Some(0))]),
            reaction(vec![1], vec![slot(2, Some(0))]),
        ];
        let mut events = EventStore::new();
        events.push(1.0, 0, 2.0, false).unwrap();
        events.push(2.0, 1, 3.0, false).unwrap();
        events.push(3.0, 2, 2.0, true).unwrap();

        for seed in 0..50 {
            let mut sampler = Sampler::from_seed(seed);
            let tree = reconstruct(&boxes, &events, &state, &mut sampler, true).unwrap();
            assert_eq!(tree.leaf_count(), 2);
            assert_eq!(tree.root().population, 0);
            assert_eq!(tree.root().time, 1.0);
            assert_consistent(&tree);
        }
    }

    #[test]
    fn unknown_box_is_reported() {
        let boxes: Vec<Box<dyn ReactionBox>> = vec![Box::new(Probe::new(0, 1.0))];
        let state = State::new([("X", 0.0, false)]);
        let mut events = EventStore::new();
        events.push(1.0, 3, 1.0, true).unwrap();

        let mut sampler = Sampler::from_seed(34);
        let err = reconstruct(&boxes, &events, &state, &mut sampler, false).unwrap_err();
        assert_eq!(err, SimulationError::UnknownReactionBox(3));
        assert!(err.is_internal());
    }

    fn sampling_engine(initial: f64, count: f64) -> Engine {
        let state = State::new([("X", initial, false), ("S", 0.0, true)]);
        let stoich = Stoichiometry::new(vec![0], vec![slot(1, Some(0))], &state).unwrap();
        let sampling =
            PunctualReaction::new(stoich, vec![1.0], PunctualAmount::Count(vec![count])).unwrap();
        let settings = Settings {
            max_time: 2.0,
            ..Settings::default()
        };
        Engine::new(settings, state, vec![Box::new(sampling)], Sampler::from_seed(35))
    }

    #[test]
    fn single_sample_gives_single_leaf() {
        let mut engine = sampling_engine(1.0, 1.0);
        engine.simulate().unwrap();
        assert_eq!(engine.event_count(), 1);

        let tree = engine.simulate_tree().unwrap();
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.internal_count(), 0);
        assert_eq!(tree.root().population, 0);
        assert_eq!(tree.root().time, 1.0);
        assert_eq!(tree.height(), 0.0);
    }

    #[test]
    fn disconnected_samples_are_reported() {
        let mut engine = sampling_engine(2.0, 2.0);
        engine.simulate().unwrap();
        assert_eq!(
            engine.simulate_tree().unwrap_err(),
            SimulationError::MultipleLineages { count: 2 }
        );
    }

    #[test]
    fn trajectory_without_samples() {
        let mut engine = sampling_engine(2.0, 0.0);
        engine.simulate().unwrap();
        assert_eq!(engine.simulate_tree().unwrap_err(), SimulationError::NoSamples);
    }

    #[test]
    fn rejected_trajectory_is_refused() {
        let mut engine = sampling_engine(2.0, 1.0).with_accept_condition(Box::new(
            crate::condition::Threshold {
                name: "X".to_string(),
                population: 0,
                op: crate::condition::Comparison::Gt,
                value: 5.0,
            },
        ));
        assert!(engine.simulate().is_err());
        assert_eq!(engine.simulate_tree().unwrap_err(), SimulationError::InvalidTrajectory);
    }

    fn birth_death_sampling(settings: Settings, seed: u64) -> Engine {
        let state = State::new([("I", 1.0, false), ("S", 0.0, true)]);
        let reaction = |reactants: Vec<usize>, products: Vec<ProductSlot>, rate: f64| {
            let stoich = Stoichiometry::new(reactants, products, &state).unwrap();
            Box::new(ContinuousReaction::new(stoich, vec![rate], vec![]).unwrap()) as Box<dyn ReactionBox>
        };
        let boxes = vec![
            reaction(vec![0], vec![slot(0, Some(0)), slot(0, Some(0))], 1.0),
            reaction(vec![0], vec![], 0.2),
            reaction(vec![0], vec![slot(1, Some(0))], 0.3),
        ];
        Engine::new(settings, state, boxes, Sampler::from_seed(seed))
            .with_accept_condition(Box::new(HasSamples))
    }

    fn assert_consistent(tree: &Genealogy) {
        let order = tree.postorder();
        let root: NodeId = tree.root_id();
        assert_eq!(order.last(), Some(&root));
        for &id in &order {
            let node = tree.node(id);
            assert!(node.age >= 0.0);
            for &child in &node.children {
                assert_eq!(tree.node(child).parent, Some(id));
                assert!(tree.node(child).time >= node.time);
            }
        }
        let mut numbers: Vec<usize> = order.iter().map(|&id| tree.node(id).number).collect();
        numbers.sort();
        assert_eq!(numbers, (0..order.len()).collect::<Vec<_>>());
    }

    #[test]
    fn exact_birth_death_tree_is_binary() {
        for seed in 0..10 {
            let settings = Settings {
                max_time: 4.0,
                ..Settings::default()
            };
            let mut engine = birth_death_sampling(settings, seed);
            engine.simulate().unwrap();
            let n_samples = engine
                .events()
                .iter()
                .filter(|event| event.reaction == 2)
                .count();

            let tree = engine.simulate_tree().unwrap();
            assert_eq!(tree.leaf_count(), n_samples);
            assert_eq!(tree.internal_count(), n_samples - 1);
            assert_consistent(&tree);

            let reduced = tree.singleton_free();
            assert_eq!(reduced.leaf_count(), n_samples);
            assert_consistent(&reduced);
        }
    }

    #[test]
    fn aggregated_tree_keeps_every_sample() {
        for seed in 0..10 {
            let settings = Settings {
                max_time: 4.0,
                tau_leaping_interval: 0.05,
                ..Settings::default()
            };
            let mut engine = birth_death_sampling(settings, seed);
            engine.simulate().unwrap();
            let n_samples: f64 = engine
                .events()
                .iter()
                .filter(|event| event.reaction == 2)
                .map(|event| event.multiplicity)
                .sum();

            let tree = engine.simulate_tree().unwrap();
            assert_eq!(tree.leaf_count() as f64, n_samples);
            assert_consistent(&tree);
        }
    }

    #[test]
    fn aggregated_trees_have_single_root() {
        for seed in 0..200 {
            let settings = Settings {
                max_time: 5.0,
                tau_leaping_interval: 0.05,
                ..Settings::default()
            };
            let mut engine = birth_death_sampling(settings, seed);
            engine.simulate().unwrap();
            let tree = engine
                .simulate_tree()
                .unwrap_or_else(|err| panic!("seed {seed}: {err}"));
            assert_eq!(tree.root().population, 0);
        }
    }
}
