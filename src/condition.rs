//! Termination and acceptance predicates over a trajectory.

use crate::config::ConditionConfig;
use crate::events::EventStore;
use crate::state::State;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt::Debug;

/// Boolean condition evaluated against the current state and events.
pub trait Condition: Debug {
    fn is_met(&self, state: &State, events: &EventStore) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Comparison {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
}

impl Comparison {
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Eq => lhs == rhs,
            Self::Ge => lhs >= rhs,
            Self::Gt => lhs > rhs,
        }
    }
}

/// Compares the occupancy of one population against a constant.
#[derive(Debug, Clone)]
pub struct Threshold {
    pub name: String,
    pub population: usize,
    pub op: Comparison,
    pub value: f64,
}

impl Condition for Threshold {
    fn is_met(&self, state: &State, _events: &EventStore) -> bool {
        self.op.holds(state.get(self.population), self.value)
    }
}

/// Met when the event store holds at least one sample-producing event.
#[derive(Debug, Clone, Copy)]
pub struct HasSamples;

impl Condition for HasSamples {
    fn is_met(&self, _state: &State, events: &EventStore) -> bool {
        events.contains_samples()
    }
}

/// Met when every inner condition is met.
#[derive(Debug)]
pub struct AllOf(pub Vec<Box<dyn Condition>>);

impl Condition for AllOf {
    fn is_met(&self, state: &State, events: &EventStore) -> bool {
        self.0.iter().all(|cond| cond.is_met(state, events))
    }
}

/// Resolve configured thresholds against population names.
///
/// Returns `None` for an empty list, which disables the check.
pub fn build_condition(
    configs: &[ConditionConfig],
    state: &State,
) -> Result<Option<Box<dyn Condition>>> {
    let mut conds: Vec<Box<dyn Condition>> = Vec::with_capacity(configs.len());
    for cfg in configs {
        let population = state
            .index_of(&cfg.population)
            .with_context(|| format!("unknown population {:?}", cfg.population))?;
        conds.push(Box::new(Threshold {
            name: cfg.population.clone(),
            population,
            op: cfg.op,
            value: cfg.value,
        }));
    }
    Ok(match conds.len() {
        0 => None,
        1 => conds.pop(),
        _ => Some(Box::new(AllOf(conds))),
    })
}
