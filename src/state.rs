//! Population occupancies of a trajectory.

use std::{
    collections::HashMap,
    io::{self, Write},
};

/// Population occupancies stored as a flat vector with a name lookup.
///
/// Keeps snapshots of the initial and final occupancies so that the logger
/// and the reconstructor can replay events from either end.
#[derive(Debug, Clone)]
pub struct State {
    names: Vec<String>,
    is_sample: Vec<bool>,
    indices: HashMap<String, usize>,
    occupancies: Vec<f64>,
    initial: Vec<f64>,
    fin: Vec<f64>,
}

impl State {
    /// Create a state from `(name, initial occupancy, is sample population)` triples.
    pub fn new<I, S>(populations: I) -> Self
    where
        I: IntoIterator<Item = (S, f64, bool)>,
        S: Into<String>,
    {
        let mut names = Vec::new();
        let mut is_sample = Vec::new();
        let mut initial = Vec::new();
        for (name, init, sample) in populations {
            names.push(name.into());
            initial.push(init);
            is_sample.push(sample);
        }
        let indices = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();

        Self {
            names,
            is_sample,
            indices,
            occupancies: initial.clone(),
            fin: initial.clone(),
            initial,
        }
    }

    pub fn len(&self) -> usize {
        self.occupancies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupancies.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.indices.get(name).copied()
    }

    pub fn is_sample(&self, idx: usize) -> bool {
        self.is_sample[idx]
    }

    pub fn get(&self, idx: usize) -> f64 {
        self.occupancies[idx]
    }

    pub fn get_by_name(&self, name: &str) -> Option<f64> {
        self.index_of(name).map(|idx| self.occupancies[idx])
    }

    pub fn occupancies(&self) -> &[f64] {
        &self.occupancies
    }

    /// Add `delta` to the occupancy of population `idx`.
    pub fn add(&mut self, idx: usize, delta: f64) {
        self.occupancies[idx] += delta;
    }

    /// Overwrite all occupancies, e.g. to roll back a rejected leap.
    pub fn restore(&mut self, occupancies: &[f64]) {
        self.occupancies.copy_from_slice(occupancies);
    }

    pub fn reset_to_initial(&mut self) {
        self.occupancies.copy_from_slice(&self.initial);
    }

    /// Record the current occupancies as the final snapshot.
    pub fn set_final(&mut self) {
        self.fin.copy_from_slice(&self.occupancies);
    }

    pub fn reset_to_final(&mut self) {
        self.occupancies.copy_from_slice(&self.fin);
    }

    /// True when no occupancy is negative.
    pub fn is_valid(&self) -> bool {
        self.occupancies.iter().all(|&occ| occ >= 0.0)
    }

    /// Maximum occupancy among populations whose name starts with `prefix`.
    pub fn max_with_prefix(&self, prefix: &str) -> f64 {
        self.names
            .iter()
            .zip(&self.occupancies)
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(_, &occ)| occ)
            .fold(0.0, f64::max)
    }

    /// Write the tab-terminated column header of the trajectory log.
    pub fn write_header<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write!(out, "sample\tt\t")?;
        for name in &self.names {
            write!(out, "{name}\t")?;
        }
        writeln!(out)
    }

    /// Write one tab-terminated log row with the current occupancies.
    pub fn write_row<W: Write>(&self, out: &mut W, sample: u64, time: f64) -> io::Result<()> {
        write!(out, "{sample}\t{time}\t")?;
        for occ in &self.occupancies {
            write!(out, "{occ}\t")?;
        }
        writeln!(out)
    }
}
