//! Append-only record of the reactions fired during a trajectory.

use crate::error::SimulationError;

const INITIAL_CAPACITY: usize = 1024;

/// `multiplicity` units of reaction `reaction` fired at `time`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub time: f64,
    pub reaction: usize,
    pub multiplicity: f64,
}

/// Time-ordered event buffer.
///
/// Capacity doubles on overflow. Rolling back to an earlier length keeps the
/// "contains samples" flag consistent with the retained prefix.
#[derive(Debug)]
pub struct EventStore {
    events: Vec<Event>,
    first_sample: Option<usize>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    pub fn new() -> Self {
        Self {
            events: Vec::with_capacity(INITIAL_CAPACITY),
            first_sample: None,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    /// True if any stored event comes from a sample-producing reaction.
    pub fn contains_samples(&self) -> bool {
        self.first_sample.is_some()
    }

    /// Record an event. Events with non-positive multiplicity are dropped.
    pub fn push(
        &mut self,
        time: f64,
        reaction: usize,
        multiplicity: f64,
        produces_samples: bool,
    ) -> Result<(), SimulationError> {
        if multiplicity <= 0.0 {
            return Ok(());
        }
        let len = self.events.len();
        if len == self.events.capacity() {
            self.events
                .try_reserve_exact(len.max(INITIAL_CAPACITY))
                .map_err(|_| SimulationError::EventStorageExhausted(len))?;
        }
        self.events.push(Event {
            time,
            reaction,
            multiplicity,
        });
        if produces_samples && self.first_sample.is_none() {
            self.first_sample = Some(len);
        }
        Ok(())
    }

    /// Drop every event recorded after the first `len`.
    pub fn truncate(&mut self, len: usize) {
        self.events.truncate(len);
        if self.first_sample.is_some_and(|idx| idx >= len) {
            self.first_sample = None;
        }
    }

    pub fn clear(&mut self) {
        self.truncate(0);
    }

    pub fn get(&self, idx: usize) -> Option<&Event> {
        self.events.get(idx)
    }

    pub fn last(&self) -> Option<&Event> {
        self.events.last()
    }

    /// Events in recording order; reverse with `.rev()`.
    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }
}
