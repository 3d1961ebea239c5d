//! Tab-separated trajectory logs.

use crate::events::EventStore;
use crate::reaction::ReactionBox;
use crate::state::State;
use std::io::{self, Write};

/// Writes trajectory rows by replaying events against a private state copy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryLogger {
    log_interval: f64,
}

impl TrajectoryLogger {
    /// Log every event if `log_interval` is non-positive, otherwise on a fixed grid.
    pub fn new(log_interval: f64) -> Self {
        Self { log_interval }
    }

    pub fn write_header<W: Write>(&self, out: &mut W, state: &State) -> io::Result<()> {
        state.write_header(out)
    }

    pub fn write_trajectory<W: Write>(
        &self,
        out: &mut W,
        sample: u64,
        boxes: &[Box<dyn ReactionBox>],
        events: &EventStore,
        state: &State,
    ) -> io::Result<()> {
        let mut state = state.clone();
        state.reset_to_initial();
        state.write_row(out, sample, 0.0)?;

        if self.log_interval <= 0.0 {
            for event in events.iter() {
                apply(&mut state, boxes, event.reaction, event.multiplicity)?;
                state.write_row(out, sample, event.time)?;
            }
            return Ok(());
        }

        let mut next_log = self.log_interval;
        for event in events.iter() {
            while next_log < event.time {
                state.write_row(out, sample, next_log)?;
                next_log += self.log_interval;
            }
            apply(&mut state, boxes, event.reaction, event.multiplicity)?;
        }

        if let Some(last) = events.last() {
            if next_log <= last.time {
                state.write_row(out, sample, next_log)?;
            }
        }

        Ok(())
    }
}

fn apply(state: &mut State, boxes: &[Box<dyn ReactionBox>], reaction: usize, k: f64) -> io::Result<()> {
    let rb = boxes.get(reaction).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("event refers to unknown reaction box {reaction}"),
        )
    })?;
    rb.increment_state(state, k);
    Ok(())
}
