use crate::catalog::build_reactions;
use crate::condition::{AllOf, Condition, HasSamples, build_condition};
use crate::config::Config;
use crate::error::SimulationError;
use crate::events::EventStore;
use crate::genealogy::Genealogy;
use crate::logger::TrajectoryLogger;
use crate::reaction::{ReactionBox, ReactionKind};
use crate::reconstruct::reconstruct;
use crate::sampler::Sampler;
use crate::state::State;
use anyhow::{Context, Result};
use std::io::{self, Write};

/// Boundaries closer than this to the current time are crossed immediately.
const TIME_EPSILON: f64 = 1e-12;

/// Number of times a leap is halved before the attempt is rejected.
const MAX_LEAP_RETRIES: usize = 10;

/// Simulation parameters of an [`Engine`].
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub max_time: f64,
    pub max_retries: usize,
    pub tau_leaping_interval: f64,
    pub tau_leaping_threshold: f64,
    pub threshold_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_time: f64::INFINITY,
            max_retries: 100,
            tau_leaping_interval: -1.0,
            tau_leaping_threshold: -1.0,
            threshold_prefix: "V_".to_string(),
        }
    }
}

/// Why a single attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    AcceptanceUnmet,
    InfeasibleEvent,
    LeapRetriesExhausted,
}

/// Outcome of one full trajectory attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Accepted,
    Rejected(Rejection),
}

/// State of the retry driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting { retries_left: usize },
    Accepted,
    RejectedRetryable { retries_left: usize },
    RejectedFinal,
}

impl RetryState {
    /// Transition after an attempt made with `retries_left` retries remaining.
    pub fn next(attempt: Attempt, retries_left: usize) -> Self {
        match attempt {
            Attempt::Accepted => Self::Accepted,
            Attempt::Rejected(_) if retries_left > 0 => Self::RejectedRetryable {
                retries_left: retries_left - 1,
            },
            Attempt::Rejected(_) => Self::RejectedFinal,
        }
    }
}

enum Leap {
    Advanced(f64),
    Skipped,
    Exhausted,
    Rejected,
}

/// Simulation engine.
///
/// Owns the state, the reaction boxes, the event store and the random
/// number generator of one trajectory.
pub struct Engine {
    settings: Settings,
    state: State,
    boxes: Vec<Box<dyn ReactionBox>>,
    continuous: Vec<usize>,
    events: EventStore,
    sampler: Sampler,
    end_condition: Option<Box<dyn Condition>>,
    accept_condition: Option<Box<dyn Condition>>,
    valid: bool,
}

impl Engine {
    pub fn new(
        settings: Settings,
        state: State,
        boxes: Vec<Box<dyn ReactionBox>>,
        sampler: Sampler,
    ) -> Self {
        let continuous = boxes
            .iter()
            .enumerate()
            .filter(|(_, rb)| rb.kind().is_continuous())
            .map(|(idx, _)| idx)
            .collect();
        Self {
            settings,
            state,
            boxes,
            continuous,
            events: EventStore::new(),
            sampler,
            end_condition: None,
            accept_condition: None,
            valid: false,
        }
    }

    /// Build an engine for the model described by `cfg`.
    pub fn from_config(cfg: &Config, sampler: Sampler) -> Result<Self> {
        let state = State::new(
            cfg.model
                .populations
                .iter()
                .map(|pop| (pop.name.clone(), pop.initial, pop.sample)),
        );
        let boxes = build_reactions(&cfg.model, &state).context("failed to build reactions")?;

        let sim = &cfg.simulation;
        let end_condition =
            build_condition(&sim.end_when, &state).context("failed to build end condition")?;
        let mut accept_condition =
            build_condition(&sim.must_have, &state).context("failed to build accept condition")?;
        if sim.require_samples {
            accept_condition = Some(match accept_condition {
                None => Box::new(HasSamples),
                Some(cond) => Box::new(AllOf(vec![cond, Box::new(HasSamples)])),
            });
        }

        let settings = Settings {
            max_time: sim.max_time,
            max_retries: sim.max_retries,
            tau_leaping_interval: sim.tau_leaping_interval,
            tau_leaping_threshold: sim.tau_leaping_threshold,
            threshold_prefix: sim.threshold_prefix.clone(),
        };

        let mut engine = Self::new(settings, state, boxes, sampler);
        engine.end_condition = end_condition;
        engine.accept_condition = accept_condition;
        Ok(engine)
    }

    pub fn with_end_condition(mut self, cond: Box<dyn Condition>) -> Self {
        self.end_condition = Some(cond);
        self
    }

    pub fn with_accept_condition(mut self, cond: Box<dyn Condition>) -> Self {
        self.accept_condition = Some(cond);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn boxes(&self) -> &[Box<dyn ReactionBox>] {
        &self.boxes
    }

    /// Whether the last simulation ended with an accepted trajectory.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn uses_tau_leaping(&self) -> bool {
        self.settings.tau_leaping_interval > 0.0
    }

    /// Simulate trajectories until one is accepted or the retry budget is spent.
    pub fn simulate(&mut self) -> Result<(), SimulationError> {
        self.valid = false;
        let mut retry = RetryState::Attempting {
            retries_left: self.settings.max_retries,
        };
        loop {
            retry = match retry {
                RetryState::Attempting { retries_left } => {
                    let attempt = self.attempt()?;
                    RetryState::next(attempt, retries_left)
                }
                RetryState::RejectedRetryable { retries_left } => {
                    log::info!("trajectory simulation rejected: retrying");
                    RetryState::Attempting { retries_left }
                }
                RetryState::Accepted => {
                    self.valid = true;
                    return Ok(());
                }
                RetryState::RejectedFinal => {
                    let err = SimulationError::RetriesExhausted {
                        max_retries: self.settings.max_retries,
                    };
                    log::error!("{err}");
                    return Err(err);
                }
            };
        }
    }

    /// Run a single trajectory attempt in the configured mode.
    pub fn attempt(&mut self) -> Result<Attempt, SimulationError> {
        if self.uses_tau_leaping() {
            self.simulate_hybrid(
                self.settings.tau_leaping_interval,
                self.settings.tau_leaping_threshold,
            )
        } else {
            self.simulate_exact()
        }
    }

    /// Reconstruct the genealogy implied by the accepted trajectory.
    pub fn simulate_tree(&mut self) -> Result<Genealogy, SimulationError> {
        if !self.events.contains_samples() {
            return Err(SimulationError::NoSamples);
        }
        if !self.valid {
            return Err(SimulationError::InvalidTrajectory);
        }
        let aggregated = self.uses_tau_leaping();
        reconstruct(
            &self.boxes,
            &self.events,
            &self.state,
            &mut self.sampler,
            aggregated,
        )
    }

    /// Write the log rows of the current trajectory.
    pub fn write_log<W: Write>(
        &self,
        out: &mut W,
        logger: &TrajectoryLogger,
        sample: u64,
    ) -> io::Result<()> {
        logger.write_trajectory(out, sample, &self.boxes, &self.events, &self.state)
    }

    fn simulate_exact(&mut self) -> Result<Attempt, SimulationError> {
        let mut schedule = self.reset();
        let max_time = self.settings.max_time;
        let mut t = 0.0;

        loop {
            let a0 = self.update_propensities();
            let delta = if a0 == 0.0 {
                f64::INFINITY
            } else {
                self.sampler.next_exponential(a0)
            };
            t += delta;

            let next = self.next_boundary(&schedule);
            let boundary = next.map_or(f64::INFINITY, |(_, time)| time);
            if max_time < boundary {
                if t > max_time {
                    break;
                }
            } else if t > boundary {
                t = boundary;
                if let Some((idx, _)) = next {
                    if let Some(rejection) = self.cross_boundary(idx, t, &mut schedule)? {
                        return Ok(Attempt::Rejected(rejection));
                    }
                }
                continue;
            }

            if delta == f64::INFINITY {
                break;
            }

            let idx = self.select(a0, ReactionKind::is_continuous)?;
            self.fire(t, idx, 1.0)?;

            if self.end_condition_met() {
                break;
            }
        }

        Ok(self.finish())
    }

    fn simulate_hybrid(&mut self, tau: f64, threshold: f64) -> Result<Attempt, SimulationError> {
        let mut schedule = self.reset();
        let max_time = self.settings.max_time;
        let mut t = 0.0;

        loop {
            let next = self.next_boundary(&schedule);
            let next_change = next.map_or(f64::INFINITY, |(_, time)| time);
            if let Some((idx, boundary)) = next {
                if boundary <= t + TIME_EPSILON {
                    if let Some(rejection) = self.cross_boundary(idx, t, &mut schedule)? {
                        return Ok(Attempt::Rejected(rejection));
                    }
                    continue;
                }
            }

            if t >= max_time {
                break;
            }

            let small = self.state.max_with_prefix(&self.settings.threshold_prefix) < threshold;
            if threshold > 0.0 && small {
                let a0 = self.update_propensities();
                let delta = if a0 == 0.0 {
                    f64::INFINITY
                } else {
                    self.sampler.next_exponential(a0)
                };
                let next_stop = next_change.min(max_time);
                if t + delta > next_stop {
                    t = next_stop;
                    if t >= max_time {
                        break;
                    }
                    continue;
                }
                if delta == f64::INFINITY {
                    break;
                }

                t += delta;
                let idx = self.select(a0, ReactionKind::is_continuous)?;
                self.fire(t, idx, 1.0)?;
            } else {
                match self.leap(t, tau, next_change, max_time)? {
                    Leap::Advanced(new_t) => t = new_t,
                    Leap::Skipped => continue,
                    Leap::Exhausted => break,
                    Leap::Rejected => return Ok(Attempt::Rejected(Rejection::LeapRetriesExhausted)),
                }
            }

            if self.end_condition_met() {
                break;
            }
        }

        Ok(self.finish())
    }

    /// Advance by one leap from `t`, or less if a boundary or a migration comes first.
    fn leap(
        &mut self,
        t: f64,
        tau: f64,
        next_change: f64,
        max_time: f64,
    ) -> Result<Leap, SimulationError> {
        let mut mig_sum = 0.0;
        let mut any_propensity = false;
        for &idx in &self.continuous {
            let rb = &mut self.boxes[idx];
            let a = rb.update_propensity(&self.state);
            if rb.kind() == ReactionKind::Migration {
                mig_sum += a;
            } else if a > 0.0 {
                any_propensity = true;
            }
        }

        // Migrations keep exact waiting times.
        let next_mig = if mig_sum == 0.0 {
            f64::INFINITY
        } else {
            self.sampler.next_exponential(mig_sum)
        };

        let mut dt = tau;
        let next_stop = next_change.min(max_time);
        if t + dt > next_stop {
            dt = next_stop - t;
        }
        if next_mig < dt {
            dt = next_mig;
        }
        if dt <= 0.0 {
            return Ok(Leap::Skipped);
        }

        let no_boundary = next_change.is_infinite() || next_change > max_time;
        if !any_propensity && no_boundary && next_mig == f64::INFINITY {
            return Ok(Leap::Exhausted);
        }

        let snapshot = self.state.occupancies().to_vec();
        let events_len = self.events.len();
        let mut counts = vec![0.0; self.continuous.len()];

        for _ in 0..=MAX_LEAP_RETRIES {
            for (pos, &idx) in self.continuous.iter().enumerate() {
                let rb = &self.boxes[idx];
                let lambda = rb.current_propensity() * dt;
                counts[pos] = if rb.kind() == ReactionKind::Migration || lambda <= 0.0 {
                    0.0
                } else {
                    self.sampler
                        .next_poisson(lambda)
                        .min(rb.max_react_count(&self.state))
                };
            }

            for pos in 0..self.continuous.len() {
                if counts[pos] > 0.0 {
                    self.fire(t + dt, self.continuous[pos], counts[pos])?;
                }
            }

            if self.state.is_valid() {
                let t = t + dt;
                if (dt - next_mig).abs() < TIME_EPSILON && mig_sum > 0.0 {
                    let idx = self.select(mig_sum, |kind| kind == ReactionKind::Migration)?;
                    // The leap may have consumed the migrating individual.
                    if self.boxes[idx].max_react_count(&self.state) >= 1.0 {
                        self.fire(t, idx, 1.0)?;
                    }
                }
                return Ok(Leap::Advanced(t));
            }

            self.state.restore(&snapshot);
            self.events.truncate(events_len);
            dt *= 0.5;
            log::debug!("leap produced negative occupancy: retrying with dt = {dt}");
        }

        Ok(Leap::Rejected)
    }

    fn reset(&mut self) -> Vec<usize> {
        self.state.reset_to_initial();
        self.events.clear();
        for rb in &mut self.boxes {
            rb.reset_interval();
        }
        let mut schedule: Vec<usize> = (0..self.boxes.len()).collect();
        self.sort_schedule(&mut schedule);
        schedule
    }

    fn sort_schedule(&self, schedule: &mut [usize]) {
        schedule.sort_by(|&a, &b| {
            self.boxes[a]
                .interval_end_time()
                .total_cmp(&self.boxes[b].interval_end_time())
        });
    }

    fn next_boundary(&self, schedule: &[usize]) -> Option<(usize, f64)> {
        schedule
            .first()
            .map(|&idx| (idx, self.boxes[idx].interval_end_time()))
    }

    /// Fire the punctual event of box `idx` (if any) and move it to its next interval.
    fn cross_boundary(
        &mut self,
        idx: usize,
        t: f64,
        schedule: &mut [usize],
    ) -> Result<Option<Rejection>, SimulationError> {
        let rb = &mut self.boxes[idx];
        if rb.kind() == ReactionKind::Punctual {
            match rb.implement_event(&mut self.state, &mut self.sampler) {
                Some(multiplicity) => {
                    self.events
                        .push(t, idx, multiplicity, rb.produces_samples())?;
                }
                None => {
                    log::debug!("punctual event at t = {t} lacks reactants");
                    return Ok(Some(Rejection::InfeasibleEvent));
                }
            }
        }
        self.boxes[idx].increment_interval();
        self.sort_schedule(schedule);
        Ok(None)
    }

    fn update_propensities(&mut self) -> f64 {
        let mut a0 = 0.0;
        for &idx in &self.continuous {
            a0 += self.boxes[idx].update_propensity(&self.state);
        }
        a0
    }

    /// Pick a continuous box with probability proportional to its propensity.
    fn select<F>(&mut self, total: f64, filter: F) -> Result<usize, SimulationError>
    where
        F: Fn(ReactionKind) -> bool,
    {
        let mut u = self.sampler.next_uniform() * total;
        for &idx in &self.continuous {
            let rb = &self.boxes[idx];
            if !filter(rb.kind()) {
                continue;
            }
            let a = rb.current_propensity();
            if u < a {
                return Ok(idx);
            }
            u -= a;
        }
        Err(SimulationError::SelectionFellThrough)
    }

    fn fire(&mut self, t: f64, idx: usize, k: f64) -> Result<(), SimulationError> {
        let rb = self
            .boxes
            .get(idx)
            .ok_or(SimulationError::UnknownReactionBox(idx))?;
        self.events.push(t, idx, k, rb.produces_samples())?;
        rb.increment_state(&mut self.state, k);
        Ok(())
    }

    fn end_condition_met(&self) -> bool {
        match &self.end_condition {
            Some(cond) if cond.is_met(&self.state, &self.events) => {
                log::info!("trajectory termination condition met: {cond:?}");
                true
            }
            _ => false,
        }
    }

    fn finish(&mut self) -> Attempt {
        if let Some(cond) = &self.accept_condition {
            if !cond.is_met(&self.state, &self.events) {
                log::info!("trajectory acceptance condition not met: {cond:?}");
                return Attempt::Rejected(Rejection::AcceptanceUnmet);
            }
        }
        self.state.set_final();
        Attempt::Accepted
    }
}
