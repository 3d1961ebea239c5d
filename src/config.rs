use crate::condition::Comparison;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{collections::HashSet, fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Simulation configuration parameters.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Populations and reactions.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct ModelConfig {
    pub populations: Vec<PopulationConfig>,
    #[serde(default)]
    pub reactions: Vec<ReactionConfig>,
    #[serde(default)]
    pub punctual: Vec<PunctualConfig>,
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct PopulationConfig {
    pub name: String,
    #[serde(default)]
    pub initial: f64,
    /// Individuals entering a sample population become tree leaves.
    #[serde(default)]
    pub sample: bool,
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct ProductConfig {
    pub population: String,
    /// Index of the reactant this product descends from.
    #[serde(default)]
    pub parent: Option<usize>,
}

/// Reaction firing at a piecewise-constant mass-action rate.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct ReactionConfig {
    #[serde(default)]
    pub reactants: Vec<String>,
    #[serde(default)]
    pub products: Vec<ProductConfig>,
    /// One rate per interval.
    pub rates: Vec<f64>,
    /// Ascending times at which the rate changes.
    #[serde(default)]
    pub change_times: Vec<f64>,
}

/// Reaction firing at fixed times.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct PunctualConfig {
    #[serde(default)]
    pub reactants: Vec<String>,
    #[serde(default)]
    pub products: Vec<ProductConfig>,
    pub times: Vec<f64>,
    #[serde(default)]
    pub probs: Option<Vec<f64>>,
    #[serde(default)]
    pub counts: Option<Vec<f64>>,
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct ConditionConfig {
    pub population: String,
    pub op: Comparison,
    pub value: f64,
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct SimulationConfig {
    /// Simulation horizon.
    pub max_time: f64,
    /// Number of retries after a rejected attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Fixed leap length; exact simulation if non-positive.
    #[serde(default = "default_disabled")]
    pub tau_leaping_interval: f64,
    /// Population threshold below which hybrid leaping simulates exactly.
    #[serde(default = "default_disabled")]
    pub tau_leaping_threshold: f64,
    /// Name prefix of the populations compared against the threshold.
    #[serde(default = "default_threshold_prefix")]
    pub threshold_prefix: String,
    /// Seed of the random number generator; OS entropy if absent.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Stop the trajectory once all of these hold.
    #[serde(default)]
    pub end_when: Vec<ConditionConfig>,
    /// Reject the trajectory unless all of these hold at the end.
    #[serde(default)]
    pub must_have: Vec<ConditionConfig>,
    /// Also reject trajectories without any sampling event.
    #[serde(default)]
    pub require_samples: bool,
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct OutputConfig {
    /// Time between log rows; every event is logged if non-positive.
    #[serde(default = "default_disabled")]
    pub log_interval: f64,
    /// Number of replicate trajectories per run.
    #[serde(default = "default_n_trajectories")]
    pub n_trajectories: usize,
    /// Reconstruct a tree from every accepted trajectory.
    #[serde(default = "default_simulate_tree")]
    pub simulate_tree: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_interval: default_disabled(),
            n_trajectories: default_n_trajectories(),
            simulate_tree: default_simulate_tree(),
        }
    }
}

fn default_max_retries() -> usize {
    100
}

fn default_disabled() -> f64 {
    -1.0
}

fn default_threshold_prefix() -> String {
    "V_".to_string()
}

fn default_n_trajectories() -> usize {
    1
}

fn default_simulate_tree() -> bool {
    true
}

impl Config {
    /// Load a [`Config`] from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents = fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::from_toml(&contents)
    }

    /// Parse and validate a [`Config`] from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.model.validate().context("invalid model")?;

        let sim = &self.simulation;
        check_num(sim.max_time, 0.0..=f64::INFINITY).context("invalid maximum time")?;
        if sim.max_time == 0.0 {
            bail!("maximum time must be positive");
        }
        check_num(sim.max_retries, 0..1_000_000).context("invalid maximum number of retries")?;
        check_finite(sim.tau_leaping_interval).context("invalid tau-leaping interval")?;
        check_finite(sim.tau_leaping_threshold).context("invalid tau-leaping threshold")?;

        let names: HashSet<_> = self.model.populations.iter().map(|pop| &pop.name).collect();
        for (idx, cond) in sim.end_when.iter().chain(&sim.must_have).enumerate() {
            if !names.contains(&cond.population) {
                bail!("condition {idx} refers to unknown population {:?}", cond.population);
            }
        }

        check_finite(self.output.log_interval).context("invalid log interval")?;
        check_num(self.output.n_trajectories, 1..100_000).context("invalid number of trajectories")?;

        Ok(())
    }
}

impl ModelConfig {
    fn validate(&self) -> Result<()> {
        check_num(self.populations.len(), 1..10_000).context("invalid number of populations")?;

        let mut names = HashSet::new();
        for pop in &self.populations {
            if !names.insert(pop.name.as_str()) {
                bail!("duplicate population {:?}", pop.name);
            }
            check_num(pop.initial, 0.0..f64::INFINITY)
                .with_context(|| format!("invalid initial occupancy of {:?}", pop.name))?;
        }

        for (idx, reaction) in self.reactions.iter().enumerate() {
            check_vec(&reaction.rates, 0.0..f64::INFINITY)
                .with_context(|| format!("invalid rates of reaction {idx}"))?;
            check_ascending(&reaction.change_times)
                .with_context(|| format!("invalid change times of reaction {idx}"))?;
        }

        for (idx, reaction) in self.punctual.iter().enumerate() {
            check_ascending(&reaction.times)
                .with_context(|| format!("invalid times of punctual reaction {idx}"))?;
            if let Some(probs) = &reaction.probs {
                check_vec(probs, 0.0..=1.0)
                    .with_context(|| format!("invalid probabilities of punctual reaction {idx}"))?;
            }
            if let Some(counts) = &reaction.counts {
                check_vec(counts, 0.0..f64::INFINITY)
                    .with_context(|| format!("invalid counts of punctual reaction {idx}"))?;
            }
        }

        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_finite(num: f64) -> Result<()> {
    if !num.is_finite() {
        bail!("number must be finite, but is {num}");
    }
    Ok(())
}

fn check_vec<R>(vec: &[f64], range: R) -> Result<()>
where
    R: RangeBounds<f64> + Debug,
{
    if vec.is_empty() {
        bail!("vector must not be empty");
    }
    for (idx, ele) in vec.iter().enumerate() {
        if !range.contains(ele) {
            bail!("element {idx} must be in the range {range:?}, but is {ele}");
        }
    }
    Ok(())
}

fn check_ascending(times: &[f64]) -> Result<()> {
    for &time in times {
        check_num(time, 0.0..f64::INFINITY)?;
    }
    if times.windows(2).any(|pair| pair[1] <= pair[0]) {
        bail!("times must be strictly ascending");
    }
    Ok(())
}
