use crate::config::Config;
use crate::engine::Engine;
use crate::logger::TrajectoryLogger;
use crate::sampler::Sampler;
use crate::stats::{Accumulator, AccumulatorReport};
use anyhow::{Context, Result, bail};
use glob::glob;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

/// Summary of the replicates of one run.
#[derive(Debug)]
pub struct RunSummary {
    pub run_idx: usize,
    pub n_accepted: usize,
    pub n_failed: usize,
    pub event_counts: AccumulatorReport,
    /// Leaf counts of the reconstructed trees. Trees are only summarized
    /// here; nothing but `trajectory.tsv` is written to the run directory.
    pub leaf_counts: AccumulatorReport,
}

pub struct Manager {
    sim_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg = Config::from_file(sim_dir.join("config.toml")).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        Ok(Self { sim_dir, cfg })
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    /// Simulate a new run and write its trajectories.
    pub fn create_run(&self) -> Result<RunSummary> {
        let run_idx = self.count_run_dirs().context("failed to count run dirs")?;

        let run_dir = self.run_dir(run_idx);
        fs::create_dir_all(&run_dir).with_context(|| format!("failed to create {run_dir:?}"))?;
        log::info!("created {run_dir:?}");

        let sampler = match self.cfg.simulation.seed {
            Some(seed) => Sampler::from_seed(seed.wrapping_add(run_idx as u64)),
            None => Sampler::from_os_rng().context("failed to seed sampler")?,
        };
        let mut engine =
            Engine::from_config(&self.cfg, sampler).context("failed to construct engine")?;

        let file = self.trajectory_file(run_idx);
        let mut writer = BufWriter::new(
            File::create(&file).with_context(|| format!("failed to create {file:?}"))?,
        );
        let logger = TrajectoryLogger::new(self.cfg.output.log_interval);
        logger
            .write_header(&mut writer, engine.state())
            .with_context(|| format!("failed to write to {file:?}"))?;

        let n_trajectories = self.cfg.output.n_trajectories;
        let mut n_accepted = 0;
        let mut event_counts = Accumulator::new();
        let mut leaf_counts = Accumulator::new();

        for sample in 0..n_trajectories {
            if let Err(err) = engine.simulate() {
                if err.is_internal() {
                    bail!(err);
                }
                log::warn!("replicate {sample} failed: {err}");
                continue;
            }
            n_accepted += 1;
            event_counts.add(engine.event_count() as f64);

            engine
                .write_log(&mut writer, &logger, sample as u64)
                .with_context(|| format!("failed to write to {file:?}"))?;

            if self.cfg.output.simulate_tree {
                match engine.simulate_tree() {
                    Ok(tree) => leaf_counts.add(tree.leaf_count() as f64),
                    Err(err) if err.is_internal() => bail!(err),
                    Err(err) => log::warn!("replicate {sample} has no tree: {err}"),
                }
            }

            let progress = 100.0 * (sample + 1) as f64 / n_trajectories as f64;
            log::info!("completed {progress:06.2}%");
        }

        writer
            .flush()
            .with_context(|| format!("failed to flush {file:?}"))?;
        log::info!("wrote {file:?}");

        let summary = RunSummary {
            run_idx,
            n_accepted,
            n_failed: n_trajectories - n_accepted,
            event_counts: event_counts.report(),
            leaf_counts: leaf_counts.report(),
        };
        log::info!("{summary:#?}");

        Ok(summary)
    }

    pub fn clean_sim(&self) -> Result<()> {
        let n_runs = self.count_run_dirs().context("failed to count run dirs")?;
        for run_idx in 0..n_runs {
            let run_dir = self.run_dir(run_idx);
            fs::remove_dir_all(&run_dir).with_context(|| format!("failed to remove {run_dir:?}"))?;
            log::info!("removed {run_dir:?}");
        }

        Ok(())
    }

    pub fn count_run_dirs(&self) -> Result<usize> {
        let pattern = self.sim_dir.join("run-*");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let count = glob(pattern)
            .context("failed to glob run dirs")?
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .count();
        Ok(count)
    }

    pub fn run_dir(&self, run_idx: usize) -> PathBuf {
        self.sim_dir.join(format!("run-{run_idx:04}"))
    }

    pub fn trajectory_file(&self, run_idx: usize) -> PathBuf {
        self.run_dir(run_idx).join("trajectory.tsv")
    }
}
