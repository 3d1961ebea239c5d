//! Random variate generation.
//!
//! All draws go through a single [`Sampler`], which owns the generator and
//! the cached second value of the Gaussian pair. Reproducibility therefore
//! only depends on the seed and on the order in which draws are requested.

use anyhow::Result;
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use statrs::function::gamma::ln_gamma;
use std::f64::consts::PI;

/// Mean above which Poisson draws use the normal approximation.
const POISSON_NORMAL_THRESHOLD: f64 = 30.0;

/// Sequential random number source with the samplers used by the simulator.
pub struct Sampler {
    rng: ChaCha12Rng,
    cached_gaussian: Option<f64>,
}

impl Sampler {
    /// Create a sampler with a deterministic seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha12Rng::seed_from_u64(seed),
            cached_gaussian: None,
        }
    }

    /// Create a sampler seeded from operating system entropy.
    pub fn from_os_rng() -> Result<Self> {
        Ok(Self {
            rng: ChaCha12Rng::try_from_os_rng()?,
            cached_gaussian: None,
        })
    }

    /// Access the underlying generator, e.g. to sample `rand_distr` distributions.
    pub fn rng(&mut self) -> &mut ChaCha12Rng {
        &mut self.rng
    }

    /// Uniform variate in `[0, 1)`.
    pub fn next_uniform(&mut self) -> f64 {
        self.rng.random::<f64>()
    }

    /// Uniform index in `0..len`. `len` must be positive.
    pub fn next_index(&mut self, len: usize) -> usize {
        let idx = (self.next_uniform() * len as f64) as usize;
        idx.min(len - 1)
    }

    /// Exponential variate with the given rate (inverse CDF).
    ///
    /// A zero rate means an infinite waiting time and must be handled by
    /// the caller.
    pub fn next_exponential(&mut self, rate: f64) -> f64 {
        -(1.0 - self.next_uniform()).ln() / rate
    }

    /// Standard normal variate (Box-Muller).
    ///
    /// Each pair of uniforms yields two variates; the second is returned by
    /// the following call.
    pub fn next_gaussian(&mut self) -> f64 {
        if let Some(val) = self.cached_gaussian.take() {
            return val;
        }
        let u1 = 1.0 - self.next_uniform();
        let u2 = self.next_uniform();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * PI * u2;
        self.cached_gaussian = Some(r * theta.sin());
        r * theta.cos()
    }

    /// Poisson variate with mean `lambda`.
    ///
    /// Knuth's multiplicative method below [`POISSON_NORMAL_THRESHOLD`],
    /// rounded normal approximation (clamped at zero) above it.
    pub fn next_poisson(&mut self, lambda: f64) -> f64 {
        if lambda <= 0.0 {
            return 0.0;
        }
        if lambda < POISSON_NORMAL_THRESHOLD {
            let limit = (-lambda).exp();
            let mut k = 0u64;
            let mut prod = 1.0;
            loop {
                k += 1;
                prod *= self.next_uniform();
                if prod <= limit {
                    break;
                }
            }
            return (k - 1) as f64;
        }
        let x = lambda + lambda.sqrt() * self.next_gaussian();
        if x < 0.0 { 0.0 } else { x.round() }
    }

    /// Binomial variate with `n` trials and success probability `p`.
    ///
    /// Inverts the CDF in log space starting from `P(0) = (1 - p)^n`.
    pub fn next_binomial(&mut self, n: f64, p: f64) -> f64 {
        if p <= 0.0 || n <= 0.0 {
            return 0.0;
        }
        if p >= 1.0 {
            return n;
        }

        let mut log_prob = n * (1.0 - p).ln();
        let mut cum_prob = log_prob.exp();
        let log_f = (p / (1.0 - p)).ln();

        let u = self.next_uniform();
        let mut k = 0.0;
        while u > cum_prob && k < n {
            k += 1.0;
            log_prob += log_f + (n - k + 1.0).ln() - k.ln();
            cum_prob += log_prob.exp();
        }
        k
    }
}

/// Logarithm of the binomial coefficient, defined for real arguments.
pub fn log_choose(n: f64, k: f64) -> f64 {
    ln_gamma(n + 1.0) - ln_gamma(k + 1.0) - ln_gamma(n - k + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Accumulator;

    #[test]
    fn binomial_boundaries() {
        let mut sampler = Sampler::from_seed(1);
        for n in 0..50 {
            let n = n as f64;
            assert_eq!(sampler.next_binomial(n, 0.0), 0.0);
            assert_eq!(sampler.next_binomial(n, 1.0), n);
        }
    }

    #[test]
    fn binomial_stays_in_support() {
        let mut sampler = Sampler::from_seed(2);
        let mut acc = Accumulator::new();
        for _ in 0..20_000 {
            let k = sampler.next_binomial(10.0, 0.3);
            assert!((0.0..=10.0).contains(&k));
            assert_eq!(k, k.round());
            acc.add(k);
        }
        let report = acc.report();
        assert!((report.mean - 3.0).abs() < 0.05, "mean = {}", report.mean);
        let std_dev = (10.0f64 * 0.3 * 0.7).sqrt();
        assert!((report.std_dev - std_dev).abs() < 0.05);
    }

    #[test]
    fn poisson_zero_mean() {
        let mut sampler = Sampler::from_seed(3);
        for _ in 0..100 {
            assert_eq!(sampler.next_poisson(0.0), 0.0);
            assert_eq!(sampler.next_poisson(-1.0), 0.0);
        }
    }

    #[test]
    fn poisson_means() {
        let mut sampler = Sampler::from_seed(4);
        for lambda in [0.5, 4.0, 29.0, 30.0, 250.0] {
            let mut acc = Accumulator::new();
            for _ in 0..20_000 {
                let k = sampler.next_poisson(lambda);
                assert!(k >= 0.0);
                acc.add(k);
            }
            let mean = acc.report().mean;
            let tol = 5.0 * (lambda / 20_000.0f64).sqrt();
            assert!((mean - lambda).abs() < tol, "lambda = {lambda}, mean = {mean}");
        }
    }

    #[test]
    fn gaussian_pair_is_cached() {
        let mut sampler = Sampler::from_seed(5);
        let _ = sampler.next_gaussian();
        assert!(sampler.cached_gaussian.is_some());
        let _ = sampler.next_gaussian();
        assert!(sampler.cached_gaussian.is_none());

        let mut acc = Accumulator::new();
        for _ in 0..20_000 {
            acc.add(sampler.next_gaussian());
        }
        let report = acc.report();
        assert!(report.mean.abs() < 0.05);
        assert!((report.std_dev - 1.0).abs() < 0.05);
    }

    #[test]
    fn exponential_mean() {
        let mut sampler = Sampler::from_seed(6);
        let mut acc = Accumulator::new();
        for _ in 0..20_000 {
            let delta = sampler.next_exponential(4.0);
            assert!(delta.is_finite() && delta >= 0.0);
            acc.add(delta);
        }
        assert!((acc.report().mean - 0.25).abs() < 0.01);
    }

    #[test]
    fn log_choose_values() {
        assert!((log_choose(5.0, 2.0) - 10.0f64.ln()).abs() < 1e-10);
        assert!(log_choose(7.0, 0.0).abs() < 1e-10);
        assert!((log_choose(2.5, 1.0) - 2.5f64.ln()).abs() < 1e-10);
    }

    #[test]
    fn same_seed_same_draws() {
        let mut a = Sampler::from_seed(7);
        let mut b = Sampler::from_seed(7);
        for _ in 0..100 {
            assert_eq!(a.next_poisson(40.0), b.next_poisson(40.0));
        }
    }
}
