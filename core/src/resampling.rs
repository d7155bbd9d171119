//! Effective sample size monitoring and systematic resampling.
//!
//! The engine keeps a short sliding window of the effective sample size and resamples only when the smoothed
//! value drops below half the particle count, and only when few enough particles missed the measurement for the
//! weights to be trusted. A resampling event reassigns lost particles to duplicates of the survivors, jitters
//! every particle, and then tells the map workers which map state to keep.
use std::collections::{BTreeMap, VecDeque};

use log::{debug, info, warn};
use nalgebra::Vector6;
use rand::Rng;

use crate::config::FilterConfig;
use crate::estimator::{EstimatorPool, ReassignmentReport};
use crate::particle::ParticleSwarm;
use crate::weights::WeightReport;

/// Number of effective sample size values averaged before comparing against the threshold.
pub const ESS_WINDOW: usize = 3;

/// Moving average of the most recent effective sample sizes.
#[derive(Clone, Debug)]
pub struct SlidingEss {
    window: VecDeque<f64>,
}

impl SlidingEss {
    /// Window initially full of `particle_count`, i.e. a perfectly healthy swarm.
    pub fn new(particle_count: usize) -> Self {
        SlidingEss {
            window: std::iter::repeat_n(particle_count as f64, ESS_WINDOW).collect(),
        }
    }

    /// Push a new value, dropping the oldest, and return the filtered value.
    pub fn push(&mut self, n_eff: f64) -> f64 {
        self.window.pop_front();
        self.window.push_back(n_eff);
        self.filtered()
    }

    pub fn filtered(&self) -> f64 {
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }
}

/// Normalize weights to sum to one.
///
/// Returns `None` when the sum is zero or not finite.
pub fn normalize_weights(weights: &[f64]) -> Option<Vec<f64>> {
    let sum: f64 = weights.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        Some(weights.iter().map(|w| w / sum).collect())
    } else {
        None
    }
}

/// `1 / sum(w^2)` of normalized weights.
pub fn effective_sample_size(weights: &[f64]) -> f64 {
    let sum_of_squares: f64 = weights.iter().map(|w| w * w).sum();
    if sum_of_squares > 0.0 {
        1.0 / sum_of_squares
    } else {
        0.0
    }
}

/// Systematic resampling with a random offset.
pub fn systematic_resample<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    let u: f64 = rng.random();
    systematic_resample_with_offset(weights, u)
}

/// Systematic resampling of normalized `weights` with offset `u` in [0, 1).
///
/// Draws at positions `(i + u) / n`; the returned indices are ascending.
pub fn systematic_resample_with_offset(weights: &[f64], u: f64) -> Vec<usize> {
    let n = weights.len();
    if n == 0 {
        return Vec::new();
    }
    let mut cumulative: Vec<f64> = weights
        .iter()
        .scan(0.0, |acc, w| {
            *acc += w;
            Some(*acc)
        })
        .collect();
    cumulative[n - 1] = 1.0;

    let mut indices = Vec::with_capacity(n);
    let mut j = 0;
    for i in 0..n {
        let position = (i as f64 + u) / n as f64;
        while j < n - 1 && position >= cumulative[j] {
            j += 1;
        }
        indices.push(j);
    }
    indices
}

/// Which particles survived a resampling draw and who replaces the rest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResamplingOutcome {
    /// The raw draw.
    pub indices: Vec<usize>,
    /// Distinct drawn indices, ascending.
    pub kept: Vec<usize>,
    /// Indices never drawn, ascending.
    pub lost: Vec<usize>,
    /// `(lost, source)`: each lost particle with the kept particle it becomes a copy of.
    pub pairings: Vec<(usize, usize)>,
}

impl ResamplingOutcome {
    /// Build the outcome of a draw over `particle_count` particles.
    ///
    /// The extra draws of each kept index, in ascending order, are paired one to one with the lost indices.
    pub fn from_indices(indices: &[usize], particle_count: usize) -> Self {
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for &i in indices {
            *counts.entry(i).or_insert(0) += 1;
        }
        let kept: Vec<usize> = counts.keys().copied().collect();
        let lost: Vec<usize> = (0..particle_count)
            .filter(|i| !counts.contains_key(i))
            .collect();
        let dupes = counts
            .iter()
            .flat_map(|(&i, &c)| std::iter::repeat_n(i, c - 1));
        let pairings = lost.iter().copied().zip(dupes).collect();
        ResamplingOutcome {
            indices: indices.to_vec(),
            kept,
            lost,
            pairings,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.lost.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Monitoring,
    Resampling,
}

/// Decides when to resample and carries the event out.
#[derive(Clone, Debug)]
pub struct ResamplingEngine {
    ess: SlidingEss,
    particle_count: usize,
    resampling_std: Vector6<f64>,
    state: EngineState,
}

impl ResamplingEngine {
    pub fn new(config: &FilterConfig) -> Self {
        ResamplingEngine {
            ess: SlidingEss::new(config.particle_count),
            particle_count: config.particle_count,
            resampling_std: config.resampling_std(),
            state: EngineState::Monitoring,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn filtered_ess(&self) -> f64 {
        self.ess.filtered()
    }

    /// Resampling threshold on the filtered effective sample size.
    pub fn threshold(&self) -> f64 {
        self.particle_count as f64 / 2.0
    }

    /// Resampling rule: smoothed N_eff below half the swarm, and no more than a quarter of it missed.
    pub fn should_resample(&self, filtered_ess: f64, missed: usize) -> bool {
        filtered_ess < self.threshold() && missed as f64 <= self.particle_count as f64 / 4.0
    }

    /// Digest one weight report and resample `swarm` if warranted.
    ///
    /// On resampling, lost particles take over pose and history of their paired source and every particle is
    /// jittered with the resampling noise. The returned outcome must then be passed to [`Self::dispatch`].
    pub fn evaluate<R: Rng + ?Sized>(
        &mut self,
        report: &WeightReport,
        swarm: &mut ParticleSwarm,
        rng: &mut R,
    ) -> Option<ResamplingOutcome> {
        let n = swarm.len();
        if report.weights.len() != n {
            warn!(
                "{} weights for {} particles, skipping update",
                report.weights.len(),
                n
            );
            return None;
        }
        let weights = match normalize_weights(&report.weights) {
            Some(weights) => weights,
            None => {
                warn!("Degenerate weights {:?}, using uniform weights", report.weights);
                vec![1.0 / n as f64; n]
            }
        };
        for (particle, w) in swarm.particles.iter_mut().zip(&weights) {
            particle.weight = *w;
        }

        let n_eff = effective_sample_size(&weights);
        let filtered = self.ess.push(n_eff);
        debug!(
            "N_eff {n_eff:.3}, filtered {filtered:.3}, missed {}",
            report.missed
        );
        if !self.should_resample(filtered, report.missed) {
            return None;
        }

        self.state = EngineState::Resampling;
        let indices = systematic_resample(&weights, rng);
        let outcome = ResamplingOutcome::from_indices(&indices, n);
        info!(
            "Resampling: keep {:?}, lost {:?}, pairings {:?}",
            outcome.kept, outcome.lost, outcome.pairings
        );

        for &(lost, source) in &outcome.pairings {
            let source = swarm.particles[source].clone();
            swarm.particles[lost].adopt(&source);
        }
        let uniform = 1.0 / n as f64;
        for particle in &mut swarm.particles {
            particle.add_noise(&self.resampling_std, rng);
            particle.weight = uniform;
        }
        Some(outcome)
    }

    /// Send the ownership instructions of `outcome` to the map workers and return to monitoring.
    pub async fn dispatch(
        &mut self,
        outcome: &ResamplingOutcome,
        pool: &EstimatorPool,
    ) -> ReassignmentReport {
        let report = pool.reassign(outcome).await;
        if !report.is_complete() {
            warn!("{} reassignment signals failed", report.failed.len());
        }
        self.state = EngineState::Monitoring;
        report
    }
}
