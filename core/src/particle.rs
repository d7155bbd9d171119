//! Particle state and the particle swarm.
use std::fmt::{self, Display};

use nalgebra::{Vector3, Vector6};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::config::FilterConfig;
use crate::frames::{FrameTransforms, PoseSnapshot};
use crate::wrap_to_pi;

/// Zero-mean Gaussian noise with the given per-axis standard deviations.
pub fn sample_noise<R: Rng + ?Sized>(std: &Vector6<f64>, rng: &mut R) -> Vector6<f64> {
    Vector6::from_fn(|i, _| {
        if std[i] > 0.0 {
            Distribution::<f64>::sample(&StandardNormal, rng) * std[i]
        } else {
            0.0
        }
    })
}

/// One trajectory hypothesis.
#[derive(Clone, Debug, PartialEq)]
pub struct Particle {
    /// Index of the particle, also the index of its map estimator.
    pub index: usize,
    /// [x, y, z, roll, pitch, yaw] in the odometry frame.
    pub pose: Vector6<f64>,
    /// Sensor pose in the map frame, one entry per prediction step.
    pub pose_history: Vec<PoseSnapshot>,
    pub weight: f64,
    process_std: Vector6<f64>,
}

impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("index", &self.index)
            .field("x", &self.pose[0])
            .field("y", &self.pose[1])
            .field("z", &self.pose[2])
            .field("roll", &self.pose[3])
            .field("pitch", &self.pose[4])
            .field("yaw", &self.pose[5])
            .field("steps", &self.pose_history.len())
            .field("weight", &self.weight)
            .finish()
    }
}

impl Particle {
    /// Create a particle around the origin with the given initial spread.
    ///
    /// The pose history starts with the initial pose, so step 0 is always valid.
    pub fn new<R: Rng + ?Sized>(
        index: usize,
        init_std: &Vector6<f64>,
        process_std: Vector6<f64>,
        weight: f64,
        frames: &FrameTransforms,
        rng: &mut R,
    ) -> Particle {
        let mut pose = sample_noise(init_std, rng);
        pose[5] = wrap_to_pi(pose[5]);
        let mut particle = Particle {
            index,
            pose,
            pose_history: Vec::new(),
            weight,
            process_std,
        };
        particle.record_pose(frames);
        particle
    }

    pub fn process_std(&self) -> &Vector6<f64> {
        &self.process_std
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.pose[0], self.pose[1], self.pose[2])
    }

    /// Append the current sensor pose to the history.
    pub fn record_pose(&mut self, frames: &FrameTransforms) {
        self.pose_history.push(frames.sensor_in_map(&self.pose));
    }

    /// Sensor pose recorded at `step`.
    pub fn snapshot(&self, step: usize) -> Option<&PoseSnapshot> {
        self.pose_history.get(step)
    }

    /// Jitter the current pose. The history is left as is.
    pub fn add_noise<R: Rng + ?Sized>(&mut self, std: &Vector6<f64>, rng: &mut R) {
        self.pose += sample_noise(std, rng);
        for i in 3..6 {
            self.pose[i] = wrap_to_pi(self.pose[i]);
        }
    }

    /// Overwrite pose and history with those of `source`.
    pub fn adopt(&mut self, source: &Particle) {
        self.pose = source.pose;
        self.pose_history.clone_from(&source.pose_history);
    }
}

/// All particles plus the dead-reckoning reference.
#[derive(Clone, Debug)]
pub struct ParticleSwarm {
    pub particles: Vec<Particle>,
    /// Noise-free reference trajectory; never weighted or resampled.
    pub dead_reckoning: Particle,
    frames: FrameTransforms,
}

impl ParticleSwarm {
    pub fn new<R: Rng + ?Sized>(
        config: &FilterConfig,
        frames: FrameTransforms,
        rng: &mut R,
    ) -> ParticleSwarm {
        let n = config.particle_count;
        let weight = 1.0 / n as f64;
        let init_std = config.init_std();
        let motion_std = config.motion_std();
        let particles = (0..n)
            .map(|i| {
                if config.anchor_particle && i == n - 1 {
                    // Sits on top of the vehicle.
                    Particle::new(i, &Vector6::zeros(), Vector6::zeros(), weight, &frames, rng)
                } else {
                    Particle::new(i, &init_std, motion_std, weight, &frames, rng)
                }
            })
            .collect();
        let dead_reckoning =
            Particle::new(n, &Vector6::zeros(), Vector6::zeros(), 0.0, &frames, rng);
        ParticleSwarm {
            particles,
            dead_reckoning,
            frames,
        }
    }

    pub fn frames(&self) -> &FrameTransforms {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    /// Index of the latest pose-history entry, shared by every particle.
    pub fn current_step(&self) -> usize {
        self.particles
            .first()
            .map(|p| p.pose_history.len().saturating_sub(1))
            .unwrap_or(0)
    }

    pub fn poses(&self) -> Vec<Vector6<f64>> {
        self.particles.iter().map(|p| p.pose).collect()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.weight).collect()
    }

    /// True when every particle has the same number of history entries.
    pub fn histories_aligned(&self) -> bool {
        let len = self.particles.first().map(|p| p.pose_history.len());
        self.particles
            .iter()
            .all(|p| Some(p.pose_history.len()) == len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn swarm(config: &FilterConfig) -> ParticleSwarm {
        let mut rng = StdRng::seed_from_u64(config.seed);
        ParticleSwarm::new(config, FrameTransforms::default(), &mut rng)
    }

    #[test]
    fn swarm_starts_aligned_with_uniform_weights() {
        let config = FilterConfig::default();
        let swarm = swarm(&config);
        assert_eq!(swarm.len(), config.particle_count);
        assert!(swarm.histories_aligned());
        assert_eq!(swarm.current_step(), 0);
        let sum: f64 = swarm.weights().iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        for (i, p) in swarm.particles.iter().enumerate() {
            assert_eq!(p.index, i);
        }
    }

    #[test]
    fn anchor_and_dead_reckoning_are_noise_free() {
        let config = FilterConfig {
            init_covariance: [4.0; 6],
            ..FilterConfig::default()
        };
        let swarm = swarm(&config);
        let anchor = swarm.particles.last().unwrap();
        assert_eq!(anchor.pose, Vector6::zeros());
        assert_eq!(anchor.process_std(), &Vector6::zeros());
        assert_eq!(swarm.dead_reckoning.pose, Vector6::zeros());
        assert_eq!(swarm.dead_reckoning.index, config.particle_count);
        assert!(swarm.particles[0].pose.norm() > 0.0);
    }

    #[test]
    fn anchor_can_be_disabled() {
        let config = FilterConfig {
            init_covariance: [4.0; 6],
            anchor_particle: false,
            ..FilterConfig::default()
        };
        let swarm = swarm(&config);
        assert!(swarm.particles.last().unwrap().pose.norm() > 0.0);
    }

    #[test]
    fn adopt_copies_pose_and_history() {
        let config = FilterConfig {
            init_covariance: [1.0; 6],
            ..FilterConfig::default()
        };
        let mut swarm = swarm(&config);
        let frames = *swarm.frames();
        swarm.particles[0].pose[0] = 42.0;
        swarm.particles[0].record_pose(&frames);
        let source = swarm.particles[0].clone();
        swarm.particles[1].adopt(&source);
        assert_eq!(swarm.particles[1].pose, source.pose);
        assert_eq!(swarm.particles[1].pose_history, source.pose_history);
        assert_eq!(swarm.particles[1].index, 1);
    }

    #[test]
    fn zero_noise_leaves_pose_unchanged() {
        let mut rng = StdRng::seed_from_u64(1);
        let noise = sample_noise(&Vector6::zeros(), &mut rng);
        assert_eq!(noise, Vector6::zeros());
    }
}
