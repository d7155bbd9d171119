//! Particle weighting against the per-particle depth maps.
//!
//! A ping is placed under each particle's trajectory and the particle's map is asked what depth it expects at
//! every beam. The weight is the likelihood of the depths actually measured, which are known well in absolute
//! terms from the pressure sensor.
use std::f64::consts::PI;

use log::{debug, trace, warn};
use nalgebra::Vector3;

use crate::estimator::{DepthPosterior, EstimatorPool};
use crate::frames::FrameTransforms;
use crate::history::PingRecord;
use crate::particle::ParticleSwarm;

/// Added to every weight so that no particle is ever weighted exactly zero.
pub const WEIGHT_FLOOR: f64 = 1e-200;

/// Raw (unnormalized) particle weights of one update.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightReport {
    pub weights: Vec<f64>,
    /// Particles whose map gave no usable answer.
    pub missed: usize,
}

pub struct WeightEvaluator {
    measurement_std: f64,
    frames: FrameTransforms,
}

impl WeightEvaluator {
    pub fn new(measurement_std: f64, frames: FrameTransforms) -> Self {
        WeightEvaluator {
            measurement_std,
            frames,
        }
    }

    /// Absolute beam depths in the map frame.
    ///
    /// `beams` are in the sensor frame; the vehicle depth and the map offset are added directly since the
    /// vertical component does not depend on the particle hypothesis.
    pub fn observed_depths(&self, beams: &[Vector3<f64>], vehicle_z: f64) -> Vec<f64> {
        let offset = self.frames.depth_offset();
        beams.iter().map(|b| b.z + offset + vehicle_z).collect()
    }

    /// Log of the product of Gaussian likelihoods of `observed` under `posterior`.
    ///
    /// `None` when the posterior does not cover every observation.
    pub fn log_likelihood(&self, observed: &[f64], posterior: &DepthPosterior) -> Option<f64> {
        if !posterior.covers(observed.len()) {
            return None;
        }
        let meas_var = self.measurement_std * self.measurement_std;
        let log_likelihood: f64 = observed
            .iter()
            .zip(posterior.mean.iter().zip(posterior.variance.iter()))
            .map(|(z, (mu, var))| {
                let s2 = var + meas_var;
                let r = z - mu;
                -0.5 * (2.0 * PI * s2).ln() - r * r / (2.0 * s2)
            })
            .sum();
        Some(log_likelihood)
    }

    /// Weigh every particle of `swarm` against `ping`.
    ///
    /// Log-likelihoods are shifted by their maximum over the particles that got an answer before
    /// exponentiating, so the best particle weighs one and nothing overflows. Particles without a usable
    /// answer weigh exactly the floor.
    pub async fn compute_weights(
        &self,
        swarm: &ParticleSwarm,
        ping: &PingRecord,
        pool: &EstimatorPool,
    ) -> WeightReport {
        let observed = self.observed_depths(&ping.beams, ping.vehicle_z);
        let queries: Vec<Option<Vec<Vector3<f64>>>> =
            swarm.particles.iter().map(|p| ping.in_map(p)).collect();
        let posteriors = pool.sample_all(queries).await;

        let log_weights: Vec<Option<f64>> = posteriors
            .into_iter()
            .enumerate()
            .map(|(i, posterior)| match posterior {
                None => {
                    warn!("Particle {i} has no pose for step {}", ping.step);
                    None
                }
                Some(Ok(posterior)) => {
                    let log_w = self.log_likelihood(&observed, &posterior);
                    if log_w.is_none() {
                        debug!("Particle {i} map does not cover the ping");
                    }
                    log_w
                }
                Some(Err(e)) if e.is_missed_measurement() => {
                    debug!("Particle {i} map query failed: {e}");
                    None
                }
                Some(Err(e)) => {
                    warn!("Particle {i} map query rejected: {e}");
                    None
                }
            })
            .collect();

        let max_log = log_weights
            .iter()
            .flatten()
            .copied()
            .filter(|l| l.is_finite())
            .fold(f64::NEG_INFINITY, f64::max);
        let mut missed = 0;
        let weights: Vec<f64> = log_weights
            .iter()
            .map(|log_w| match log_w {
                Some(l) if l.is_finite() => (l - max_log).exp() + WEIGHT_FLOOR,
                Some(_) => WEIGHT_FLOOR,
                None => {
                    missed += 1;
                    WEIGHT_FLOOR
                }
            })
            .collect();
        trace!("Weights {weights:?}, missed {missed}");
        WeightReport { weights, missed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EstimatorConfig, FilterConfig};
    use crate::error::Result;
    use crate::estimator::tests::{ScriptedEstimator, SilentEstimator};
    use crate::estimator::{MapEstimatorClient, Reassignment, SharedEstimator};
    use crate::resampling::normalize_weights;
    use assert_approx_eq::assert_approx_eq;
    use async_trait::async_trait;
    use nalgebra::Isometry3;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::{Arc, Mutex};

    /// Returns one value fewer than asked for.
    struct ShortEstimator;

    #[async_trait]
    impl MapEstimatorClient for ShortEstimator {
        async fn sample_posterior(&self, points: Vec<Vector3<f64>>) -> Result<DepthPosterior> {
            let n = points.len().saturating_sub(1);
            Ok(DepthPosterior {
                mean: vec![0.0; n],
                variance: vec![1.0; n],
            })
        }
        async fn plot_posterior(&self, _points: Vec<Vector3<f64>>) -> Result<()> {
            Ok(())
        }
        async fn reassign(&self, _signal: Reassignment) -> Result<()> {
            Ok(())
        }
    }

    fn scripted(particle: usize, depth: f64) -> SharedEstimator {
        Arc::new(ScriptedEstimator {
            particle,
            depth,
            variance: 0.0,
            log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn ping() -> PingRecord {
        PingRecord {
            stamp: 1.0,
            beams: vec![Vector3::new(0.0, -1.0, -8.0), Vector3::new(0.0, 1.0, -8.0)],
            step: 0,
            vehicle_z: -2.0,
        }
    }

    #[test]
    fn observed_depth_adds_vehicle_and_map_offset() {
        let frames = FrameTransforms {
            map_to_odom: Isometry3::translation(0.0, 0.0, 1.5),
            ..FrameTransforms::default()
        };
        let evaluator = WeightEvaluator::new(0.1, frames);
        let depths = evaluator.observed_depths(&ping().beams, -2.0);
        assert_eq!(depths, vec![-8.5, -8.5]);
    }

    #[test]
    fn log_likelihood_is_sum_of_gaussian_terms() {
        let evaluator = WeightEvaluator::new(1.0, FrameTransforms::default());
        let posterior = DepthPosterior {
            mean: vec![0.0, 0.0],
            variance: vec![0.0, 0.0],
        };
        let pdf0 = 1.0 / (2.0 * PI).sqrt();
        let pdf1 = pdf0 * (-0.5f64).exp();
        let log_w = evaluator.log_likelihood(&[0.0, 1.0], &posterior).unwrap();
        assert_approx_eq!(log_w, (pdf0 * pdf1).ln(), 1e-12);
        assert!(evaluator.log_likelihood(&[0.0], &posterior).is_none());
    }

    #[tokio::test]
    async fn missing_answers_count_as_missed() {
        let config = FilterConfig {
            particle_count: 4,
            ..FilterConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let swarm = ParticleSwarm::new(&config, FrameTransforms::default(), &mut rng);
        let pool = EstimatorPool::new(
            vec![
                scripted(0, -10.0),
                scripted(1, -10.0),
                Arc::new(ShortEstimator),
                Arc::new(SilentEstimator),
            ],
            EstimatorConfig {
                query_timeout_ms: 30,
                ..EstimatorConfig::default()
            },
        );
        let evaluator = WeightEvaluator::new(0.5, FrameTransforms::default());
        let report = evaluator.compute_weights(&swarm, &ping(), &pool).await;

        assert_eq!(report.weights.len(), 4);
        assert_eq!(report.missed, 2);
        assert_approx_eq!(report.weights[0], 1.0, 1e-12);
        assert_approx_eq!(report.weights[0], report.weights[1], 1e-15);
        assert_eq!(report.weights[2], WEIGHT_FLOOR);
        assert_eq!(report.weights[3], WEIGHT_FLOOR);
    }

    #[tokio::test]
    async fn far_off_map_is_floored_but_not_missed() {
        let config = FilterConfig {
            particle_count: 2,
            ..FilterConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let swarm = ParticleSwarm::new(&config, FrameTransforms::default(), &mut rng);
        let pool = EstimatorPool::new(
            vec![scripted(0, -10.0), scripted(1, 500.0)],
            EstimatorConfig::default(),
        );
        let evaluator = WeightEvaluator::new(0.01, FrameTransforms::default());
        let report = evaluator.compute_weights(&swarm, &ping(), &pool).await;
        assert_eq!(report.missed, 0);
        assert_eq!(report.weights[1], WEIGHT_FLOOR);
        assert!(report.weights[0] > report.weights[1]);
    }

    fn ping_with_beams(count: usize) -> PingRecord {
        PingRecord {
            stamp: 1.0,
            beams: (0..count)
                .map(|b| Vector3::new(0.0, b as f64 - count as f64 / 2.0, -8.0))
                .collect(),
            step: 0,
            vehicle_z: -2.0,
        }
    }

    fn two_particle_swarm() -> ParticleSwarm {
        let config = FilterConfig {
            particle_count: 2,
            ..FilterConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        ParticleSwarm::new(&config, FrameTransforms::default(), &mut rng)
    }

    #[tokio::test]
    async fn sharp_likelihoods_still_rank_particles() {
        // Observed depth is -10; maps 0.3 m and 1.0 m off with a 1 cm sensor over 20 beams.
        let swarm = two_particle_swarm();
        let pool = EstimatorPool::new(
            vec![scripted(0, -10.3), scripted(1, -11.0)],
            EstimatorConfig::default(),
        );
        let evaluator = WeightEvaluator::new(0.01, FrameTransforms::default());
        let report = evaluator.compute_weights(&swarm, &ping_with_beams(20), &pool).await;
        assert_eq!(report.missed, 0);
        assert_approx_eq!(report.weights[0], 1.0, 1e-12);
        assert_eq!(report.weights[1], WEIGHT_FLOOR);
        assert!(report.weights[0] > report.weights[1]);
    }

    #[tokio::test]
    async fn many_matching_beams_do_not_overflow() {
        let swarm = two_particle_swarm();
        let pool = EstimatorPool::new(
            vec![scripted(0, -10.0), scripted(1, -10.001)],
            EstimatorConfig::default(),
        );
        let evaluator = WeightEvaluator::new(0.01, FrameTransforms::default());
        let report = evaluator.compute_weights(&swarm, &ping_with_beams(200), &pool).await;
        assert!(report.weights.iter().all(|w| w.is_finite()));
        assert_approx_eq!(report.weights[0], 1.0, 1e-12);
        assert!(report.weights[1] < report.weights[0]);
        assert!(normalize_weights(&report.weights).is_some());
    }

    /// Panics if asked anything.
    struct UnreachableEstimator;

    #[async_trait]
    impl MapEstimatorClient for UnreachableEstimator {
        async fn sample_posterior(&self, _points: Vec<Vector3<f64>>) -> Result<DepthPosterior> {
            panic!("queried a particle without a pose")
        }
        async fn plot_posterior(&self, _points: Vec<Vector3<f64>>) -> Result<()> {
            Ok(())
        }
        async fn reassign(&self, _signal: Reassignment) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn particles_without_pose_are_not_queried() {
        let mut swarm = two_particle_swarm();
        swarm.particles[1].pose_history.clear();
        let pool = EstimatorPool::new(
            vec![scripted(0, -10.0), Arc::new(UnreachableEstimator)],
            EstimatorConfig::default(),
        );
        let evaluator = WeightEvaluator::new(0.1, FrameTransforms::default());
        let report = evaluator.compute_weights(&swarm, &ping_with_beams(4), &pool).await;
        assert_eq!(report.missed, 1);
        assert_eq!(report.weights[1], WEIGHT_FLOOR);
        assert_approx_eq!(report.weights[0], 1.0, 1e-12);
    }
}
