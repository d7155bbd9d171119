//! Swarm average pose and position spread.
use nalgebra::{Matrix3, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::wrap_to_pi;

/// Mean pose of the swarm and the covariance of particle positions around it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwarmEstimate {
    /// [x, y, z, roll, pitch, yaw]
    pub mean: Vector6<f64>,
    pub covariance: Matrix3<f64>,
}

impl SwarmEstimate {
    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.mean[0], self.mean[1], self.mean[2])
    }

    /// The distinct covariance terms (xx, xy, xz, yy, yz, zz).
    pub fn covariance_terms(&self) -> [f64; 6] {
        let c = &self.covariance;
        [c[(0, 0)], c[(0, 1)], c[(0, 2)], c[(1, 1)], c[(1, 2)], c[(2, 2)]]
    }
}

/// Circular mean of angles in radians, in (-pi, pi].
pub fn circular_mean(angles: &[f64]) -> f64 {
    let (s, c) = angles
        .iter()
        .map(|a| wrap_to_pi(*a))
        .fold((0.0, 0.0), |(s, c), a| (s + a.sin(), c + a.cos()));
    wrap_to_pi(s.atan2(c))
}

/// Aggregate particle poses. `None` for an empty swarm.
///
/// Position, roll and pitch are averaged arithmetically, yaw on the circle. The covariance is the population
/// covariance of the positions.
pub fn aggregate(poses: &[Vector6<f64>]) -> Option<SwarmEstimate> {
    if poses.is_empty() {
        return None;
    }
    let n = poses.len() as f64;
    let sum = poses.iter().fold(Vector6::zeros(), |acc, p| acc + p);
    let mut mean = sum / n;
    let yaws: Vec<f64> = poses.iter().map(|p| p[5]).collect();
    mean[5] = circular_mean(&yaws);

    let center = Vector3::new(mean[0], mean[1], mean[2]);
    let covariance = poses
        .iter()
        .map(|p| Vector3::new(p[0], p[1], p[2]) - center)
        .fold(Matrix3::zeros(), |acc, d| acc + d * d.transpose())
        / n;
    Some(SwarmEstimate { mean, covariance })
}
