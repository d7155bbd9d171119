//! Rao-Blackwellized particle filter core for bathymetric SLAM
//!
//! This crate implements the estimation core of an underwater bathymetric SLAM filter. The filter keeps a swarm
//! of vehicle trajectory hypotheses (particles) and pairs every particle with its own map posterior estimator. The
//! map estimators (typically sparse Gaussian-process regressors) run as separate workers; the filter only talks to
//! them through small request/response contracts: query the expected depth at a set of points, plot the final
//! posterior, and keep or clone a worker's map state after resampling.
//!
//! This crate is primarily built off of a few additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): poses, rotations and frame transforms.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): process and
//!   resampling noise, systematic resampling offsets and minibatch selection.
//! - [`tokio`](https://crates.io/crates/tokio) and [`futures`](https://crates.io/crates/futures): the single
//!   processing loop and the bounded fan-out to the per-particle map workers.
//!
//! ## Crate overview
//!
//! - [config]: filter configuration and file I/O.
//! - [error]: error type shared by the crate.
//! - [frames]: fixed frame transforms, sensor pose snapshots and ping transformation.
//! - [particle]: particle state and the particle swarm.
//! - [motion]: odometry driven motion prediction.
//! - [history]: the append-only multibeam ping history.
//! - [estimator]: the per-particle map estimator client and the indexed worker pool.
//! - [weights]: measurement driven importance weights.
//! - [resampling]: effective sample size monitoring, systematic resampling and map ownership reassignment.
//! - [aggregate]: mean pose, circular yaw and swarm covariance.
//! - [minibatch]: random historical ping subsets for map training.
//! - [controller]: the processing loop tying everything together.
//! - [messages]: inbound and outbound message types.
//! - [sim]: a synthetic survey with in-process map workers for testing and demonstration.
//!
//! ## Pose conventions
//!
//! Particle poses are six-element vectors in the odometry frame:
//!
//! $$
//! x = [p_x, p_y, p_z, \phi, \theta, \psi]
//! $$
//!
//! with the orientation given as XYZ Euler angles (roll, pitch, yaw) in radians. The pose history of a particle
//! stores the pose of the multibeam sensor in the map frame, i.e. `map_to_odom * odom_to_base * base_to_sensor`,
//! which is the transform required to place a ping recorded in the sensor frame into the map.
pub mod aggregate;
pub mod config;
pub mod controller;
pub mod error;
pub mod estimator;
pub mod frames;
pub mod history;
pub mod messages;
pub mod minibatch;
pub mod motion;
pub mod particle;
pub mod resampling;
pub mod sim;
pub mod weights;

pub use config::FilterConfig;
pub use controller::{FilterController, FilterState};
pub use error::{RbpfError, Result};

use std::f64::consts::PI;

/// Wrap an angle into the half-open range $(-\pi, \pi]$ radians
///
/// # Arguments
/// * `angle` - The angle to be wrapped in radians.
/// # Returns
/// * The wrapped angle, in the range (-π, π].
/// # Example
/// ```rust
/// use bathy_rbpf::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped + PI / 2.0).abs() < 1e-12);
/// assert_eq!(wrap_to_pi(-PI), PI);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI { wrapped + 2.0 * PI } else { wrapped }
}
