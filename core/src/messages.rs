//! Messages exchanged between the filter and the outside world.
//!
//! Inputs arrive on a single queue as [`FilterInput`]; everything the filter publishes leaves as
//! [`FilterOutput`]. The transport adapter is responsible for decoding sensor messages into these types.
use nalgebra::{Vector3, Vector6};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::aggregate::SwarmEstimate;
use crate::minibatch::{MinibatchRequest, MinibatchResult};

/// Vehicle odometry in the odometry frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Odometry {
    /// Time stamp in seconds.
    pub stamp: f64,
    pub position: Vector3<f64>,
    /// Roll, pitch and yaw in radians.
    pub orientation: Vector3<f64>,
    /// Body frame linear velocity in m/s.
    pub linear_velocity: Vector3<f64>,
    /// Body frame angular rate in rad/s.
    pub angular_velocity: Vector3<f64>,
}

impl Odometry {
    /// The odometry pose as [x, y, z, roll, pitch, yaw].
    pub fn pose(&self) -> Vector6<f64> {
        Vector6::new(
            self.position.x,
            self.position.y,
            self.position.z,
            self.orientation.x,
            self.orientation.y,
            self.orientation.z,
        )
    }
}

/// One multibeam ping, beams expressed in the sensor frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub stamp: f64,
    pub beams: Vec<Vector3<f64>>,
}

/// The planned survey path.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WaypointPath {
    pub waypoints: Vec<Vector3<f64>>,
}

/// Diagnostic record published with every odometry update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterStats {
    pub stamp: f64,
    pub n_eff_filtered: f64,
    pub resample_threshold: f64,
    pub odom_x: f64,
    pub odom_y: f64,
    pub odom_z: f64,
    pub mean_x: f64,
    pub mean_y: f64,
    pub mean_z: f64,
    pub dr_x: f64,
    pub dr_y: f64,
    pub dr_z: f64,
    pub cov_xx: f64,
    pub cov_xy: f64,
    pub cov_xz: f64,
    pub cov_yy: f64,
    pub cov_yz: f64,
    pub cov_zz: f64,
}

impl FilterStats {
    /// The stats as the flat vector published on the diagnostics stream.
    pub fn to_vec(&self) -> Vec<f32> {
        [
            self.n_eff_filtered,
            self.resample_threshold,
            self.odom_x,
            self.odom_y,
            self.odom_z,
            self.mean_x,
            self.mean_y,
            self.mean_z,
            self.dr_x,
            self.dr_y,
            self.dr_z,
            self.cov_xx,
            self.cov_xy,
            self.cov_xz,
            self.cov_yy,
            self.cov_yz,
            self.cov_zz,
        ]
        .iter()
        .map(|v| *v as f32)
        .collect()
    }
}

/// Everything the filter consumes.
#[derive(Debug)]
pub enum FilterInput {
    Odometry(Odometry),
    Ping(Ping),
    MissionPath(WaypointPath),
    MissionFinished,
    ManualLoopClosure,
    Minibatch {
        request: MinibatchRequest,
        respond: oneshot::Sender<MinibatchResult>,
    },
}

/// Everything the filter publishes.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterOutput {
    ParticlePoses { stamp: f64, poses: Vec<Vector6<f64>> },
    AveragePose { stamp: f64, estimate: SwarmEstimate },
    Stats(FilterStats),
    /// Waypoints handed to the map estimators as inducing points.
    InducingPoints(Vec<Vector3<f64>>),
    /// Final map plotting finished.
    MapsPlotted { acknowledged: usize, failed: Vec<usize> },
}
