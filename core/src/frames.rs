//! Fixed frame transforms and ping geometry.
//!
//! Two transforms are fixed for the lifetime of the filter and resolved once at startup: the multibeam sensor
//! mounting on the vehicle (`base -> sensor`) and the offset between the map and odometry frames
//! (`map -> odom`). Failing to resolve either is fatal; the filter has no geometry to work with otherwise.
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use nalgebra::{Isometry3, Rotation3, Translation3, UnitQuaternion, Vector3, Vector6};

use crate::config::FrameIds;
use crate::error::{RbpfError, Result};

/// The fixed transforms the filter needs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameTransforms {
    /// Pose of the sensor in the vehicle base frame.
    pub base_to_sensor: Isometry3<f64>,
    /// Pose of the odometry frame in the map frame.
    pub map_to_odom: Isometry3<f64>,
}

impl Default for FrameTransforms {
    fn default() -> Self {
        FrameTransforms {
            base_to_sensor: Isometry3::identity(),
            map_to_odom: Isometry3::identity(),
        }
    }
}

impl FrameTransforms {
    /// Vertical offset between the map and odometry frames, folded into absolute depth.
    pub fn depth_offset(&self) -> f64 {
        self.map_to_odom.translation.vector.z
    }

    /// Pose of the sensor in the map frame for a vehicle pose given in the odometry frame.
    pub fn sensor_in_map(&self, pose: &Vector6<f64>) -> PoseSnapshot {
        let sensor = self.map_to_odom * pose_to_isometry(pose) * self.base_to_sensor;
        PoseSnapshot {
            position: sensor.translation.vector,
            rotation: sensor.rotation.to_rotation_matrix(),
        }
    }
}

/// Build an isometry from a [x, y, z, roll, pitch, yaw] pose.
pub fn pose_to_isometry(pose: &Vector6<f64>) -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::new(pose[0], pose[1], pose[2]),
        UnitQuaternion::from_euler_angles(pose[3], pose[4], pose[5]),
    )
}

/// Position and orientation of the sensor in the map frame at one prediction step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoseSnapshot {
    pub position: Vector3<f64>,
    pub rotation: Rotation3<f64>,
}

impl PoseSnapshot {
    /// Transform points from the sensor frame into the map frame.
    pub fn transform_points(&self, points: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
        points
            .iter()
            .map(|p| self.rotation * p + self.position)
            .collect()
    }
}

/// Pick `count` beams evenly spread across a ping, always including the outermost ones.
///
/// The index of the k-th kept beam is `round(k * (n - 1) / (count - 1))`, so pings narrower than `count` repeat
/// beams rather than returning fewer points.
pub fn subsample_beams(beams: &[Vector3<f64>], count: usize) -> Vec<Vector3<f64>> {
    if beams.is_empty() || count == 0 {
        return Vec::new();
    }
    if count == 1 {
        return vec![beams[0]];
    }
    let last = (beams.len() - 1) as f64;
    (0..count)
        .map(|k| {
            let idx = (k as f64 * last / (count - 1) as f64).round() as usize;
            beams[idx.min(beams.len() - 1)]
        })
        .collect()
}

/// Source of frame transforms, e.g. an adapter over a transform tree.
///
/// `lookup` resolves once the transform is known; it may stay pending for as long as it is not.
#[async_trait]
pub trait TransformProvider: Send + Sync {
    /// Pose of `source` expressed in `target`.
    async fn lookup(&self, target: &str, source: &str) -> Isometry3<f64>;
}

/// A fixed table of transforms.
#[derive(Clone, Debug, Default)]
pub struct StaticTransforms {
    table: HashMap<(String, String), Isometry3<f64>>,
}

impl StaticTransforms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, target: &str, source: &str, transform: Isometry3<f64>) -> Self {
        self.table
            .insert((target.to_string(), source.to_string()), transform);
        self
    }
}

#[async_trait]
impl TransformProvider for StaticTransforms {
    async fn lookup(&self, target: &str, source: &str) -> Isometry3<f64> {
        match self.table.get(&(target.to_string(), source.to_string())) {
            Some(transform) => *transform,
            None => {
                debug!("No static transform {target} -> {source}");
                std::future::pending().await
            }
        }
    }
}

async fn lookup_bounded(
    provider: &dyn TransformProvider,
    target: &str,
    source: &str,
    wait: Duration,
) -> Result<Isometry3<f64>> {
    tokio::time::timeout(wait, provider.lookup(target, source))
        .await
        .map_err(|_| RbpfError::StartupTransformUnavailable {
            target: target.to_string(),
            source_frame: source.to_string(),
            waited: wait,
        })
}

/// Resolve the startup transforms, waiting at most `wait` for each.
pub async fn resolve_frame_transforms(
    provider: &dyn TransformProvider,
    frames: &FrameIds,
    wait: Duration,
) -> Result<FrameTransforms> {
    info!("Waiting for transforms");
    let base_to_sensor = lookup_bounded(provider, &frames.base, &frames.sensor, wait).await?;
    let map_to_odom = lookup_bounded(provider, &frames.map, &frames.odom, wait).await?;
    info!("Transforms locked");
    Ok(FrameTransforms {
        base_to_sensor,
        map_to_odom,
    })
}
