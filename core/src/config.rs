//! Filter configuration.
//!
//! All options have defaults matching the values used on the survey vehicle, so a configuration file only needs
//! to list what differs. Files are read and written by extension (`.toml` or `.json`).
//!
//! ```rust
//! use bathy_rbpf::FilterConfig;
//!
//! let config: FilterConfig = toml::from_str("particle_count = 40\nperiod_ms = 250").unwrap();
//! assert_eq!(config.particle_count, 40);
//! assert_eq!(config.beams_per_ping, 20);
//! assert!(config.validate().is_ok());
//! ```
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use nalgebra::Vector6;
use serde::{Deserialize, Serialize};

use crate::error::{RbpfError, Result};
use crate::minibatch::POINTS_PER_PING;

/// Frame identifiers used for the startup transform lookup and for labelling outputs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameIds {
    pub map: String,
    pub odom: String,
    pub base: String,
    pub sensor: String,
}

impl Default for FrameIds {
    fn default() -> Self {
        FrameIds {
            map: "map".to_string(),
            odom: "odom".to_string(),
            base: "base_link".to_string(),
            sensor: "mbes_link".to_string(),
        }
    }
}

/// Timing and concurrency of the calls made to the per-particle map estimators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Timeout of a single posterior sampling request.
    pub query_timeout_ms: u64,
    /// Maximum number of requests in flight at once.
    pub max_in_flight: usize,
    /// Timeout for a retain or clone acknowledgement.
    pub reassign_timeout_ms: u64,
    /// Pause between consecutive clone signals, on top of waiting for each acknowledgement.
    pub clone_spacing_ms: u64,
    /// Timeout of a final posterior plotting request.
    pub plot_timeout_ms: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            query_timeout_ms: 2_000,
            max_in_flight: 8,
            reassign_timeout_ms: 2_000,
            clone_spacing_ms: 0,
            plot_timeout_ms: 60_000,
        }
    }
}

impl EstimatorConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
    pub fn reassign_timeout(&self) -> Duration {
        Duration::from_millis(self.reassign_timeout_ms)
    }
    pub fn clone_spacing(&self) -> Duration {
        Duration::from_millis(self.clone_spacing_ms)
    }
    pub fn plot_timeout(&self) -> Duration {
        Duration::from_millis(self.plot_timeout_ms)
    }
}

/// Names of the streams and servers the transport adapter wires the filter to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicNames {
    pub odometry: String,
    pub mbes_pings: String,
    pub path: String,
    pub survey_finished: String,
    pub manual_loop_closure: String,
    pub particle_poses: String,
    pub average_pose: String,
    pub stats: String,
    pub inducing_points: String,
    /// Prefix of the per-particle reassignment topics, `<prefix>/particle_<i>`.
    pub resampling: String,
    pub minibatch_server: String,
    pub sample_server: String,
    pub plot_server: String,
}

impl Default for TopicNames {
    fn default() -> Self {
        TopicNames {
            odometry: "odom".to_string(),
            mbes_pings: "mbes_pings".to_string(),
            path: "/waypoints".to_string(),
            survey_finished: "/survey_finished".to_string(),
            manual_loop_closure: "manual_lc".to_string(),
            particle_poses: "/particle_poses".to_string(),
            average_pose: "/average_pose".to_string(),
            stats: "stats".to_string(),
            inducing_points: "/inducing_points".to_string(),
            resampling: "/gp_resampling".to_string(),
            minibatch_server: "/minibatch_server".to_string(),
            sample_server: "/gp_sample_server".to_string(),
            plot_server: "/gp_plot_server".to_string(),
        }
    }
}

/// RBPF configuration parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub particle_count: usize,
    pub frames: FrameIds,
    /// Beams kept from every ping (evenly spaced across the swath).
    pub beams_per_ping: usize,
    /// Expected width of the raw pings.
    pub beams_real: usize,
    /// Period of the weighting and resampling timer.
    pub period_ms: u64,
    pub measurement_std: f64,
    /// Diagonal of the initial pose covariance [x, y, z, roll, pitch, yaw].
    pub init_covariance: [f64; 6],
    /// Diagonal of the per-step motion noise covariance.
    pub motion_covariance: [f64; 6],
    /// Diagonal of the jitter covariance applied after every resampling.
    pub resampling_noise_covariance: [f64; 6],
    /// Create the last particle without any init or process noise.
    pub anchor_particle: bool,
    /// How long to wait for the startup frame transforms.
    pub transform_timeout_ms: u64,
    pub seed: u64,
    pub estimator: EstimatorConfig,
    pub topics: TopicNames,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            particle_count: 10,
            frames: FrameIds::default(),
            beams_per_ping: 20,
            beams_real: 512,
            period_ms: 500,
            measurement_std: 0.01,
            init_covariance: [0.5, 0.5, 0.0, 0.0, 0.0, 0.001],
            motion_covariance: [1e-4, 1e-4, 0.0, 0.0, 0.0, 1e-6],
            resampling_noise_covariance: [0.01, 0.01, 0.0, 0.0, 0.0, 1e-5],
            anchor_particle: true,
            transform_timeout_ms: 35_000,
            seed: 42,
            estimator: EstimatorConfig::default(),
            topics: TopicNames::default(),
        }
    }
}

/// Standard deviations from the diagonal of a covariance.
fn std_from_diagonal(diagonal: &[f64; 6]) -> Vector6<f64> {
    Vector6::from_iterator(diagonal.iter().map(|v| v.sqrt()))
}

impl FilterConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
    pub fn transform_timeout(&self) -> Duration {
        Duration::from_millis(self.transform_timeout_ms)
    }
    pub fn init_std(&self) -> Vector6<f64> {
        std_from_diagonal(&self.init_covariance)
    }
    pub fn motion_std(&self) -> Vector6<f64> {
        std_from_diagonal(&self.motion_covariance)
    }
    pub fn resampling_std(&self) -> Vector6<f64> {
        std_from_diagonal(&self.resampling_noise_covariance)
    }

    /// Check the configuration for values the filter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.particle_count < 2 {
            return Err(RbpfError::Config(format!(
                "particle_count must be at least 2, got {}",
                self.particle_count
            )));
        }
        if self.beams_per_ping < POINTS_PER_PING {
            return Err(RbpfError::Config(format!(
                "beams_per_ping must be at least {POINTS_PER_PING}, got {}",
                self.beams_per_ping
            )));
        }
        if self.period_ms == 0 {
            return Err(RbpfError::Config("period_ms must be positive".to_string()));
        }
        if self.estimator.max_in_flight == 0 {
            return Err(RbpfError::Config(
                "estimator.max_in_flight must be positive".to_string(),
            ));
        }
        if !(self.measurement_std.is_finite() && self.measurement_std > 0.0) {
            return Err(RbpfError::Config(format!(
                "measurement_std must be finite and positive, got {}",
                self.measurement_std
            )));
        }
        for (name, cov) in [
            ("init_covariance", &self.init_covariance),
            ("motion_covariance", &self.motion_covariance),
            ("resampling_noise_covariance", &self.resampling_noise_covariance),
        ] {
            if cov.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(RbpfError::Config(format!(
                    "{name} entries must be finite and non-negative, got {cov:?}"
                )));
            }
        }
        Ok(())
    }

    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self)?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut s = String::new();
        File::open(path)?.read_to_string(&mut s)?;
        Ok(toml::from_str(&s)?)
    }
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
    /// Generic write: choose format by file extension (.json/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("toml") => self.to_toml(p),
            _ => Err(RbpfError::Config(format!(
                "unsupported configuration file extension: {}",
                p.display()
            ))),
        }
    }
    /// Generic read: choose format by file extension (.json/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(RbpfError::Config(format!(
                "unsupported configuration file extension: {}",
                p.display()
            ))),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}
