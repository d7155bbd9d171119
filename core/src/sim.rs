//! Synthetic survey simulation and CSV export of filter diagnostics.
//!
//! This module provides:
//! - `Seabed`, a planar sloped seabed, and `SeabedModel`, an in-process map estimator that knows it exactly
//! - `SurveyScenario`, which generates odometry and multibeam pings along a straight survey line
//! - `run_survey`, which drives a filter through a scenario deterministically, without wall-clock timing
//! - CSV import/export of the `FilterStats` diagnostics
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::aggregate::{SwarmEstimate, aggregate};
use crate::config::FilterConfig;
use crate::controller::FilterController;
use crate::error::{RbpfError, Result};
use crate::estimator::{DepthPosterior, MapEstimatorClient, Reassignment, SharedEstimator};
use crate::frames::FrameTransforms;
use crate::messages::{FilterInput, FilterOutput, FilterStats, Odometry, Ping, WaypointPath};

/// A plane `z = depth + slope_x * x + slope_y * y` in the map frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Seabed {
    /// Seabed z at the origin (negative down).
    pub depth: f64,
    pub slope_x: f64,
    pub slope_y: f64,
}

impl Default for Seabed {
    fn default() -> Self {
        Seabed {
            depth: -20.0,
            slope_x: 0.2,
            slope_y: 0.0,
        }
    }
}

impl Seabed {
    pub fn depth_at(&self, x: f64, y: f64) -> f64 {
        self.depth + self.slope_x * x + self.slope_y * y
    }
}

/// Map estimator with perfect knowledge of a [`Seabed`].
///
/// Records every reassignment signal and plotting request it receives.
#[derive(Debug)]
pub struct SeabedModel {
    pub particle: usize,
    pub seabed: Seabed,
    /// Posterior variance reported at every point.
    pub variance: f64,
    reassignments: Mutex<Vec<Reassignment>>,
    plotted_points: Mutex<Option<usize>>,
}

impl SeabedModel {
    pub fn new(particle: usize, seabed: Seabed, variance: f64) -> Self {
        SeabedModel {
            particle,
            seabed,
            variance,
            reassignments: Mutex::new(Vec::new()),
            plotted_points: Mutex::new(None),
        }
    }

    pub fn reassignments(&self) -> Vec<Reassignment> {
        self.reassignments
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Number of points in the final map, once plotted.
    pub fn plotted_points(&self) -> Option<usize> {
        self.plotted_points.lock().ok().and_then(|p| *p)
    }

    fn poisoned(&self) -> RbpfError {
        RbpfError::MapQueryFailure {
            particle: self.particle,
            reason: "model state poisoned".to_string(),
        }
    }
}

#[async_trait]
impl MapEstimatorClient for SeabedModel {
    async fn sample_posterior(&self, points: Vec<Vector3<f64>>) -> Result<DepthPosterior> {
        Ok(DepthPosterior {
            mean: points
                .iter()
                .map(|p| self.seabed.depth_at(p.x, p.y))
                .collect(),
            variance: vec![self.variance; points.len()],
        })
    }

    async fn plot_posterior(&self, points: Vec<Vector3<f64>>) -> Result<()> {
        *self.plotted_points.lock().map_err(|_| self.poisoned())? = Some(points.len());
        Ok(())
    }

    async fn reassign(&self, signal: Reassignment) -> Result<()> {
        debug!(
            "Particle {} received signal {}",
            self.particle,
            signal.signal(self.particle)
        );
        self.reassignments
            .lock()
            .map_err(|_| self.poisoned())?
            .push(signal);
        Ok(())
    }
}

/// One step of a scripted survey.
#[derive(Debug)]
pub enum SurveyEvent {
    Input(FilterInput),
    /// A firing of the filter timer.
    Tick,
}

/// A straight survey line along +x over a [`Seabed`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyScenario {
    /// Forward speed in m/s.
    pub speed: f64,
    /// Relative error of the odometry speed, the source of dead-reckoning drift.
    pub velocity_bias: f64,
    pub duration_s: f64,
    pub odometry_rate_hz: f64,
    /// Odometry messages per ping.
    pub ping_every: usize,
    /// Odometry messages per timer tick.
    pub tick_every: usize,
    pub vehicle_z: f64,
    /// Across-track width covered by a ping, in meters.
    pub swath_width: f64,
    pub beams: usize,
    pub seabed: Seabed,
    pub map_variance: f64,
}

impl Default for SurveyScenario {
    fn default() -> Self {
        SurveyScenario {
            speed: 1.0,
            velocity_bias: 0.05,
            duration_s: 60.0,
            odometry_rate_hz: 10.0,
            ping_every: 2,
            tick_every: 5,
            vehicle_z: -5.0,
            swath_width: 40.0,
            beams: 512,
            seabed: Seabed::default(),
            map_variance: 0.0,
        }
    }
}

impl SurveyScenario {
    /// True vehicle x at time `t`.
    pub fn true_x(&self, t: f64) -> f64 {
        self.speed * t
    }

    /// Odometry at time `t`: true position, biased body velocity.
    pub fn odometry(&self, t: f64) -> Odometry {
        Odometry {
            stamp: t,
            position: Vector3::new(self.true_x(t), 0.0, self.vehicle_z),
            linear_velocity: Vector3::new(self.speed * (1.0 + self.velocity_bias), 0.0, 0.0),
            ..Odometry::default()
        }
    }

    /// A ping at time `t`, beams in the sensor frame reaching the seabed.
    pub fn ping(&self, t: f64) -> Ping {
        let x = self.true_x(t);
        let last = self.beams.saturating_sub(1).max(1) as f64;
        let beams = (0..self.beams)
            .map(|b| {
                let y = -self.swath_width / 2.0 + self.swath_width * b as f64 / last;
                Vector3::new(0.0, y, self.seabed.depth_at(x, y) - self.vehicle_z)
            })
            .collect();
        Ping { stamp: t, beams }
    }

    pub fn path(&self) -> WaypointPath {
        WaypointPath {
            waypoints: vec![
                Vector3::new(0.0, 0.0, self.vehicle_z),
                Vector3::new(self.true_x(self.duration_s), 0.0, self.vehicle_z),
            ],
        }
    }

    /// The whole survey in order, ending with the mission-finished signal.
    pub fn events(&self) -> Vec<SurveyEvent> {
        let steps = (self.duration_s * self.odometry_rate_hz).floor() as usize;
        let ping_every = self.ping_every.max(1);
        let tick_every = self.tick_every.max(1);
        let mut events = vec![SurveyEvent::Input(FilterInput::MissionPath(self.path()))];
        for k in 0..=steps {
            let t = k as f64 / self.odometry_rate_hz;
            events.push(SurveyEvent::Input(FilterInput::Odometry(self.odometry(t))));
            if k % ping_every == 0 {
                events.push(SurveyEvent::Input(FilterInput::Ping(self.ping(t))));
            }
            if k > 0 && k % tick_every == 0 {
                events.push(SurveyEvent::Tick);
            }
        }
        events.push(SurveyEvent::Input(FilterInput::MissionFinished));
        events
    }
}

/// What came out of a simulated survey.
#[derive(Clone, Debug)]
pub struct SurveyReport {
    pub stats: Vec<FilterStats>,
    pub resampling_events: usize,
    /// Reassignment signals received by each particle's map.
    pub reassignments: Vec<Vec<Reassignment>>,
    pub maps_plotted: usize,
    pub final_estimate: Option<SwarmEstimate>,
    /// True vehicle x at the end of the survey.
    pub true_x: f64,
}

const OUTPUT_BUFFER: usize = 1024;

/// Run `scenario` through a filter built from `config`, one event at a time.
pub async fn run_survey(config: FilterConfig, scenario: &SurveyScenario) -> Result<SurveyReport> {
    let models: Vec<Arc<SeabedModel>> = (0..config.particle_count)
        .map(|i| Arc::new(SeabedModel::new(i, scenario.seabed, scenario.map_variance)))
        .collect();
    let clients: Vec<SharedEstimator> = models
        .iter()
        .map(|m| m.clone() as SharedEstimator)
        .collect();
    let (tx, mut rx) = mpsc::channel(OUTPUT_BUFFER);
    let mut controller = FilterController::with_frames(config, FrameTransforms::default(), clients, tx)?;

    let mut stats = Vec::new();
    let mut maps_plotted = 0;
    for event in scenario.events() {
        match event {
            SurveyEvent::Input(input) => controller.handle_input(input).await,
            SurveyEvent::Tick => {
                controller.on_tick().await;
            }
        }
        while let Ok(output) = rx.try_recv() {
            match output {
                FilterOutput::Stats(s) => stats.push(s),
                FilterOutput::MapsPlotted { acknowledged, .. } => maps_plotted = acknowledged,
                _ => {}
            }
        }
    }

    let state = controller.into_state();
    info!(
        "Survey done: {} stats records, {} resampling events",
        stats.len(),
        state.resampling_events
    );
    Ok(SurveyReport {
        stats,
        resampling_events: state.resampling_events,
        reassignments: models.iter().map(|m| m.reassignments()).collect(),
        maps_plotted,
        final_estimate: aggregate(&state.swarm.poses()),
        true_x: scenario.true_x(scenario.duration_s),
    })
}

/// Write diagnostics records to a CSV file with a header row.
pub fn write_stats_csv<P: AsRef<Path>>(stats: &[FilterStats], path: P) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for record in stats {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read diagnostics records written by [`write_stats_csv`].
pub fn read_stats_csv<P: AsRef<Path>>(path: P) -> Result<Vec<FilterStats>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for result in reader.deserialize() {
        records.push(result?);
    }
    Ok(records)
}
