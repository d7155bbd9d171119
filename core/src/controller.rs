//! The filter's single processing loop.
//!
//! All inputs arrive on one queue and are handled one at a time, interleaved with a periodic timer that drives
//! weighting and resampling. Each transition runs to completion before the next input is looked at, so a
//! mission-finished signal can never land in the middle of a resampling event.
use log::{debug, info, trace, warn};
use nalgebra::Vector3;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::aggregate::aggregate;
use crate::config::FilterConfig;
use crate::error::{RbpfError, Result};
use crate::estimator::{EstimatorPool, SharedEstimator};
use crate::frames::{FrameTransforms, TransformProvider, resolve_frame_transforms, subsample_beams};
use crate::history::{PingHistory, PingRecord};
use crate::messages::{FilterInput, FilterOutput, FilterStats, Odometry, Ping, WaypointPath};
use crate::minibatch::{MinibatchRequest, MinibatchResult, MinibatchServer};
use crate::motion::MotionPredictor;
use crate::particle::ParticleSwarm;
use crate::resampling::{ResamplingEngine, ResamplingOutcome};
use crate::weights::WeightEvaluator;

/// Everything the filter knows, owned by the processing loop.
#[derive(Clone, Debug)]
pub struct FilterState {
    pub swarm: ParticleSwarm,
    pub history: PingHistory,
    /// Latest odometry; its stamp is the filter clock.
    pub last_odometry: Option<Odometry>,
    /// Stamp of the latest ping used for weighting.
    pub processed_ping_stamp: Option<f64>,
    /// Set by the first non-empty mission path.
    pub training_started: bool,
    pub finished: bool,
    /// Set by a manual loop closure, cleared at the next weight evaluation.
    pub loop_closure: bool,
    pub resampling_events: usize,
}

impl FilterState {
    fn new(swarm: ParticleSwarm) -> Self {
        FilterState {
            swarm,
            history: PingHistory::new(),
            last_odometry: None,
            processed_ping_stamp: None,
            training_started: false,
            finished: false,
            loop_closure: false,
            resampling_events: 0,
        }
    }

    /// True if the latest stored ping has not been weighted yet.
    pub fn has_unprocessed_ping(&self) -> bool {
        match (self.history.latest(), self.processed_ping_stamp) {
            (Some(latest), Some(processed)) => latest.stamp > processed,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

pub struct FilterController {
    config: FilterConfig,
    state: FilterState,
    pool: EstimatorPool,
    predictor: MotionPredictor,
    evaluator: WeightEvaluator,
    engine: ResamplingEngine,
    minibatch: MinibatchServer,
    rng: StdRng,
    outputs: mpsc::Sender<FilterOutput>,
}

impl FilterController {
    /// Resolve the frame transforms and build the filter.
    ///
    /// Fails if the configuration is invalid, if there is not one estimator client per particle, or if the
    /// transforms cannot be resolved within the configured wait.
    pub async fn start(
        config: FilterConfig,
        provider: &dyn TransformProvider,
        clients: Vec<SharedEstimator>,
        outputs: mpsc::Sender<FilterOutput>,
    ) -> Result<Self> {
        config.validate()?;
        let frames =
            resolve_frame_transforms(provider, &config.frames, config.transform_timeout()).await?;
        Self::with_frames(config, frames, clients, outputs)
    }

    /// Build the filter with already known frame transforms.
    pub fn with_frames(
        config: FilterConfig,
        frames: FrameTransforms,
        clients: Vec<SharedEstimator>,
        outputs: mpsc::Sender<FilterOutput>,
    ) -> Result<Self> {
        config.validate()?;
        if clients.len() != config.particle_count {
            return Err(RbpfError::Config(format!(
                "{} estimator clients for {} particles",
                clients.len(),
                config.particle_count
            )));
        }
        let mut rng = StdRng::seed_from_u64(config.seed);
        let swarm = ParticleSwarm::new(&config, frames, &mut rng);
        info!(
            "RBPF with {} particles, {} beams per ping, period {:?}",
            config.particle_count,
            config.beams_per_ping,
            config.period()
        );
        Ok(FilterController {
            pool: EstimatorPool::new(clients, config.estimator.clone()),
            evaluator: WeightEvaluator::new(config.measurement_std, frames),
            engine: ResamplingEngine::new(&config),
            minibatch: MinibatchServer::new(config.seed.wrapping_add(1)),
            predictor: MotionPredictor,
            state: FilterState::new(swarm),
            rng,
            outputs,
            config,
        })
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    pub fn into_state(self) -> FilterState {
        self.state
    }

    /// Process inputs and timer ticks until the input queue closes.
    pub async fn run(mut self, mut inputs: mpsc::Receiver<FilterInput>) -> FilterState {
        let mut ticker = tokio::time::interval(self.config.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => self.handle_input(input).await,
                    None => {
                        info!("Input queue closed, stopping filter");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.on_tick().await;
                }
            }
        }
        self.state
    }

    pub async fn handle_input(&mut self, input: FilterInput) {
        match input {
            FilterInput::Odometry(odometry) => self.on_odometry(odometry),
            FilterInput::Ping(ping) => self.on_ping(ping),
            FilterInput::MissionPath(path) => self.on_path(&path).await,
            FilterInput::MissionFinished => self.on_finished().await,
            FilterInput::ManualLoopClosure => self.on_loop_closure(),
            FilterInput::Minibatch { request, respond } => {
                let result = self.on_minibatch(&request);
                if respond.send(result).is_err() {
                    debug!("Minibatch requester for particle {} went away", request.particle);
                }
            }
        }
    }

    /// Publish a per-cycle output. Dropped if the consumer is behind.
    fn emit(&self, output: FilterOutput) {
        if let Err(e) = self.outputs.try_send(output) {
            warn!("Dropped filter output: {e}");
        }
    }

    /// Publish an output that is only produced once, waiting for room in the queue.
    ///
    /// Returns false if the consumer is gone.
    async fn emit_once(&self, output: FilterOutput) -> bool {
        match self.outputs.send(output).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Filter output not delivered, consumer closed: {e}");
                false
            }
        }
    }

    /// Predict with the new odometry and publish diagnostics.
    ///
    /// The first message only starts the clock. Ignored once the mission is finished, apart from the clock.
    pub fn on_odometry(&mut self, odometry: Odometry) {
        let previous = self.state.last_odometry.replace(odometry);
        if self.state.finished {
            return;
        }
        if let Some(previous) = previous {
            let dt = odometry.stamp - previous.stamp;
            if !self
                .predictor
                .predict_swarm(&mut self.state.swarm, &odometry, dt, &mut self.rng)
            {
                trace!("Odometry at {} not newer than {}", odometry.stamp, previous.stamp);
            }
        }
        self.publish_diagnostics(&odometry);
    }

    fn publish_diagnostics(&self, odometry: &Odometry) {
        let poses = self.state.swarm.poses();
        let Some(estimate) = aggregate(&poses) else {
            return;
        };
        let [cov_xx, cov_xy, cov_xz, cov_yy, cov_yz, cov_zz] = estimate.covariance_terms();
        let dr = self.state.swarm.dead_reckoning.position();
        let stats = FilterStats {
            stamp: odometry.stamp,
            n_eff_filtered: self.engine.filtered_ess(),
            resample_threshold: self.engine.threshold(),
            odom_x: odometry.position.x,
            odom_y: odometry.position.y,
            odom_z: odometry.position.z,
            mean_x: estimate.mean[0],
            mean_y: estimate.mean[1],
            mean_z: estimate.mean[2],
            dr_x: dr.x,
            dr_y: dr.y,
            dr_z: dr.z,
            cov_xx,
            cov_xy,
            cov_xz,
            cov_yy,
            cov_yz,
            cov_zz,
        };
        self.emit(FilterOutput::ParticlePoses {
            stamp: odometry.stamp,
            poses,
        });
        self.emit(FilterOutput::AveragePose {
            stamp: odometry.stamp,
            estimate,
        });
        self.emit(FilterOutput::Stats(stats));
    }

    /// Thin a ping and store it against the current pose-history step.
    pub fn on_ping(&mut self, ping: Ping) {
        if self.state.finished {
            return;
        }
        if ping.beams.is_empty() {
            warn!("Empty ping at {} ignored", ping.stamp);
            return;
        }
        if ping.beams.len() != self.config.beams_real {
            debug!(
                "Ping at {} has {} beams, expected {}",
                ping.stamp,
                ping.beams.len(),
                self.config.beams_real
            );
        }
        let vehicle_z = self
            .state
            .last_odometry
            .map(|o| o.position.z)
            .unwrap_or(0.0);
        self.state.history.push(PingRecord {
            stamp: ping.stamp,
            beams: subsample_beams(&ping.beams, self.config.beams_per_ping),
            step: self.state.swarm.current_step(),
            vehicle_z,
        });
    }

    /// Hand the mission waypoints to the map workers as inducing points and start training.
    ///
    /// Training only starts once the inducing points are delivered.
    pub async fn on_path(&mut self, path: &WaypointPath) {
        if path.waypoints.is_empty() {
            warn!("Empty mission received");
            return;
        }
        if self.state.training_started {
            debug!("Mission path already received");
            return;
        }
        let inducing: Vec<Vector3<f64>> = path
            .waypoints
            .iter()
            .map(|wp| Vector3::new(wp.x, wp.y, 0.0))
            .collect();
        info!("Sending {} inducing points", inducing.len());
        if self.emit_once(FilterOutput::InducingPoints(inducing)).await {
            self.state.training_started = true;
        }
    }

    pub fn on_loop_closure(&mut self) {
        info!("Manual loop closure");
        self.state.loop_closure = true;
    }

    /// Weigh against the latest ping and resample if needed.
    ///
    /// Returns the resampling outcome when a resampling event took place.
    pub async fn on_tick(&mut self) -> Option<ResamplingOutcome> {
        if self.state.finished || !self.state.has_unprocessed_ping() {
            return None;
        }
        let ping = self.state.history.latest()?.clone();
        self.state.processed_ping_stamp = Some(ping.stamp);
        if !self.state.training_started {
            return None;
        }

        let report = self
            .evaluator
            .compute_weights(&self.state.swarm, &ping, &self.pool)
            .await;
        self.state.loop_closure = false;
        let outcome = self
            .engine
            .evaluate(&report, &mut self.state.swarm, &mut self.rng)?;
        self.state.resampling_events += 1;
        self.engine.dispatch(&outcome, &self.pool).await;
        Some(outcome)
    }

    /// Freeze the filter and have every particle's final map plotted.
    pub async fn on_finished(&mut self) {
        if self.state.finished {
            debug!("Mission already finished");
            return;
        }
        info!("Survey finished, plotting final maps");
        self.state.finished = true;

        let clouds = self
            .state
            .swarm
            .particles
            .iter()
            .map(|p| self.state.history.full_map(p))
            .collect();
        let results = self.pool.plot_all(clouds).await;
        let mut acknowledged = 0;
        let mut failed = Vec::new();
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(()) => acknowledged += 1,
                Err(e) => {
                    warn!("Particle {i} did not plot its map: {e}");
                    failed.push(i);
                }
            }
        }
        info!("{acknowledged} maps plotted");
        self.emit_once(FilterOutput::MapsPlotted {
            acknowledged,
            failed,
        })
        .await;
    }

    pub fn on_minibatch(&mut self, request: &MinibatchRequest) -> MinibatchResult {
        self.minibatch
            .serve(&self.state.swarm, &self.state.history, request)
    }
}
