//! Per-particle map estimator clients and the indexed worker pool.
//!
//! Every particle owns one map estimator, a stateful worker living outside the filter. The filter talks to it
//! through [`MapEstimatorClient`]: sample the depth posterior at a set of points, plot the final posterior, and
//! keep or clone map state after resampling. [`EstimatorHandle`] is a channel-backed client for transport
//! adapters and in-process workers; [`EstimatorPool`] fans requests out to all clients with bounded concurrency
//! and a timeout on every call.
//!
//! A call that times out is dropped, which closes its reply channel; workers can check
//! `oneshot::Sender::is_closed` to abandon work nobody is waiting for.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use nalgebra::Vector3;
use tokio::sync::{mpsc, oneshot};

use crate::config::EstimatorConfig;
use crate::error::{RbpfError, Result};
use crate::resampling::ResamplingOutcome;

/// Expected depth and its variance at each queried point.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DepthPosterior {
    pub mean: Vec<f64>,
    pub variance: Vec<f64>,
}

impl DepthPosterior {
    /// True if the posterior gives a usable value for each of `points` queried points.
    pub fn covers(&self, points: usize) -> bool {
        self.mean.len() == points
            && self.variance.len() == points
            && self.mean.iter().all(|m| m.is_finite())
            && self.variance.iter().all(|v| v.is_finite() && *v >= 0.0)
    }
}

/// Ownership instruction sent to a map worker after resampling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reassignment {
    /// Keep the current map state.
    Retain,
    /// Discard the current map state and copy the state of another worker.
    CloneFrom(usize),
}

impl Reassignment {
    /// Index signal published to the worker of particle `own`: its own index to retain, the source to clone.
    pub fn signal(&self, own: usize) -> usize {
        match self {
            Reassignment::Retain => own,
            Reassignment::CloneFrom(source) => *source,
        }
    }
}

/// Request/response handle to one particle's map estimator.
#[async_trait]
pub trait MapEstimatorClient: Send + Sync {
    /// Expected depth mean and variance at every point (map frame).
    async fn sample_posterior(&self, points: Vec<Vector3<f64>>) -> Result<DepthPosterior>;

    /// Plot the final posterior over the given points. Resolves on acknowledgement.
    async fn plot_posterior(&self, points: Vec<Vector3<f64>>) -> Result<()>;

    /// Deliver an ownership instruction. Resolves once the worker has applied it.
    async fn reassign(&self, signal: Reassignment) -> Result<()>;
}

pub type SharedEstimator = Arc<dyn MapEstimatorClient>;

/// Requests delivered to a channel-backed map worker.
#[derive(Debug)]
pub enum EstimatorRequest {
    SamplePosterior {
        points: Vec<Vector3<f64>>,
        respond: oneshot::Sender<DepthPosterior>,
    },
    PlotPosterior {
        points: Vec<Vector3<f64>>,
        respond: oneshot::Sender<()>,
    },
    Reassign {
        signal: Reassignment,
        respond: oneshot::Sender<()>,
    },
}

/// Channel-backed [`MapEstimatorClient`].
#[derive(Clone, Debug)]
pub struct EstimatorHandle {
    particle: usize,
    sender: mpsc::Sender<EstimatorRequest>,
}

/// Create a handle for particle `particle` and the receiving end its worker serves.
#[must_use]
pub fn estimator_channel(
    particle: usize,
    capacity: usize,
) -> (EstimatorHandle, mpsc::Receiver<EstimatorRequest>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (EstimatorHandle { particle, sender }, receiver)
}

impl EstimatorHandle {
    pub fn particle(&self) -> usize {
        self.particle
    }

    async fn request<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> EstimatorRequest + Send,
        T: Send,
    {
        let (respond, response) = oneshot::channel();
        self.sender
            .send(build(respond))
            .await
            .map_err(|_| RbpfError::MapQueryFailure {
                particle: self.particle,
                reason: "worker channel closed".to_string(),
            })?;
        response.await.map_err(|_| RbpfError::MapQueryFailure {
            particle: self.particle,
            reason: "worker dropped the request".to_string(),
        })
    }
}

#[async_trait]
impl MapEstimatorClient for EstimatorHandle {
    async fn sample_posterior(&self, points: Vec<Vector3<f64>>) -> Result<DepthPosterior> {
        self.request(|respond| EstimatorRequest::SamplePosterior { points, respond })
            .await
    }

    async fn plot_posterior(&self, points: Vec<Vector3<f64>>) -> Result<()> {
        self.request(|respond| EstimatorRequest::PlotPosterior { points, respond })
            .await
    }

    async fn reassign(&self, signal: Reassignment) -> Result<()> {
        self.request(|respond| EstimatorRequest::Reassign { signal, respond })
            .await
            .map_err(|e| RbpfError::ReassignmentFailed {
                particle: self.particle,
                reason: e.to_string(),
            })
    }
}

/// What happened to the ownership instructions of one resampling event.
#[derive(Debug, Default)]
pub struct ReassignmentReport {
    /// Workers that acknowledged keeping their state.
    pub retained: Vec<usize>,
    /// (lost, source) pairs that acknowledged the clone.
    pub cloned: Vec<(usize, usize)>,
    pub failed: Vec<(usize, RbpfError)>,
}

impl ReassignmentReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One map estimator client per particle, addressed by particle index.
pub struct EstimatorPool {
    clients: Vec<SharedEstimator>,
    config: EstimatorConfig,
}

impl EstimatorPool {
    pub fn new(clients: Vec<SharedEstimator>, config: EstimatorConfig) -> Self {
        EstimatorPool { clients, config }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    async fn bounded<T>(
        particle: usize,
        timeout: Duration,
        request: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(RbpfError::MapQueryTimeout { particle, timeout }),
        }
    }

    /// Sample every particle's posterior at its own query points; `queries[i]` goes to particle `i`.
    ///
    /// Results are returned in particle order. A `None` query is not sent and yields `None`.
    pub async fn sample_all(
        &self,
        queries: Vec<Option<Vec<Vector3<f64>>>>,
    ) -> Vec<Option<Result<DepthPosterior>>> {
        let timeout = self.config.query_timeout();
        stream::iter(queries.into_iter().enumerate())
            .map(|(i, points)| async move {
                let points = points?;
                Some(match self.clients.get(i) {
                    Some(client) => Self::bounded(i, timeout, client.sample_posterior(points)).await,
                    None => Err(RbpfError::UnknownParticle(i)),
                })
            })
            .buffered(self.config.max_in_flight.max(1))
            .collect()
            .await
    }

    /// Send the final map of every particle for plotting; `clouds[i]` goes to particle `i`.
    pub async fn plot_all(&self, clouds: Vec<Vec<Vector3<f64>>>) -> Vec<Result<()>> {
        let timeout = self.config.plot_timeout();
        stream::iter(clouds.into_iter().enumerate())
            .map(|(i, points)| async move {
                match self.clients.get(i) {
                    Some(client) => Self::bounded(i, timeout, client.plot_posterior(points)).await,
                    None => Err(RbpfError::UnknownParticle(i)),
                }
            })
            .buffered(self.config.max_in_flight.max(1))
            .collect()
            .await
    }

    async fn signal(&self, particle: usize, signal: Reassignment) -> Result<()> {
        let client = self
            .clients
            .get(particle)
            .ok_or(RbpfError::UnknownParticle(particle))?;
        let timeout = self.config.reassign_timeout();
        match tokio::time::timeout(timeout, client.reassign(signal)).await {
            Ok(result) => result,
            Err(_) => Err(RbpfError::ReassignmentFailed {
                particle,
                reason: format!("no acknowledgement within {timeout:?}"),
            }),
        }
    }

    /// Tell the map workers which state to keep after a resampling event.
    ///
    /// Phase one asks every kept worker to retain its map and waits for all acknowledgements. Only then does
    /// phase two ask each lost worker, one at a time, to clone its paired source. A clone is skipped when its
    /// source never acknowledged the retain. Nothing is sent when no particle was lost.
    pub async fn reassign(&self, outcome: &ResamplingOutcome) -> ReassignmentReport {
        let mut report = ReassignmentReport::default();
        if outcome.lost.is_empty() {
            return report;
        }

        let retains: Vec<(usize, Result<()>)> = stream::iter(outcome.kept.iter().copied())
            .map(|k| async move { (k, self.signal(k, Reassignment::Retain).await) })
            .buffered(self.config.max_in_flight.max(1))
            .collect()
            .await;
        for (k, result) in retains {
            match result {
                Ok(()) => report.retained.push(k),
                Err(e) => {
                    warn!("Particle {k} did not retain its map: {e}");
                    report.failed.push((k, e));
                }
            }
        }

        let spacing = self.config.clone_spacing();
        for (n, &(lost, source)) in outcome.pairings.iter().enumerate() {
            if !report.retained.contains(&source) {
                report.failed.push((
                    lost,
                    RbpfError::ReassignmentFailed {
                        particle: lost,
                        reason: format!("source {source} did not acknowledge retain"),
                    },
                ));
                continue;
            }
            if n > 0 && !spacing.is_zero() {
                tokio::time::sleep(spacing).await;
            }
            match self.signal(lost, Reassignment::CloneFrom(source)).await {
                Ok(()) => {
                    debug!("Particle {lost} cloned map of {source}");
                    report.cloned.push((lost, source));
                }
                Err(e) => {
                    warn!("Particle {lost} failed to clone map of {source}: {e}");
                    report.failed.push((lost, e));
                }
            }
        }
        report
    }
}
