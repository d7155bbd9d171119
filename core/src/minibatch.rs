//! Training minibatches for the map estimators.
//!
//! A map worker asks for a batch of points from its own particle's view of the survey: a random subset of the
//! stored pings, each placed under that particle's trajectory and thinned to a fixed number of points.
use log::debug;
use nalgebra::Vector3;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};

use crate::error::{RbpfError, Result};
use crate::history::PingHistory;
use crate::particle::ParticleSwarm;

/// Points drawn from every ping of a minibatch.
pub const POINTS_PER_PING: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinibatchRequest {
    pub particle: usize,
    /// Requested number of points.
    pub batch_size: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MinibatchResult {
    /// Points in the map frame.
    pub points: Vec<Vector3<f64>>,
    pub success: bool,
}

#[derive(Clone, Debug)]
pub struct MinibatchServer {
    rng: StdRng,
}

impl MinibatchServer {
    pub fn new(seed: u64) -> Self {
        MinibatchServer {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw `batch_size / 20` distinct pings and 20 distinct points from each.
    ///
    /// Needs strictly more stored pings than pings drawn.
    pub fn try_serve(
        &mut self,
        swarm: &ParticleSwarm,
        history: &PingHistory,
        request: &MinibatchRequest,
    ) -> Result<Vec<Vector3<f64>>> {
        let particle = swarm
            .particles
            .get(request.particle)
            .ok_or(RbpfError::UnknownParticle(request.particle))?;
        let pings = request.batch_size / POINTS_PER_PING;
        if history.len() <= pings {
            return Err(RbpfError::InsufficientHistory {
                available: history.len(),
                required: pings + 1,
            });
        }

        let mut points = Vec::with_capacity(pings * POINTS_PER_PING);
        for j in index::sample(&mut self.rng, history.len(), pings) {
            let record = history
                .get(j)
                .ok_or(RbpfError::InsufficientHistory {
                    available: history.len(),
                    required: j + 1,
                })?;
            let in_map = record
                .in_map(particle)
                .ok_or(RbpfError::InsufficientHistory {
                    available: particle.pose_history.len(),
                    required: record.step + 1,
                })?;
            if in_map.len() < POINTS_PER_PING {
                return Err(RbpfError::Config(format!(
                    "ping {j} holds {} beams, fewer than {POINTS_PER_PING}",
                    in_map.len()
                )));
            }
            points.extend(
                index::sample(&mut self.rng, in_map.len(), POINTS_PER_PING)
                    .into_iter()
                    .map(|b| in_map[b]),
            );
        }
        Ok(points)
    }

    /// Serve a request, turning any failure into `success = false`.
    pub fn serve(
        &mut self,
        swarm: &ParticleSwarm,
        history: &PingHistory,
        request: &MinibatchRequest,
    ) -> MinibatchResult {
        match self.try_serve(swarm, history, request) {
            Ok(points) => MinibatchResult {
                points,
                success: true,
            },
            Err(e) => {
                debug!("Minibatch for particle {} not served: {e}", request.particle);
                MinibatchResult::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::frames::FrameTransforms;
    use crate::history::PingRecord;
    use std::collections::HashSet;

    fn survey(pings: usize) -> (ParticleSwarm, PingHistory) {
        let config = FilterConfig {
            particle_count: 3,
            ..FilterConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        let mut swarm = ParticleSwarm::new(&config, FrameTransforms::default(), &mut rng);
        let frames = *swarm.frames();
        let mut history = PingHistory::new();
        for k in 0..pings {
            if k > 0 {
                for p in &mut swarm.particles {
                    p.pose[0] += 1.0;
                    p.record_pose(&frames);
                }
            }
            history.push(PingRecord {
                stamp: k as f64,
                beams: (0..config.beams_per_ping)
                    .map(|b| Vector3::new(0.0, b as f64, -10.0))
                    .collect(),
                step: swarm.current_step(),
                vehicle_z: 0.0,
            });
        }
        (swarm, history)
    }

    fn request(batch_size: usize) -> MinibatchRequest {
        MinibatchRequest {
            particle: 1,
            batch_size,
        }
    }

    #[test]
    fn needs_more_pings_than_drawn() {
        let (swarm, history) = survey(5);
        let mut server = MinibatchServer::new(0);
        let result = server.serve(&swarm, &history, &request(100));
        assert!(!result.success);
        assert!(result.points.is_empty());
        assert!(matches!(
            server.try_serve(&swarm, &history, &request(100)),
            Err(RbpfError::InsufficientHistory {
                available: 5,
                required: 6
            })
        ));

        let result = server.serve(&swarm, &history, &request(80));
        assert!(result.success);
        assert_eq!(result.points.len(), 80);
    }

    #[test]
    fn points_come_from_distinct_pings_and_beams() {
        let (swarm, history) = survey(10);
        let mut server = MinibatchServer::new(0);
        let result = server.serve(&swarm, &history, &request(200));
        assert!(result.success);
        assert_eq!(result.points.len(), 200);
        let distinct: HashSet<(i64, i64)> = result
            .points
            .iter()
            .map(|p| ((p.x * 1e6) as i64, (p.y * 1e6) as i64))
            .collect();
        assert_eq!(distinct.len(), 200);
    }

    #[test]
    fn seeded_servers_agree() {
        let (swarm, history) = survey(12);
        let mut a = MinibatchServer::new(42);
        let mut b = MinibatchServer::new(42);
        for size in [60, 100, 220] {
            assert_eq!(
                a.serve(&swarm, &history, &request(size)),
                b.serve(&swarm, &history, &request(size))
            );
        }
    }

    #[test]
    fn unknown_particle_fails() {
        let (swarm, history) = survey(4);
        let mut server = MinibatchServer::new(0);
        let result = server.serve(
            &swarm,
            &history,
            &MinibatchRequest {
                particle: 9,
                batch_size: 20,
            },
        );
        assert!(!result.success);
    }
}
