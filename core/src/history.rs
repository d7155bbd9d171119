//! Append-only multibeam ping history.
//!
//! Every stored ping remembers the pose-history step it was taken at. Since all particles advance their pose
//! histories in lockstep, that one step index places the ping under every particle's trajectory.
use nalgebra::Vector3;

use crate::particle::Particle;

/// A subsampled ping, ready to be placed under any particle's trajectory.
#[derive(Clone, Debug, PartialEq)]
pub struct PingRecord {
    pub stamp: f64,
    /// Beams in the sensor frame.
    pub beams: Vec<Vector3<f64>>,
    /// Pose-history step the ping aligns with.
    pub step: usize,
    /// Absolute vehicle z from odometry when the ping arrived.
    pub vehicle_z: f64,
}

impl PingRecord {
    /// The ping in the map frame under `particle`'s trajectory.
    pub fn in_map(&self, particle: &Particle) -> Option<Vec<Vector3<f64>>> {
        particle
            .snapshot(self.step)
            .map(|snapshot| snapshot.transform_points(&self.beams))
    }
}

#[derive(Clone, Debug, Default)]
pub struct PingHistory {
    records: Vec<PingRecord>,
}

impl PingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: PingRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PingRecord> {
        self.records.get(index)
    }

    pub fn latest(&self) -> Option<&PingRecord> {
        self.records.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PingRecord> {
        self.records.iter()
    }

    /// Every ping placed under `particle`'s trajectory, concatenated.
    pub fn full_map(&self, particle: &Particle) -> Vec<Vector3<f64>> {
        self.records
            .iter()
            .filter_map(|record| record.in_map(particle))
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::FrameTransforms;
    use nalgebra::Vector6;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn record(step: usize, x: f64) -> PingRecord {
        PingRecord {
            stamp: step as f64,
            beams: vec![Vector3::new(x, 0.0, -5.0), Vector3::new(x, 1.0, -5.0)],
            step,
            vehicle_z: -2.0,
        }
    }

    #[test]
    fn pings_follow_the_particle_trajectory() {
        let frames = FrameTransforms::default();
        let mut rng = StdRng::seed_from_u64(0);
        let mut particle =
            Particle::new(0, &Vector6::zeros(), Vector6::zeros(), 1.0, &frames, &mut rng);
        particle.pose[0] = 10.0;
        particle.record_pose(&frames);

        let mut history = PingHistory::new();
        history.push(record(0, 0.0));
        history.push(record(1, 0.0));
        assert_eq!(history.len(), 2);
        assert_eq!(history.latest().unwrap().step, 1);

        let first = history.get(0).unwrap().in_map(&particle).unwrap();
        let second = history.get(1).unwrap().in_map(&particle).unwrap();
        assert_eq!(first[0].x, 0.0);
        assert_eq!(second[0].x, 10.0);
        assert_eq!(history.full_map(&particle).len(), 4);
    }

    #[test]
    fn ping_beyond_history_is_skipped() {
        let frames = FrameTransforms::default();
        let mut rng = StdRng::seed_from_u64(0);
        let particle =
            Particle::new(0, &Vector6::zeros(), Vector6::zeros(), 1.0, &frames, &mut rng);
        assert!(record(3, 0.0).in_map(&particle).is_none());
    }
}
