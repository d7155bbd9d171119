//! Odometry driven motion prediction.
//!
//! Each particle integrates the body-frame velocities reported by the odometry over the elapsed time, perturbed
//! by its own process noise. Depth is not integrated: the pressure-derived odometry depth is accurate enough to
//! be taken as is.
use nalgebra::{Rotation3, Vector3};
use rand::Rng;

use crate::frames::FrameTransforms;
use crate::messages::Odometry;
use crate::particle::{Particle, ParticleSwarm, sample_noise};
use crate::wrap_to_pi;

/// Advances particles with an odometry delta.
#[derive(Clone, Copy, Debug, Default)]
pub struct MotionPredictor;

impl MotionPredictor {
    /// Move a particle by the odometry delta over `dt` seconds and record the new pose.
    ///
    /// Returns `false` without touching the particle when `dt` is not positive, which is what out-of-order or
    /// duplicated odometry produces.
    pub fn predict<R: Rng + ?Sized>(
        &self,
        particle: &mut Particle,
        odometry: &Odometry,
        dt: f64,
        frames: &FrameTransforms,
        rng: &mut R,
    ) -> bool {
        if !self.advance(particle, odometry, dt, rng) {
            return false;
        }
        particle.record_pose(frames);
        true
    }

    fn advance<R: Rng + ?Sized>(
        &self,
        particle: &mut Particle,
        odometry: &Odometry,
        dt: f64,
        rng: &mut R,
    ) -> bool {
        if !(dt > 0.0 && dt.is_finite()) {
            return false;
        }
        let noise = sample_noise(particle.process_std(), rng);

        let roll = wrap_to_pi(particle.pose[3] + odometry.angular_velocity.x * dt + noise[3]);
        let pitch = wrap_to_pi(particle.pose[4] + odometry.angular_velocity.y * dt + noise[4]);
        let yaw = wrap_to_pi(particle.pose[5] + odometry.angular_velocity.z * dt + noise[5]);

        let rotation = Rotation3::from_euler_angles(roll, pitch, yaw);
        let step =
            rotation * (odometry.linear_velocity * dt) + Vector3::new(noise[0], noise[1], noise[2]);

        particle.pose[0] += step.x;
        particle.pose[1] += step.y;
        particle.pose[2] = odometry.position.z;
        particle.pose[3] = roll;
        particle.pose[4] = pitch;
        particle.pose[5] = yaw;
        true
    }

    /// Predict every particle and the dead-reckoning reference.
    ///
    /// The dead-reckoning particle has no process noise and keeps no history.
    pub fn predict_swarm<R: Rng + ?Sized>(
        &self,
        swarm: &mut ParticleSwarm,
        odometry: &Odometry,
        dt: f64,
        rng: &mut R,
    ) -> bool {
        if !(dt > 0.0 && dt.is_finite()) {
            return false;
        }
        let frames = *swarm.frames();
        for particle in &mut swarm.particles {
            self.predict(particle, odometry, dt, &frames, rng);
        }
        self.advance(&mut swarm.dead_reckoning, odometry, dt, rng);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::Vector6;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn noise_free_particle() -> Particle {
        let mut rng = StdRng::seed_from_u64(0);
        Particle::new(
            0,
            &Vector6::zeros(),
            Vector6::zeros(),
            1.0,
            &FrameTransforms::default(),
            &mut rng,
        )
    }

    fn forward_odometry(z: f64) -> Odometry {
        Odometry {
            stamp: 1.0,
            position: Vector3::new(0.0, 0.0, z),
            linear_velocity: Vector3::new(2.0, 0.0, 0.0),
            ..Odometry::default()
        }
    }

    #[test]
    fn non_positive_dt_is_a_no_op() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut particle = Particle::new(
            0,
            &Vector6::repeat(0.5),
            Vector6::repeat(0.1),
            1.0,
            &FrameTransforms::default(),
            &mut rng,
        );
        let before = particle.clone();
        let predictor = MotionPredictor;
        for dt in [0.0, -0.5, f64::NAN] {
            assert!(!predictor.predict(
                &mut particle,
                &forward_odometry(-10.0),
                dt,
                &FrameTransforms::default(),
                &mut rng
            ));
            assert_eq!(particle, before);
        }
    }

    #[test]
    fn integrates_body_velocity_in_heading() {
        let mut particle = noise_free_particle();
        particle.pose[5] = FRAC_PI_2;
        let mut rng = StdRng::seed_from_u64(0);
        let predictor = MotionPredictor;
        assert!(predictor.predict(
            &mut particle,
            &forward_odometry(-12.0),
            0.5,
            &FrameTransforms::default(),
            &mut rng
        ));
        // Facing +y, moving 2 m/s for half a second.
        assert_approx_eq!(particle.pose[0], 0.0, 1e-9);
        assert_approx_eq!(particle.pose[1], 1.0, 1e-9);
        assert_eq!(particle.pose[2], -12.0);
        assert_eq!(particle.pose_history.len(), 2);
        assert_approx_eq!(particle.pose_history[1].position.y, 1.0, 1e-9);
    }

    #[test]
    fn yaw_stays_wrapped() {
        let mut particle = noise_free_particle();
        particle.pose[5] = PI - 0.05;
        let odometry = Odometry {
            angular_velocity: Vector3::new(0.0, 0.0, 0.2),
            ..forward_odometry(0.0)
        };
        let mut rng = StdRng::seed_from_u64(0);
        MotionPredictor.predict(&mut particle, &odometry, 1.0, &FrameTransforms::default(), &mut rng);
        assert_approx_eq!(particle.pose[5], -PI + 0.15, 1e-9);
    }

    #[test]
    fn swarm_advances_in_lockstep() {
        let config = FilterConfig::default();
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut swarm = ParticleSwarm::new(&config, FrameTransforms::default(), &mut rng);
        for k in 0..5 {
            assert!(MotionPredictor.predict_swarm(&mut swarm, &forward_odometry(-3.0), 0.2, &mut rng));
            assert!(swarm.histories_aligned());
            assert_eq!(swarm.current_step(), k + 1);
        }
        // Dead reckoning follows the odometry exactly.
        assert_approx_eq!(swarm.dead_reckoning.pose[0], 2.0, 1e-9);
        assert_eq!(swarm.dead_reckoning.pose_history.len(), 1);
        assert!(!MotionPredictor.predict_swarm(&mut swarm, &forward_odometry(-3.0), 0.0, &mut rng));
        assert_eq!(swarm.current_step(), 5);
    }
}
