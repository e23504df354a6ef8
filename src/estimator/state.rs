//! Immutable navigation state at one IMU sample

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::factors::{ImuBias, NavState, PreintegratedImuMeasurements};
use crate::types::{ImuSample, Pose3, Rot3, Stamp};

/// Pose, velocity and integration context after integrating `imu`
///
/// States are shared behind `Arc` and never mutated once built; a corrected
/// estimate produces new states.
#[derive(Clone, Debug)]
pub struct State {
    pub odom_frame_id: String,

    /// Position of the body in the odometry frame (I_p_IB)
    pub position: Vector3<f64>,

    /// Orientation of the body in the odometry frame (R_IB)
    pub orientation: Rot3,

    /// Velocity of the body in the odometry frame (I_v_IB)
    pub velocity: Vector3<f64>,

    /// IMU sample that produced this state
    pub imu: Arc<ImuSample>,

    /// Preintegration from the segment start up to `imu`
    pub integrator: PreintegratedImuMeasurements,

    pub baro_height_bias: Option<f64>,
}

/// Odometry snapshot for downstream consumers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Odometry {
    pub stamp: Stamp,
    pub frame_id: String,
    pub child_frame_id: String,
    pub position: Vector3<f64>,
    pub orientation: Rot3,
    /// Linear velocity in the body frame
    pub linear_velocity: Vector3<f64>,
    /// Angular velocity in the body frame (raw gyro)
    pub angular_velocity: Vector3<f64>,
}

impl State {
    pub fn new(
        odom_frame_id: &str,
        position: Vector3<f64>,
        orientation: Rot3,
        velocity: Vector3<f64>,
        imu: Arc<ImuSample>,
        integrator: PreintegratedImuMeasurements,
        baro_height_bias: Option<f64>,
    ) -> Self {
        Self {
            odom_frame_id: odom_frame_id.to_string(),
            position,
            orientation,
            velocity,
            imu,
            integrator,
            baro_height_bias,
        }
    }

    pub fn from_pose(
        odom_frame_id: &str,
        pose: &Pose3,
        velocity: Vector3<f64>,
        imu: Arc<ImuSample>,
        integrator: PreintegratedImuMeasurements,
        baro_height_bias: Option<f64>,
    ) -> Self {
        Self::new(
            odom_frame_id,
            pose.translation.vector,
            pose.rotation,
            velocity,
            imu,
            integrator,
            baro_height_bias,
        )
    }

    pub fn stamp(&self) -> Stamp {
        self.imu.timestamp
    }

    pub fn nav_state(&self) -> NavState {
        NavState::new(self.orientation, self.position, self.velocity)
    }

    pub fn pose(&self) -> Pose3 {
        self.nav_state().pose()
    }

    pub fn bias(&self) -> ImuBias {
        self.integrator.bias_hat()
    }

    pub fn bias_acc(&self) -> Vector3<f64> {
        self.bias().accelerometer
    }

    pub fn bias_gyro(&self) -> Vector3<f64> {
        self.bias().gyroscope
    }

    pub fn odometry(&self) -> Odometry {
        Odometry {
            stamp: self.stamp(),
            frame_id: self.odom_frame_id.clone(),
            child_frame_id: self.imu.frame_id.clone(),
            position: self.position,
            orientation: self.orientation,
            linear_velocity: self.orientation.inverse() * self.velocity,
            angular_velocity: self.imu.angular_velocity,
        }
    }

    /// Copy of this state whose integration restarts here with `bias`
    pub fn restart_with_bias(&self, bias: ImuBias) -> Self {
        let mut state = self.clone();
        state.integrator.reset_integration_and_set_bias(bias);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::ImuParams;
    use approx::assert_relative_eq;

    fn state() -> State {
        let imu = Arc::new(ImuSample::new(
            2.5,
            "imu",
            Vector3::new(0.0, 0.0, 9.81),
            Vector3::new(0.0, 0.0, 0.2),
        ));
        let bias = ImuBias::new(Vector3::new(0.1, 0.0, 0.0), Vector3::new(0.0, 0.0, 0.01));
        State::new(
            "odom",
            Vector3::new(1.0, 2.0, 3.0),
            Rot3::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2),
            Vector3::new(0.0, 1.0, 0.0),
            imu,
            PreintegratedImuMeasurements::new(Arc::new(ImuParams::default()), bias),
            Some(0.5),
        )
    }

    #[test]
    fn test_odometry_body_velocity() {
        let odom = state().odometry();
        assert_eq!(odom.stamp, 2.5);
        assert_eq!(odom.frame_id, "odom");
        assert_eq!(odom.child_frame_id, "imu");
        // Moving along world +y while yawed 90° is body +x
        assert_relative_eq!(odom.linear_velocity, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_bias_accessors() {
        let s = state();
        assert_eq!(s.bias_acc().x, 0.1);
        assert_eq!(s.bias_gyro().z, 0.01);
        assert_eq!(s.pose().translation.vector, s.position);
    }

    #[test]
    fn test_restart_with_bias() {
        let s = state().restart_with_bias(ImuBias::default());
        assert_eq!(s.bias(), ImuBias::default());
        assert_eq!(s.integrator.sum_dt, 0.0);
        assert_eq!(s.baro_height_bias, Some(0.5));
    }
}
