/// Radar Doppler (radial velocity) factor
///
/// For a static target, the measured radial velocity is the negative
/// projection of the radar's own velocity onto the line of sight. The radar
/// velocity is the body velocity plus the lever-arm term `ω × B_t_BR`.
use nalgebra::Vector3;

use crate::factors::graph::Key;
use crate::factors::imu_preintegration::{ImuBias, NavState};
use crate::factors::noise::SharedNoiseModel;
use crate::types::Pose3;

/// Detections closer than this to the radar origin are rejected [m]
pub const DOPPLER_MIN_DISTANCE: f64 = 0.1;

#[derive(Clone, Debug)]
pub struct DopplerFactor {
    pub pose_key: Key,
    pub vel_key: Key,
    pub bias_key: Key,

    /// Target position in the radar frame (R_p_RT) [m]
    pub point: Vector3<f64>,

    /// Measured radial velocity [m/s]
    pub doppler: f64,

    /// Raw angular rate of the body at the measurement (I_omega_IB) [rad/s]
    pub omega: Vector3<f64>,

    /// Body to radar extrinsic (B_T_BR)
    pub extrinsic: Pose3,

    pub noise: SharedNoiseModel,
}

impl DopplerFactor {
    pub fn new(
        idx: u64,
        point: Vector3<f64>,
        doppler: f64,
        omega: Vector3<f64>,
        extrinsic: Pose3,
        noise: SharedNoiseModel,
    ) -> Self {
        Self {
            pose_key: Key::Pose(idx),
            vel_key: Key::Velocity(idx),
            bias_key: Key::Bias(idx),
            point,
            doppler,
            omega,
            extrinsic,
            noise,
        }
    }

    pub fn keys(&self) -> [Key; 3] {
        [self.pose_key, self.vel_key, self.bias_key]
    }

    /// Radar velocity expressed in the radar frame (R_v_IR)
    pub fn radar_velocity(&self, nav: &NavState, bias: &ImuBias) -> Vector3<f64> {
        let b_v_ib = nav.orientation.inverse() * nav.velocity;
        let b_omega_ib = self.omega - bias.gyroscope;
        let b_v_ir = b_v_ib + b_omega_ib.cross(&self.extrinsic.translation.vector);
        self.extrinsic.rotation.inverse() * b_v_ir
    }

    /// Radial velocity a static target at `point` would show
    pub fn predicted_doppler(&self, nav: &NavState, bias: &ImuBias) -> f64 {
        -self.radar_velocity(nav, bias).dot(&self.point.normalize())
    }

    /// Unwhitened residual: predicted minus measured radial velocity
    pub fn compute_residual(&self, nav: &NavState, bias: &ImuBias) -> f64 {
        self.predicted_doppler(nav, bias) - self.doppler
    }
}
