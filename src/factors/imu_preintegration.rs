/// IMU Preintegration and the combined IMU factor
///
/// Implements the Forster on-manifold preintegration: IMU samples between two
/// graph nodes are integrated once, in the body frame of the first node, and
/// kept correctable to first order when the bias estimate changes.
///
/// References:
/// - Forster et al., "On-Manifold Preintegration for Real-Time Visual-Inertial Odometry"
/// - Qin et al., "VINS-Mono: A Robust and Versatile Monocular Visual-Inertial State Estimator"
use nalgebra::{Matrix3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::factors::graph::Key;
use crate::types::{
    exp_so3, log_so3, skew_symmetric, BiasVec, ImuInformation, ImuResidual, NavCov,
    NavNoiseInput, Pose3, Rot3,
};

const G: f64 = 9.81; // Earth gravity (m/s²)

/// Noise and gravity parameters shared by every preintegration of a run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImuParams {
    /// Gravity in the navigation frame [m/s²]
    pub gravity: Vector3<f64>,

    /// Accelerometer white noise density [m/s²/√Hz]
    pub accelerometer_sigma: f64,

    /// Gyroscope white noise density [rad/s/√Hz]
    pub gyroscope_sigma: f64,

    /// Position integration uncertainty [m/√Hz]
    pub integration_sigma: f64,

    /// Accelerometer bias random walk [m/s³/√Hz]
    pub bias_acc_sigma: f64,

    /// Gyroscope bias random walk [rad/s²/√Hz]
    pub bias_omega_sigma: f64,

    /// Accelerometer bias uncertainty at integration start [m/s²]
    pub bias_acc_int_sigma: f64,

    /// Gyroscope bias uncertainty at integration start [rad/s]
    pub bias_omega_int_sigma: f64,
}

impl Default for ImuParams {
    fn default() -> Self {
        Self {
            gravity: Vector3::new(0.0, 0.0, -G),
            accelerometer_sigma: 0.02,
            gyroscope_sigma: 0.002,
            integration_sigma: 1e-4,
            bias_acc_sigma: 4e-3,
            bias_omega_sigma: 4e-5,
            bias_acc_int_sigma: 1e-5,
            bias_omega_int_sigma: 1e-5,
        }
    }
}

/// Constant accelerometer and gyroscope bias
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuBias {
    pub accelerometer: Vector3<f64>,
    pub gyroscope: Vector3<f64>,
}

impl ImuBias {
    pub fn new(accelerometer: Vector3<f64>, gyroscope: Vector3<f64>) -> Self {
        Self {
            accelerometer,
            gyroscope,
        }
    }

    /// Stacked `[accel (0:3), gyro (3:6)]`
    pub fn vector(&self) -> BiasVec {
        let mut v = BiasVec::zeros();
        v.fixed_rows_mut::<3>(0).copy_from(&self.accelerometer);
        v.fixed_rows_mut::<3>(3).copy_from(&self.gyroscope);
        v
    }

    pub fn from_vector(v: &BiasVec) -> Self {
        Self {
            accelerometer: v.fixed_rows::<3>(0).into_owned(),
            gyroscope: v.fixed_rows::<3>(3).into_owned(),
        }
    }
}

/// Navigation state: orientation R_IB, position I_p_IB and velocity I_v_IB
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NavState {
    pub orientation: Rot3,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
}

impl NavState {
    pub fn new(orientation: Rot3, position: Vector3<f64>, velocity: Vector3<f64>) -> Self {
        Self {
            orientation,
            position,
            velocity,
        }
    }

    pub fn from_pose(pose: &Pose3, velocity: Vector3<f64>) -> Self {
        Self::new(pose.rotation, pose.translation.vector, velocity)
    }

    pub fn pose(&self) -> Pose3 {
        Pose3::from_parts(Translation3::from(self.position), self.orientation)
    }
}

/// Preintegrated IMU Measurements between two graph nodes
///
/// All deltas are expressed in the body frame of the initial node and were
/// integrated with `bias_hat`. Covariance ordering is (rotation, position,
/// velocity).
#[derive(Clone, Debug)]
pub struct PreintegratedImuMeasurements {
    params: Arc<ImuParams>,

    /// Position delta: ∫∫ R(t) a(t) dt dt
    pub delta_p: Vector3<f64>,

    /// Velocity delta: ∫ R(t) a(t) dt
    pub delta_v: Vector3<f64>,

    /// Rotation delta: Π exp(ω dt)
    pub delta_q: UnitQuaternion<f64>,

    /// Total time elapsed since the last reset [seconds]
    pub sum_dt: f64,

    /// Bias hypothesis used during integration
    bias_hat: ImuBias,

    /// Jacobian of delta_p w.r.t. accelerometer bias: ∂Δp / ∂ba [3x3]
    pub dp_dba: Matrix3<f64>,

    /// Jacobian of delta_p w.r.t. gyroscope bias: ∂Δp / ∂bg [3x3]
    pub dp_dbg: Matrix3<f64>,

    /// Jacobian of delta_v w.r.t. accelerometer bias: ∂Δv / ∂ba [3x3]
    pub dv_dba: Matrix3<f64>,

    /// Jacobian of delta_v w.r.t. gyroscope bias: ∂Δv / ∂bg [3x3]
    pub dv_dbg: Matrix3<f64>,

    /// Jacobian of delta_q w.r.t. gyroscope bias: ∂Δq / ∂bg [3x3]
    pub dq_dbg: Matrix3<f64>,

    /// Preintegration covariance [9x9]
    pub covariance: NavCov,
}

impl PreintegratedImuMeasurements {
    /// Create an empty preintegration with the given bias hypothesis
    pub fn new(params: Arc<ImuParams>, bias_hat: ImuBias) -> Self {
        Self {
            params,
            delta_p: Vector3::zeros(),
            delta_v: Vector3::zeros(),
            delta_q: UnitQuaternion::identity(),
            sum_dt: 0.0,
            bias_hat,
            dp_dba: Matrix3::zeros(),
            dp_dbg: Matrix3::zeros(),
            dv_dba: Matrix3::zeros(),
            dv_dbg: Matrix3::zeros(),
            dq_dbg: Matrix3::zeros(),
            covariance: NavCov::zeros(),
        }
    }

    pub fn params(&self) -> &ImuParams {
        &self.params
    }

    pub fn bias_hat(&self) -> ImuBias {
        self.bias_hat
    }

    /// Integrate a new accel and gyro measurement
    ///
    /// `dt` must be strictly positive; callers reject other intervals.
    pub fn integrate_measurement(&mut self, accel: Vector3<f64>, gyro: Vector3<f64>, dt: f64) {
        let accel_corrected = accel - self.bias_hat.accelerometer;
        let gyro_corrected = gyro - self.bias_hat.gyroscope;

        let dr = self.delta_q.to_rotation_matrix().into_inner();
        let a_skew = skew_symmetric(&accel_corrected);
        let dt2 = dt * dt;

        // Bias Jacobians use the rotation before this step
        self.dp_dba += self.dv_dba * dt - 0.5 * dr * dt2;
        self.dp_dbg += self.dv_dbg * dt - 0.5 * dr * a_skew * self.dq_dbg * dt2;
        self.dv_dba -= dr * dt;
        self.dv_dbg -= dr * a_skew * self.dq_dbg * dt;

        let increment = exp_so3(&(gyro_corrected * dt));
        let increment_t = increment.to_rotation_matrix().into_inner().transpose();

        // Error-state transition
        let mut a_mat = NavCov::identity();
        a_mat.fixed_view_mut::<3, 3>(0, 0).copy_from(&increment_t);
        a_mat
            .fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(-0.5 * dr * a_skew * dt2));
        a_mat
            .fixed_view_mut::<3, 3>(3, 6)
            .copy_from(&(Matrix3::identity() * dt));
        a_mat
            .fixed_view_mut::<3, 3>(6, 0)
            .copy_from(&(-dr * a_skew * dt));

        let mut b_acc = NavNoiseInput::zeros();
        b_acc.fixed_view_mut::<3, 3>(3, 0).copy_from(&(0.5 * dr * dt2));
        b_acc.fixed_view_mut::<3, 3>(6, 0).copy_from(&(dr * dt));

        let acc_var = self.params.accelerometer_sigma.powi(2);
        let gyro_var = self.params.gyroscope_sigma.powi(2);
        let int_var = self.params.integration_sigma.powi(2);

        let mut noise = b_acc * b_acc.transpose() * (acc_var / dt);
        for i in 0..3 {
            noise[(i, i)] += gyro_var * dt;
            noise[(3 + i, 3 + i)] += int_var * dt;
        }
        self.covariance = a_mat * self.covariance * a_mat.transpose() + noise;

        self.delta_p += self.delta_v * dt + 0.5 * dr * accel_corrected * dt2;
        self.delta_v += dr * accel_corrected * dt;
        self.delta_q *= increment;
        self.dq_dbg = increment_t * self.dq_dbg - Matrix3::identity() * dt;

        self.sum_dt += dt;
    }

    /// Deltas corrected to first order for a bias different from `bias_hat`
    pub fn corrected_deltas(&self, bias: &ImuBias) -> (Vector3<f64>, Vector3<f64>, Rot3) {
        let delta_ba = bias.accelerometer - self.bias_hat.accelerometer;
        let delta_bg = bias.gyroscope - self.bias_hat.gyroscope;

        let dp = self.delta_p + self.dp_dba * delta_ba + self.dp_dbg * delta_bg;
        let dv = self.delta_v + self.dv_dba * delta_ba + self.dv_dbg * delta_bg;
        let dq = self.delta_q * exp_so3(&(self.dq_dbg * delta_bg));
        (dp, dv, dq)
    }

    /// Predict the navigation state at the end of the integration interval
    pub fn predict(&self, initial: &NavState, bias: &ImuBias) -> NavState {
        let (dp, dv, dq) = self.corrected_deltas(bias);
        let t = self.sum_dt;
        let g = self.params.gravity;
        let r_i = initial.orientation;

        NavState {
            orientation: r_i * dq,
            position: initial.position + initial.velocity * t + 0.5 * g * t * t + r_i * dp,
            velocity: initial.velocity + g * t + r_i * dv,
        }
    }

    /// Clear the integrated deltas, keeping the bias hypothesis
    pub fn reset_integration(&mut self) {
        *self = Self::new(self.params.clone(), self.bias_hat);
    }

    /// Clear the integrated deltas and integrate from now on with `bias`
    pub fn reset_integration_and_set_bias(&mut self, bias: ImuBias) {
        *self = Self::new(self.params.clone(), bias);
    }
}

/// Combined IMU factor
///
/// Constrains pose, velocity and bias of two consecutive nodes through the
/// preintegrated measurement, with a bias random walk between them.
#[derive(Clone, Debug)]
pub struct ImuFactor {
    pub pose_i: Key,
    pub vel_i: Key,
    pub pose_j: Key,
    pub vel_j: Key,
    pub bias_i: Key,
    pub bias_j: Key,

    /// Preintegrated measurements between the nodes
    pub preintegration: PreintegratedImuMeasurements,

    /// Information matrix (inverse of covariance) [15x15]
    pub information: ImuInformation,
}

impl ImuFactor {
    /// Create a new IMU factor between node `i` and node `j`
    pub fn new(i: u64, j: u64, preintegration: PreintegratedImuMeasurements) -> Self {
        let params = preintegration.params();
        let t = preintegration.sum_dt;

        let mut covariance = ImuInformation::zeros();
        covariance
            .fixed_view_mut::<9, 9>(0, 0)
            .copy_from(&preintegration.covariance);
        let acc_rw = params.bias_acc_sigma.powi(2) * t + params.bias_acc_int_sigma.powi(2);
        let gyro_rw = params.bias_omega_sigma.powi(2) * t + params.bias_omega_int_sigma.powi(2);
        for k in 0..3 {
            covariance[(9 + k, 9 + k)] = acc_rw;
            covariance[(12 + k, 12 + k)] = gyro_rw;
        }

        // Information = Covariance^-1
        let information = match covariance.try_inverse() {
            Some(information) => information,
            None => {
                log::warn!(
                    "Singular IMU covariance between nodes {} and {} over {:.3} s, \
                     using identity information.",
                    i,
                    j,
                    t
                );
                ImuInformation::identity()
            }
        };

        Self {
            pose_i: Key::Pose(i),
            vel_i: Key::Velocity(i),
            pose_j: Key::Pose(j),
            vel_j: Key::Velocity(j),
            bias_i: Key::Bias(i),
            bias_j: Key::Bias(j),
            preintegration,
            information,
        }
    }

    pub fn keys(&self) -> [Key; 6] {
        [
            self.pose_i,
            self.vel_i,
            self.pose_j,
            self.vel_j,
            self.bias_i,
            self.bias_j,
        ]
    }

    /// Residual `[rotation (0:3), position (3:6), velocity (6:9), bias (9:15)]`
    ///
    /// Navigation errors are expressed in the body frame of node `i`.
    pub fn compute_residual(
        &self,
        nav_i: &NavState,
        bias_i: &ImuBias,
        nav_j: &NavState,
        bias_j: &ImuBias,
    ) -> ImuResidual {
        let predicted = self.preintegration.predict(nav_i, bias_i);
        let r_i_inv = nav_i.orientation.inverse();

        let rot_error = log_so3(&(predicted.orientation.inverse() * nav_j.orientation));
        let pos_error = r_i_inv * (nav_j.position - predicted.position);
        let vel_error = r_i_inv * (nav_j.velocity - predicted.velocity);
        let bias_error = bias_j.vector() - bias_i.vector();

        let mut residual = ImuResidual::zeros();
        residual.fixed_rows_mut::<3>(0).copy_from(&rot_error);
        residual.fixed_rows_mut::<3>(3).copy_from(&pos_error);
        residual.fixed_rows_mut::<3>(6).copy_from(&vel_error);
        residual.fixed_rows_mut::<6>(9).copy_from(&bias_error);
        residual
    }

    /// Compute the cost 0.5 * residual^T * Information * residual
    pub fn compute_weighted_error(
        &self,
        nav_i: &NavState,
        bias_i: &ImuBias,
        nav_j: &NavState,
        bias_j: &ImuBias,
    ) -> f64 {
        let residual = self.compute_residual(nav_i, bias_i, nav_j, bias_j);
        0.5 * (residual.transpose() * self.information * residual)[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    fn preintegration() -> PreintegratedImuMeasurements {
        PreintegratedImuMeasurements::new(Arc::new(ImuParams::default()), ImuBias::default())
    }

    fn at_rest() -> NavState {
        NavState::new(Rot3::identity(), Vector3::zeros(), Vector3::zeros())
    }

    #[test]
    fn test_preintegration_creation() {
        let preint = preintegration();
        assert_eq!(preint.sum_dt, 0.0);
        assert!(preint.delta_p.norm() < 1e-10);
        assert!(preint.delta_v.norm() < 1e-10);
    }

    #[test]
    fn test_stationary_prediction_cancels_gravity() {
        let mut preint = preintegration();
        for _ in 0..100 {
            preint.integrate_measurement(Vector3::new(0.0, 0.0, G), Vector3::zeros(), 0.01);
        }
        let predicted = preint.predict(&at_rest(), &preint.bias_hat());
        assert_relative_eq!(preint.sum_dt, 1.0, epsilon = 1e-9);
        assert!(predicted.position.norm() < 1e-9);
        assert!(predicted.velocity.norm() < 1e-9);
    }

    #[test]
    fn test_constant_acceleration() {
        let mut preint = preintegration();
        for _ in 0..100 {
            preint.integrate_measurement(Vector3::new(1.0, 0.0, G), Vector3::zeros(), 0.01);
        }
        let predicted = preint.predict(&at_rest(), &preint.bias_hat());
        assert_relative_eq!(predicted.position.x, 0.5, epsilon = 1e-9);
        assert_relative_eq!(predicted.velocity.x, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_constant_rotation() {
        let mut preint = preintegration();
        for _ in 0..100 {
            preint.integrate_measurement(
                Vector3::new(0.0, 0.0, G),
                Vector3::new(0.0, 0.0, FRAC_PI_2),
                0.01,
            );
        }
        let predicted = preint.predict(&at_rest(), &preint.bias_hat());
        assert_relative_eq!(predicted.orientation.angle(), FRAC_PI_2, epsilon = 1e-9);
    }

    #[test]
    fn test_accel_bias_correction_is_exact_without_rotation() {
        let mut preint = preintegration();
        for _ in 0..50 {
            preint.integrate_measurement(Vector3::new(0.3, 0.0, G), Vector3::zeros(), 0.02);
        }
        let bias = ImuBias::new(Vector3::new(0.1, 0.0, 0.0), Vector3::zeros());
        let corrected = preint.predict(&at_rest(), &bias);

        let mut reintegrated =
            PreintegratedImuMeasurements::new(Arc::new(ImuParams::default()), bias);
        for _ in 0..50 {
            reintegrated.integrate_measurement(Vector3::new(0.3, 0.0, G), Vector3::zeros(), 0.02);
        }
        let expected = reintegrated.predict(&at_rest(), &bias);
        assert_relative_eq!(corrected.position, expected.position, epsilon = 1e-9);
        assert_relative_eq!(corrected.velocity, expected.velocity, epsilon = 1e-9);
    }

    #[test]
    fn test_reset_keeps_or_sets_bias() {
        let bias = ImuBias::new(Vector3::new(0.1, 0.2, 0.3), Vector3::zeros());
        let mut preint = PreintegratedImuMeasurements::new(Arc::new(ImuParams::default()), bias);
        preint.integrate_measurement(Vector3::new(0.0, 0.0, G), Vector3::zeros(), 0.01);
        preint.reset_integration();
        assert_eq!(preint.sum_dt, 0.0);
        assert_eq!(preint.bias_hat(), bias);

        preint.reset_integration_and_set_bias(ImuBias::default());
        assert_eq!(preint.bias_hat(), ImuBias::default());
    }

    #[test]
    fn test_covariance_grows() {
        let mut preint = preintegration();
        preint.integrate_measurement(Vector3::new(0.0, 0.0, G), Vector3::zeros(), 0.01);
        let first = preint.covariance.trace();
        preint.integrate_measurement(Vector3::new(0.0, 0.0, G), Vector3::zeros(), 0.01);
        assert!(first > 0.0);
        assert!(preint.covariance.trace() > first);
    }

    #[test]
    fn test_singular_covariance_falls_back_to_identity() {
        let _ = env_logger::builder().is_test(true).try_init();
        let params = ImuParams {
            bias_acc_int_sigma: 0.0,
            bias_omega_int_sigma: 0.0,
            ..ImuParams::default()
        };
        // Nothing integrated yet and no bias random walk: all-zero covariance
        let empty = PreintegratedImuMeasurements::new(Arc::new(params), ImuBias::default());
        let factor = ImuFactor::new(0, 1, empty);
        assert_eq!(factor.information, ImuInformation::identity());

        let mut preint = preintegration();
        preint.integrate_measurement(Vector3::new(0.0, 0.0, G), Vector3::zeros(), 0.01);
        let factor = ImuFactor::new(0, 1, preint);
        assert_ne!(factor.information, ImuInformation::identity());
    }

    #[test]
    fn test_residual_zero_when_consistent() {
        let mut preint = preintegration();
        for _ in 0..20 {
            preint.integrate_measurement(Vector3::new(0.5, 0.0, G), Vector3::zeros(), 0.01);
        }
        let nav_j = preint.predict(&at_rest(), &ImuBias::default());
        let factor = ImuFactor::new(0, 1, preint);
        assert!(factor.information.determinant() > 0.0);

        let bias = ImuBias::default();
        let residual = factor.compute_residual(&at_rest(), &bias, &nav_j, &bias);
        assert!(residual.norm() < 1e-9);
        assert_eq!(factor.keys()[2], Key::Pose(1));
    }
}
