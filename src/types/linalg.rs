//! Linear algebra type system for the estimator
//!
//! Fixed-size aliases for the manifolds and residual blocks used by the
//! factors, plus the small SO(3) helpers the preintegration needs.

use nalgebra::{Isometry3, Matrix3, SMatrix, SVector, UnitQuaternion, Vector3};

// ===== Tangent Dimensions =====
pub const POSE_DIM: usize = 6; // (rotation, translation)
pub const NAV_DIM: usize = 9; // (rotation, position, velocity)
pub const BIAS_DIM: usize = 6; // (accel, gyro)
pub const IMU_RESIDUAL_DIM: usize = NAV_DIM + BIAS_DIM;

// ===== Manifold Types =====
pub type Pose3 = Isometry3<f64>;
pub type Rot3 = UnitQuaternion<f64>;

// ===== Preintegration Types =====
pub type NavCov = SMatrix<f64, NAV_DIM, NAV_DIM>;
pub type NavNoiseInput = SMatrix<f64, NAV_DIM, 3>; // 9×3 noise input matrix

// ===== Residual Types =====
pub type PoseVec = SVector<f64, POSE_DIM>;
pub type BiasVec = SVector<f64, BIAS_DIM>;
pub type ImuResidual = SVector<f64, IMU_RESIDUAL_DIM>;
pub type ImuInformation = SMatrix<f64, IMU_RESIDUAL_DIM, IMU_RESIDUAL_DIM>;

/// Create a skew-symmetric matrix from a 3D vector
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v[2], v[1], v[2], 0.0, -v[0], -v[1], v[0], 0.0)
}

/// Exponential map: rotation vector -> unit quaternion
pub fn exp_so3(omega: &Vector3<f64>) -> Rot3 {
    UnitQuaternion::from_scaled_axis(*omega)
}

/// Logarithm map: unit quaternion -> rotation vector (angle * axis)
pub fn log_so3(q: &Rot3) -> Vector3<f64> {
    q.scaled_axis()
}

/// Pose tangent error `[Log(R_a^T R_b), R_a^T (t_b - t_a)]`
pub fn pose_between_error(a: &Pose3, b: &Pose3) -> PoseVec {
    let rot = log_so3(&(a.rotation.inverse() * b.rotation));
    let trans = a.rotation.inverse() * (b.translation.vector - a.translation.vector);
    PoseVec::new(rot[0], rot[1], rot[2], trans[0], trans[1], trans[2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_exp_log_roundtrip() {
        let omega = Vector3::new(0.1, -0.2, 0.3);
        let q = exp_so3(&omega);
        assert_relative_eq!(log_so3(&q), omega, epsilon = 1e-12);
    }

    #[test]
    fn test_skew_matches_cross_product() {
        let a = Vector3::new(1.0, 2.0, 3.0);
        let b = Vector3::new(-0.5, 0.25, 4.0);
        assert_relative_eq!(skew_symmetric(&a) * b, a.cross(&b), epsilon = 1e-12);
    }

    #[test]
    fn test_pose_between_error_identity() {
        let pose = Pose3::new(Vector3::new(1.0, 2.0, 3.0), Vector3::new(0.0, 0.0, 0.5));
        assert!(pose_between_error(&pose, &pose).norm() < 1e-12);
    }
}
