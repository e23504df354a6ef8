/// Bearing-range factor between the radar pose and a persistent landmark
///
/// The radar pose is the body pose composed with the fixed extrinsic
/// (I_T_IR = I_T_IB * B_T_BR). Bearing error is measured in the tangent
/// plane of the measured direction, range error in meters.
use nalgebra::{Point3, Unit, Vector2, Vector3};

use crate::factors::graph::Key;
use crate::factors::noise::SharedNoiseModel;
use crate::types::Pose3;

#[derive(Clone, Debug)]
pub struct BearingRangeFactor {
    pub pose_key: Key,
    pub landmark_key: Key,

    /// Body to radar extrinsic (B_T_BR)
    pub extrinsic: Pose3,

    /// Measured direction to the landmark in the radar frame
    pub bearing: Unit<Vector3<f64>>,

    /// Measured distance to the landmark [m]
    pub range: f64,

    pub noise: SharedNoiseModel,
}

impl BearingRangeFactor {
    /// Build from the landmark position in the radar frame (R_p_RT)
    ///
    /// Returns `None` for a landmark at the radar origin, where the bearing is
    /// undefined.
    pub fn new(
        idx: u64,
        landmark_id: u64,
        point: &Vector3<f64>,
        extrinsic: Pose3,
        noise: SharedNoiseModel,
    ) -> Option<Self> {
        let range = point.norm();
        let bearing = Unit::try_new(*point, 1e-9)?;
        Some(Self {
            pose_key: Key::Pose(idx),
            landmark_key: Key::Landmark(landmark_id),
            extrinsic,
            bearing,
            range,
            noise,
        })
    }

    pub fn keys(&self) -> [Key; 2] {
        [self.pose_key, self.landmark_key]
    }

    /// Global radar pose I_T_IR for a body pose I_T_IB
    pub fn radar_pose(&self, body_pose: &Pose3) -> Pose3 {
        body_pose * self.extrinsic
    }

    /// Unwhitened residual `[bearing (2), range (1)]`
    pub fn compute_residual(&self, body_pose: &Pose3, landmark: &Vector3<f64>) -> Vector3<f64> {
        let local = self
            .radar_pose(body_pose)
            .inverse_transform_point(&Point3::from(*landmark))
            .coords;
        let predicted_range = local.norm();
        let bearing_error = match Unit::try_new(local, 1e-9) {
            Some(predicted) => self.tangent_coordinates(&predicted),
            None => Vector2::zeros(),
        };
        Vector3::new(
            bearing_error[0],
            bearing_error[1],
            predicted_range - self.range,
        )
    }

    /// Coordinates of `direction` in an orthonormal basis of the plane
    /// tangent to the measured bearing
    fn tangent_coordinates(&self, direction: &Unit<Vector3<f64>>) -> Vector2<f64> {
        let b = self.bearing.as_ref();
        let axis = if b.x.abs() < 0.9 {
            Vector3::x()
        } else {
            Vector3::y()
        };
        let e1 = (axis - b * axis.dot(b)).normalize();
        let e2 = b.cross(&e1);
        Vector2::new(e1.dot(direction), e2.dot(direction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::noise::NoiseModel;
    use approx::assert_relative_eq;

    fn noise() -> SharedNoiseModel {
        NoiseModel::diagonal(&[0.05, 0.05, 0.2]).shared()
    }

    #[test]
    fn test_origin_landmark_rejected() {
        assert!(
            BearingRangeFactor::new(0, 1, &Vector3::zeros(), Pose3::identity(), noise()).is_none()
        );
    }

    #[test]
    fn test_consistent_measurement_has_zero_residual() {
        let extrinsic = Pose3::new(Vector3::new(0.2, 0.0, 0.1), Vector3::new(0.0, 0.0, 0.3));
        let body = Pose3::new(Vector3::new(5.0, -1.0, 0.5), Vector3::new(0.0, 0.1, 1.0));
        let point = Vector3::new(4.0, 1.0, -0.5);
        let landmark = (body * extrinsic).transform_point(&point.into()).coords;

        let factor = BearingRangeFactor::new(7, 3, &point, extrinsic, noise()).unwrap();
        assert_eq!(factor.keys(), [Key::Pose(7), Key::Landmark(3)]);
        let residual = factor.compute_residual(&body, &landmark);
        assert!(residual.norm() < 1e-9);
    }

    #[test]
    fn test_range_error() {
        let point = Vector3::new(10.0, 0.0, 0.0);
        let factor = BearingRangeFactor::new(0, 0, &point, Pose3::identity(), noise()).unwrap();
        let residual = factor.compute_residual(&Pose3::identity(), &Vector3::new(12.0, 0.0, 0.0));
        assert_relative_eq!(residual[2], 2.0, epsilon = 1e-12);
        assert!(residual.fixed_rows::<2>(0).norm() < 1e-12);
    }
}
