/// Barometric Height Factor
///
/// Unary factor pinning the vertical position of a pose node to a barometric
/// height measurement, offset by the current height-bias estimate.
use crate::error::SmootherError;
use crate::factors::graph::Key;
use crate::factors::noise::SharedNoiseModel;
use crate::types::Pose3;

/// Barometric height factor - unary constraint on the pose's z component
#[derive(Clone, Debug)]
pub struct BaroFactor {
    /// Key of the pose variable this factor constrains
    pub pose_key: Key,

    /// Barometric height measurement [m]
    pub measurement: f64,

    /// Height bias between the barometric and the odometry frame [m]
    pub bias: f64,

    pub noise: SharedNoiseModel,
}

impl BaroFactor {
    /// Create a new baro factor
    ///
    /// # Arguments
    /// * `idx` - Node index of the constrained pose
    /// * `measurement` - Barometric height (meters)
    /// * `bias` - Height-bias estimate (meters)
    /// * `noise` - One-dimensional noise model
    pub fn new(idx: u64, measurement: f64, bias: f64, noise: SharedNoiseModel) -> Self {
        Self {
            pose_key: Key::Pose(idx),
            measurement,
            bias,
            noise,
        }
    }

    /// Residual `p_z + bias - measurement`
    pub fn compute_residual(&self, pose: &Pose3) -> f64 {
        pose.translation.vector.z + self.bias - self.measurement
    }

    /// Compute the weighted error (robust if the noise model is)
    pub fn compute_weighted_error(&self, pose: &Pose3) -> Result<f64, SmootherError> {
        self.noise.cost(&[self.compute_residual(pose)])
    }
}

/// Height above sea level from static pressure [Pa], standard atmosphere
/// (troposphere model, valid below 11 km)
pub fn compute_baro_height(pressure: f64) -> f64 {
    (288.08 * (pressure / 101_290.0).powf(1.0 / 5.256) - 273.1 - 15.04) / -0.00649
}
