/// Prior factors on single nodes
use nalgebra::Vector3;

use crate::error::SmootherError;
use crate::factors::graph::{Key, Values};
use crate::factors::imu_preintegration::ImuBias;
use crate::factors::noise::SharedNoiseModel;
use crate::types::{pose_between_error, Pose3, BIAS_DIM, POSE_DIM};

/// Unary prior, one variant per variable kind
#[derive(Clone, Debug)]
pub enum PriorFactor {
    /// Residual `[Log(R_prior^T R), R_prior^T (t - t_prior)]`, 6 sigmas
    Pose {
        key: Key,
        prior: Pose3,
        noise: SharedNoiseModel,
    },

    /// Residual `v - v_prior`, 3 sigmas
    Velocity {
        key: Key,
        prior: Vector3<f64>,
        noise: SharedNoiseModel,
    },

    /// Residual `[ba - ba_prior, bg - bg_prior]`, 6 sigmas
    Bias {
        key: Key,
        prior: ImuBias,
        noise: SharedNoiseModel,
    },
}

impl PriorFactor {
    pub fn key(&self) -> Key {
        match self {
            PriorFactor::Pose { key, .. }
            | PriorFactor::Velocity { key, .. }
            | PriorFactor::Bias { key, .. } => *key,
        }
    }

    pub fn noise_model(&self) -> &SharedNoiseModel {
        match self {
            PriorFactor::Pose { noise, .. }
            | PriorFactor::Velocity { noise, .. }
            | PriorFactor::Bias { noise, .. } => noise,
        }
    }

    /// Residual dimension
    pub fn dim(&self) -> usize {
        match self {
            PriorFactor::Pose { .. } => POSE_DIM,
            PriorFactor::Velocity { .. } => 3,
            PriorFactor::Bias { .. } => BIAS_DIM,
        }
    }

    /// Unwhitened residual at `values`
    pub fn compute_residual(&self, values: &Values) -> Result<Vec<f64>, SmootherError> {
        match self {
            PriorFactor::Pose { key, prior, .. } => {
                let pose = values.pose(key)?;
                Ok(pose_between_error(prior, &pose).as_slice().to_vec())
            }
            PriorFactor::Velocity { key, prior, .. } => {
                let velocity = values.velocity(key)?;
                Ok((velocity - prior).as_slice().to_vec())
            }
            PriorFactor::Bias { key, prior, .. } => {
                let bias = values.bias(key)?;
                Ok((bias.vector() - prior.vector()).as_slice().to_vec())
            }
        }
    }

    pub fn error(&self, values: &Values) -> Result<f64, SmootherError> {
        let residual = self.compute_residual(values)?;
        self.noise_model().cost(&residual)
    }
}
