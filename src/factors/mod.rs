/// Factor Graph building blocks
///
/// Implements the factors used by the radar-inertial estimator: IMU
/// preintegration, priors, radar Doppler, radar bearing-range and barometric
/// height, plus the graph containers and noise models they share.

pub mod baro;
pub mod bearing_range;
pub mod doppler;
pub mod graph;
pub mod imu_preintegration;
pub mod noise;
pub mod prior;

pub use baro::{compute_baro_height, BaroFactor};
pub use bearing_range::BearingRangeFactor;
pub use doppler::{DopplerFactor, DOPPLER_MIN_DISTANCE};
pub use graph::{Factor, FactorGraph, Key, KeyTimestampMap, Value, Values};
pub use imu_preintegration::{ImuBias, ImuFactor, ImuParams, NavState, PreintegratedImuMeasurements};
pub use noise::{NoiseModel, RobustLoss, SharedNoiseModel};
pub use prior::PriorFactor;
