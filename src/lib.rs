//! Radar-inertial odometry back end
//!
//! IMU propagation split at radar and baro events, factor-graph construction
//! for inertial, Doppler, bearing-range and barometric measurements, and an
//! asynchronous fixed-lag solve that feeds corrected states back into the
//! running trajectory.

pub mod config;
pub mod error;
pub mod estimator;
pub mod factors;
pub mod types;

pub use config::{EstimatorConfig, NoiseModels};
pub use error::{ConfigError, OptimizationError, PropagationError, SmootherError, SolveError};
pub use estimator::{FixedLagSmoother, Optimization, Propagation, SlidingWindowSmoother, State};
pub use types::{ImuSample, RadarDetection, RadarTrack, Stamp};
