//! Radar-inertial state estimation
//!
//! IMU propagation between graph nodes and the asynchronous fixed-lag
//! optimization that corrects it.

pub mod optimization;
pub mod propagation;
pub mod smoother;
pub mod state;
pub mod timing;

#[cfg(test)]
pub(crate) mod testing;

pub use optimization::Optimization;
pub use propagation::Propagation;
pub use smoother::{FixedLagSmoother, SlidingWindowSmoother};
pub use state::{Odometry, State};
pub use timing::{StageTimer, Timing, TimingMap};
