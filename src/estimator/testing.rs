//! Shared fixtures for estimator tests

use nalgebra::Vector3;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use crate::error::SmootherError;
use crate::estimator::propagation::Propagation;
use crate::estimator::smoother::{FixedLagSmoother, SlidingWindowSmoother};
use crate::estimator::state::State;
use crate::factors::{
    FactorGraph, ImuBias, ImuParams, Key, KeyTimestampMap, PreintegratedImuMeasurements, Value,
    Values,
};
use crate::types::{ImuSample, Rot3, Stamp};

/// Gravity-compensated sample accelerating 1 m/s² along x
pub(crate) fn imu_sample(t: Stamp) -> ImuSample {
    ImuSample::new(t, "imu", Vector3::new(1.0, 0.0, 9.81), Vector3::zeros())
}

/// Body at rest at the origin
pub(crate) fn initial_state(t: Stamp) -> State {
    State::new(
        "odom",
        Vector3::zeros(),
        Rot3::identity(),
        Vector3::zeros(),
        Arc::new(imu_sample(t)),
        PreintegratedImuMeasurements::new(Arc::new(ImuParams::default()), ImuBias::default()),
        None,
    )
}

/// Open propagation with `n` states spaced `dt` apart
pub(crate) fn propagation_with_samples(
    start: Stamp,
    dt: f64,
    n: usize,
    first_idx: u64,
) -> Propagation {
    let mut propagation = Propagation::new(initial_state(start), first_idx, None);
    for i in 1..n {
        propagation
            .add_imu_measurement(imu_sample(start + i as f64 * dt))
            .unwrap();
    }
    propagation
}

/// Append samples after the latest state until `end`
pub(crate) fn extend_until(propagation: &mut Propagation, dt: f64, end: Stamp) {
    let start = propagation.latest_state().stamp();
    let mut i = 1;
    while start + i as f64 * dt <= end + 1e-9 {
        propagation
            .add_imu_measurement(imu_sample(start + i as f64 * dt))
            .unwrap();
        i += 1;
    }
}

/// Window smoother whose pose estimates are shifted by `(idx + 1) * step` in y
///
/// Makes solver-corrected states distinguishable from re-integrated ones.
pub(crate) struct ShiftingSmoother {
    pub inner: SlidingWindowSmoother,
    pub step: f64,
}

impl ShiftingSmoother {
    pub fn new(lag: f64, step: f64) -> Self {
        Self {
            inner: SlidingWindowSmoother::new(lag),
            step,
        }
    }
}

impl FixedLagSmoother for ShiftingSmoother {
    fn update(
        &mut self,
        graph: FactorGraph,
        values: Values,
        timestamps: KeyTimestampMap,
    ) -> Result<(), SmootherError> {
        self.inner.update(graph, values, timestamps)
    }

    fn calculate_estimate(&self, key: &Key) -> Result<Value, SmootherError> {
        match (key, self.inner.calculate_estimate(key)?) {
            (Key::Pose(idx), Value::Pose(mut pose)) => {
                pose.translation.vector.y += (*idx + 1) as f64 * self.step;
                Ok(Value::Pose(pose))
            }
            (_, value) => Ok(value),
        }
    }

    fn calculate_estimates(&self) -> Values {
        self.inner.calculate_estimates()
    }

    fn timestamps(&self) -> &KeyTimestampMap {
        self.inner.timestamps()
    }

    fn smoother_lag(&self) -> f64 {
        self.inner.smoother_lag()
    }
}

/// Window smoother that blocks in `update` until released
pub(crate) struct GatedSmoother {
    pub inner: SlidingWindowSmoother,
    pub gate: Receiver<()>,
}

impl FixedLagSmoother for GatedSmoother {
    fn update(
        &mut self,
        graph: FactorGraph,
        values: Values,
        timestamps: KeyTimestampMap,
    ) -> Result<(), SmootherError> {
        let _ = self.gate.recv();
        self.inner.update(graph, values, timestamps)
    }

    fn calculate_estimate(&self, key: &Key) -> Result<Value, SmootherError> {
        self.inner.calculate_estimate(key)
    }

    fn calculate_estimates(&self) -> Values {
        self.inner.calculate_estimates()
    }

    fn timestamps(&self) -> &KeyTimestampMap {
        self.inner.timestamps()
    }

    fn smoother_lag(&self) -> f64 {
        self.inner.smoother_lag()
    }
}

/// Smoother whose update always fails
#[derive(Default)]
pub(crate) struct FailingSmoother {
    timestamps: KeyTimestampMap,
}

impl FixedLagSmoother for FailingSmoother {
    fn update(
        &mut self,
        _: FactorGraph,
        _: Values,
        _: KeyTimestampMap,
    ) -> Result<(), SmootherError> {
        Err(SmootherError::Numeric("indeterminant linear system".to_string()))
    }

    fn calculate_estimate(&self, key: &Key) -> Result<Value, SmootherError> {
        Err(SmootherError::MissingKey(*key))
    }

    fn calculate_estimates(&self) -> Values {
        Values::new()
    }

    fn timestamps(&self) -> &KeyTimestampMap {
        &self.timestamps
    }

    fn smoother_lag(&self) -> f64 {
        0.0
    }
}

/// Window smoother whose first `panics_left` updates panic
pub(crate) struct PanickingSmoother {
    pub inner: SlidingWindowSmoother,
    pub panics_left: usize,
}

impl FixedLagSmoother for PanickingSmoother {
    fn update(
        &mut self,
        graph: FactorGraph,
        values: Values,
        timestamps: KeyTimestampMap,
    ) -> Result<(), SmootherError> {
        if self.panics_left > 0 {
            self.panics_left -= 1;
            panic!("linear solver aborted");
        }
        self.inner.update(graph, values, timestamps)
    }

    fn calculate_estimate(&self, key: &Key) -> Result<Value, SmootherError> {
        self.inner.calculate_estimate(key)
    }

    fn calculate_estimates(&self) -> Values {
        self.inner.calculate_estimates()
    }

    fn timestamps(&self) -> &KeyTimestampMap {
        self.inner.timestamps()
    }

    fn smoother_lag(&self) -> f64 {
        self.inner.smoother_lag()
    }
}
