//! IMU propagation between two graph nodes
//!
//! A `Propagation` is a time-ordered run of states integrated from a single
//! initial state. It is split at radar/baro event times so every event gets
//! its own graph node, and re-integrated whenever a better initial state
//! becomes available.

use std::sync::Arc;

use crate::error::PropagationError;
use crate::estimator::state::State;
use crate::types::{ImuSample, Pose3, RadarDetection, RadarTrack, Stamp};

#[derive(Clone, Debug)]
pub struct Propagation {
    /// IMU measurements and preintegration up to each of them; never empty
    states: Vec<Arc<State>>,

    first_state_idx: u64,
    last_state_idx: Option<u64>,

    /// Body to radar extrinsic (B_T_BR)
    pub extrinsic: Option<Pose3>,
    pub detections: Option<Vec<RadarDetection>>,
    pub tracks: Option<Vec<Arc<RadarTrack>>>,
    pub baro_height: Option<f64>,
}

impl Propagation {
    pub fn new(initial_state: State, first_state_idx: u64, last_state_idx: Option<u64>) -> Self {
        Self::from_shared(vec![Arc::new(initial_state)], first_state_idx, last_state_idx)
    }

    fn from_shared(
        states: Vec<Arc<State>>,
        first_state_idx: u64,
        last_state_idx: Option<u64>,
    ) -> Self {
        debug_assert!(!states.is_empty());
        Self {
            states,
            first_state_idx,
            last_state_idx,
            extrinsic: None,
            detections: None,
            tracks: None,
            baro_height: None,
        }
    }

    pub fn first_state(&self) -> &Arc<State> {
        &self.states[0]
    }

    pub fn latest_state(&self) -> &Arc<State> {
        &self.states[self.states.len() - 1]
    }

    pub fn states(&self) -> &[Arc<State>] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn first_state_idx(&self) -> u64 {
        self.first_state_idx
    }

    pub fn last_state_idx(&self) -> Option<u64> {
        self.last_state_idx
    }

    /// Time covered from the first to the latest state [s]
    pub fn duration(&self) -> f64 {
        self.latest_state().stamp() - self.first_state().stamp()
    }

    /// IMU samples in order, including the one of the initial state
    pub fn samples(&self) -> impl Iterator<Item = &Arc<ImuSample>> + '_ {
        self.states.iter().map(|s| &s.imu)
    }

    /// Integrate one IMU sample and append the predicted state
    pub fn add_imu_measurement(
        &mut self,
        imu: impl Into<Arc<ImuSample>>,
    ) -> Result<(), PropagationError> {
        let imu = imu.into();
        let previous = self.latest_state();

        let dt = imu.timestamp - previous.stamp();
        if dt < 0.0 {
            log::warn!("Negative dt, skipping IMU integration.");
            return Err(PropagationError::NegativeInterval { dt });
        }
        if !(dt > 0.0) {
            log::warn!("Zero dt, skipping IMU integration.");
            return Err(PropagationError::ZeroInterval);
        }

        let mut integrator = previous.integrator.clone();
        integrator.integrate_measurement(imu.linear_acceleration, imu.angular_velocity, dt);
        let prediction =
            integrator.predict(&self.first_state().nav_state(), &integrator.bias_hat());

        let state = State::new(
            &previous.odom_frame_id,
            prediction.position,
            prediction.orientation,
            prediction.velocity,
            imu,
            integrator,
            previous.baro_height_bias,
        );
        self.states.push(Arc::new(state));
        Ok(())
    }

    /// Split at `t` into the propagation up to `t` and the one from `t`
    ///
    /// The state at `t` is materialized with a zero-order hold of the next
    /// IMU sample and bound to node `split_idx`, which is then incremented.
    pub fn split(
        &self,
        t: Stamp,
        split_idx: &mut u64,
    ) -> Result<(Propagation, Propagation), PropagationError> {
        let start = self.first_state().stamp();
        let end = self.latest_state().stamp();
        if t < start || t > end {
            log::debug!("t is outside the propagation [{:.6}, {:.6}], skipping split.", start, end);
            return Err(PropagationError::OutsideSpan { t, start, end });
        }

        let upper = self.states.partition_point(|s| s.stamp() < t);
        if upper == 0 {
            log::warn!("Failed to find IMU measurement after t, skipping split.");
            return Err(PropagationError::NoBracket { t });
        }
        if upper == self.states.len() {
            log::warn!("Failed to find IMU measurement before t, skipping split.");
            return Err(PropagationError::NoBracket { t });
        }
        let state_0 = &self.states[upper - 1];
        let state_1 = &self.states[upper];

        let mut to_t = Propagation::from_shared(
            self.states[..upper].to_vec(),
            self.first_state_idx,
            Some(*split_idx),
        );
        if t > state_0.stamp() {
            to_t.add_imu_measurement(state_1.imu.hold_at(t))?;
        } else {
            log::warn!(
                "Split before or exactly at measurement time. t_split: {:.6} t_0: {:.6}",
                t,
                state_0.stamp()
            );
        }

        // Regenerate propagation from t
        let boundary = to_t.latest_state();
        let initial_state = boundary.restart_with_bias(boundary.bias());
        let mut from_t = Propagation::new(initial_state, *split_idx, self.last_state_idx);
        let replay_from = if t < state_1.stamp() {
            upper
        } else {
            log::warn!(
                "Split after or exactly at measurement time. t_split: {:.6} t_1: {:.6}",
                t,
                state_1.stamp()
            );
            upper + 1
        };
        for state in &self.states[replay_from..] {
            from_t.add_imu_measurement(state.imu.clone())?;
        }

        *split_idx += 1;
        Ok((to_t, from_t))
    }

    /// Rebuild all states from `initial_state`, replaying the IMU samples
    ///
    /// Indices and attached measurements are kept. On failure nothing changes.
    pub fn repropagate(&mut self, initial_state: &State) -> Result<(), PropagationError> {
        let mut first_state = initial_state.clone();
        first_state.integrator.reset_integration();

        let mut scratch = Propagation::new(first_state, self.first_state_idx, self.last_state_idx);
        for (index, state) in self.states.iter().enumerate().skip(1) {
            if let Err(e) = scratch.add_imu_measurement(state.imu.clone()) {
                log::warn!("Failed to add IMU message during repropagation.");
                return Err(PropagationError::Repropagation {
                    index,
                    source: Box::new(e),
                });
            }
        }

        self.states = scratch.states;
        Ok(())
    }
}
