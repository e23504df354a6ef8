//! Incremental factor-graph construction and asynchronous fixed-lag solve
//!
//! Factors, initial values and node timestamps are accumulated on the
//! caller's thread. `solve` moves the accumulator and the smoother into a
//! background thread which updates the smoother and re-integrates every
//! propagation still inside the window from its new initial estimate.
//! `get_result` folds that corrected window back into the caller's
//! trajectory.

use nalgebra::{Point3, Vector3};
use std::collections::VecDeque;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{OptimizationError, SolveError};
use crate::estimator::propagation::Propagation;
use crate::estimator::smoother::FixedLagSmoother;
use crate::estimator::state::State;
use crate::estimator::timing::{self, StageTimer, TimingMap};
use crate::factors::{
    BaroFactor, BearingRangeFactor, DopplerFactor, Factor, FactorGraph, ImuFactor, Key,
    KeyTimestampMap, PriorFactor, SharedNoiseModel, Value, Values, DOPPLER_MIN_DISTANCE,
};
use crate::types::Stamp;

/// Latest solved window, written once per successful solve
#[derive(Default)]
struct ResultCache {
    propagations: VecDeque<Propagation>,
    timing: TimingMap,
    new_result: bool,
}

pub struct Optimization {
    new_graph: FactorGraph,
    new_values: Values,
    new_timestamps: KeyTimestampMap,

    cache: Arc<Mutex<ResultCache>>,

    /// Background solve; hands the smoother back when joined
    worker: Option<JoinHandle<Box<dyn FixedLagSmoother>>>,

    /// Idle smoother, `None` while the worker owns it
    smoother: Option<Box<dyn FixedLagSmoother>>,
}

impl Default for Optimization {
    fn default() -> Self {
        Self::new()
    }
}

impl Optimization {
    pub fn new() -> Self {
        Self {
            new_graph: FactorGraph::new(),
            new_values: Values::new(),
            new_timestamps: KeyTimestampMap::new(),
            cache: Arc::new(Mutex::new(ResultCache::default())),
            worker: None,
            smoother: None,
        }
    }

    pub fn with_smoother(smoother: impl FixedLagSmoother + 'static) -> Self {
        let mut optimization = Self::new();
        optimization.smoother = Some(Box::new(smoother));
        optimization
    }

    /// Install the fixed-lag smoother used by subsequent solves
    pub fn set_smoother(
        &mut self,
        smoother: impl FixedLagSmoother + 'static,
    ) -> Result<(), OptimizationError> {
        if self.worker.is_some() {
            log::warn!("Cannot replace the smoother while an optimization is outstanding.");
            return Err(OptimizationError::SolveRunning);
        }
        self.smoother = Some(Box::new(smoother));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| !w.is_finished())
    }

    pub fn new_graph(&self) -> &FactorGraph {
        &self.new_graph
    }

    pub fn new_values(&self) -> &Values {
        &self.new_values
    }

    pub fn new_timestamps(&self) -> &KeyTimestampMap {
        &self.new_timestamps
    }

    /// Queue `factor` unless its noise model does not fit its residual
    fn add_factor(&mut self, factor: Factor) -> bool {
        if let Err(e) = factor.validate() {
            log::error!("Rejecting factor: {}", e);
            return false;
        }
        self.new_graph.add(factor);
        true
    }

    fn insert_value(&mut self, key: Key, value: Value, stamp: Stamp) {
        if let Err(e) = self.new_values.insert(key, value) {
            log::error!("Failed to insert initial value: {}", e);
            return;
        }
        self.new_timestamps.insert(key, stamp);
    }

    /// Insert the initial pose, velocity and bias of node `idx` from `state`
    fn insert_node(&mut self, idx: u64, state: &State) {
        let stamp = state.stamp();
        self.insert_value(Key::Pose(idx), Value::Pose(state.pose()), stamp);
        self.insert_value(Key::Velocity(idx), Value::Velocity(state.velocity), stamp);
        self.insert_value(Key::Bias(idx), Value::Bias(state.bias()), stamp);
    }

    /// Priors and initial values on the first node of `propagation`
    pub fn add_prior_factor(
        &mut self,
        propagation: &Propagation,
        noise_prior_pose: &SharedNoiseModel,
        noise_prior_vel: &SharedNoiseModel,
        noise_prior_bias: &SharedNoiseModel,
    ) {
        let idx = propagation.first_state_idx();
        let state = propagation.first_state();
        log::debug!("Adding prior factor on node {}", idx);

        self.add_factor(Factor::Prior(PriorFactor::Pose {
            key: Key::Pose(idx),
            prior: state.pose(),
            noise: noise_prior_pose.clone(),
        }));
        self.add_factor(Factor::Prior(PriorFactor::Velocity {
            key: Key::Velocity(idx),
            prior: state.velocity,
            noise: noise_prior_vel.clone(),
        }));
        self.add_factor(Factor::Prior(PriorFactor::Bias {
            key: Key::Bias(idx),
            prior: state.bias(),
            noise: noise_prior_bias.clone(),
        }));
        self.insert_node(idx, state);
    }

    /// Combined IMU factor between the first and last node of `propagation`
    pub fn add_imu_factor(&mut self, propagation: &Propagation) {
        let Some(last_idx) = propagation.last_state_idx() else {
            log::debug!("Propagation has no last state index, skipping adding IMU factor.");
            return;
        };
        let integrator = propagation.latest_state().integrator.clone();
        self.add_factor(Factor::Imu(Box::new(ImuFactor::new(
            propagation.first_state_idx(),
            last_idx,
            integrator,
        ))));
    }

    /// One Doppler factor per radar detection at the last node
    ///
    /// `residuals` receives the unwhitened residual of each added factor,
    /// evaluated at the latest state.
    pub fn add_doppler_factors(
        &mut self,
        propagation: &Propagation,
        noise: &SharedNoiseModel,
        mut residuals: Option<&mut Vec<f64>>,
    ) {
        let Some(idx) = propagation.last_state_idx() else {
            log::error!("Propagation has no last state index, cannot add Doppler factors.");
            return;
        };
        let Some(detections) = propagation.detections.as_ref() else {
            log::info!("No radar detections, skipping Doppler factors.");
            return;
        };
        let Some(extrinsic) = propagation.extrinsic else {
            log::debug!("No radar extrinsic calibration, skipping Doppler factors.");
            return;
        };

        let latest = propagation.latest_state();
        let nav = latest.nav_state();
        let bias = latest.bias();
        for detection in detections {
            let range = detection.range();
            if range < DOPPLER_MIN_DISTANCE {
                log::warn!(
                    "Radar detection at {:.3} m closer than {} m, skipping Doppler factor.",
                    range,
                    DOPPLER_MIN_DISTANCE
                );
                continue;
            }
            let factor = DopplerFactor::new(
                idx,
                detection.position(),
                detection.velocity,
                latest.imu.angular_velocity,
                extrinsic,
                noise.clone(),
            );
            let residual = factor.compute_residual(&nav, &bias);
            if !self.add_factor(Factor::Doppler(factor)) {
                continue;
            }
            if let Some(out) = residuals.as_deref_mut() {
                out.push(residual);
            }
        }
    }

    /// One bearing-range factor per radar track at the last node
    ///
    /// Landmarks seen for the first time are seeded from the measurement.
    pub fn add_bearing_range_factors(
        &mut self,
        propagation: &Propagation,
        noise: &SharedNoiseModel,
    ) {
        let Some(idx) = propagation.last_state_idx() else {
            log::error!("Propagation has no last state index, cannot add bearing range factors.");
            return;
        };
        let Some(tracks) = propagation.tracks.as_ref() else {
            log::info!("No radar tracks, skipping bearing range factors.");
            return;
        };
        let Some(extrinsic) = propagation.extrinsic else {
            log::debug!("No radar extrinsic calibration, skipping bearing range factors.");
            return;
        };

        let latest = propagation.latest_state();
        let stamp = latest.stamp();
        let radar_pose = latest.pose() * extrinsic;
        for track in tracks {
            let Some(factor) =
                BearingRangeFactor::new(idx, track.id(), track.position(), extrinsic, noise.clone())
            else {
                log::warn!("Track {} at radar origin, skipping bearing range factor.", track.id());
                continue;
            };
            if !self.add_factor(Factor::BearingRange(factor)) {
                continue;
            }

            let key = Key::Landmark(track.id());
            self.new_timestamps.insert(key, stamp);
            if !track.is_added() {
                let landmark = radar_pose.transform_point(&Point3::from(*track.position())).coords;
                log::debug!(
                    "Added landmark {} at I_p_IT: [{:.3}, {:.3}, {:.3}]",
                    key,
                    landmark.x,
                    landmark.y,
                    landmark.z
                );
                self.insert_value(key, Value::Point(landmark), stamp);
                track.set_added();
            }
        }
    }

    /// Barometric height factor at the last node
    pub fn add_baro_factor(
        &mut self,
        propagation: &Propagation,
        noise: &SharedNoiseModel,
        residual: Option<&mut f64>,
    ) {
        let Some(idx) = propagation.last_state_idx() else {
            log::error!("Propagation has no last state index, cannot add baro factor.");
            return;
        };
        let Some(height) = propagation.baro_height else {
            log::info!("No baro height measurement, skipping baro factor.");
            return;
        };
        let latest = propagation.latest_state();
        let Some(bias) = latest.baro_height_bias else {
            log::info!("No baro height bias, skipping baro factor.");
            return;
        };

        let factor = BaroFactor::new(idx, height, bias, noise.clone());
        let value = factor.compute_residual(&latest.pose());
        if self.add_factor(Factor::Baro(factor)) {
            if let Some(out) = residual {
                *out = value;
            }
        }
    }

    /// Zero-velocity prior on the last node, for stationary phases
    pub fn add_zero_velocity_prior(&mut self, propagation: &Propagation, noise: &SharedNoiseModel) {
        let Some(idx) = propagation.last_state_idx() else {
            log::error!("Propagation has no last state index, cannot add zero velocity prior.");
            return;
        };
        self.add_factor(Factor::Prior(PriorFactor::Velocity {
            key: Key::Velocity(idx),
            prior: Vector3::zeros(),
            noise: noise.clone(),
        }));
    }

    /// Graph contributions of a radar event splitting a propagation
    ///
    /// `to_radar` ends at the radar node, `from_radar` starts there.
    pub fn add_radar_factor(
        &mut self,
        to_radar: &Propagation,
        from_radar: &Propagation,
        noise_radar_doppler: &SharedNoiseModel,
        noise_radar_track: &SharedNoiseModel,
        doppler_residuals: Option<&mut Vec<f64>>,
    ) {
        self.add_imu_factor(to_radar);
        self.add_imu_factor(from_radar);
        if from_radar.last_state_idx().is_some() {
            log::error!("Propagation from radar is already closed.");
        }

        self.add_doppler_factors(to_radar, noise_radar_doppler, doppler_residuals);
        self.add_bearing_range_factors(to_radar, noise_radar_track);

        match to_radar.last_state_idx() {
            Some(idx) => self.insert_node(idx, to_radar.latest_state()),
            None => log::error!("Propagation to radar has no last state index."),
        }
    }

    /// Start a background solve over the accumulated graph
    ///
    /// `propagations` is the current trajectory; the worker re-integrates a
    /// copy of it from the new estimates.
    pub fn solve(&mut self, propagations: &VecDeque<Propagation>) -> Result<(), OptimizationError> {
        if let Some(worker) = &self.worker {
            if !worker.is_finished() {
                log::debug!("Optimization thread still running.");
                return Err(OptimizationError::SolveRunning);
            }
            if self.has_new_result()? {
                log::debug!("Optimization thread not joined, get result first.");
                return Err(OptimizationError::ResultNotRetrieved);
            }
            // Failed solve, reclaim the smoother and retry
            self.join_worker()?;
        }
        let Some(smoother) = self.smoother.take() else {
            log::error!("No smoother set, cannot solve.");
            return Err(OptimizationError::NoSmoother);
        };

        let graph = mem::take(&mut self.new_graph);
        let values = mem::take(&mut self.new_values);
        let timestamps = mem::take(&mut self.new_timestamps);
        let propagations = propagations.clone();
        let cache = Arc::clone(&self.cache);
        log::debug!(
            "Solving with {} new factors and {} new values over {} propagations",
            graph.len(),
            values.len(),
            propagations.len()
        );

        self.worker = Some(thread::spawn(move || {
            solve_threaded(smoother, graph, values, timestamps, propagations, cache)
        }));
        Ok(())
    }

    /// Merge the latest solved window into `propagations`
    ///
    /// Returns a copy of all stage timings.
    pub fn get_result(
        &mut self,
        propagations: &mut VecDeque<Propagation>,
    ) -> Result<TimingMap, OptimizationError> {
        let Some(worker) = &self.worker else {
            log::debug!("No optimization thread to join.");
            return Err(OptimizationError::NoOutstandingSolve);
        };
        if !worker.is_finished() {
            log::debug!("Optimization thread still running.");
            return Err(OptimizationError::SolveRunning);
        }
        self.join_worker()?;

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| OptimizationError::LockPoisoned)?;
        if !cache.new_result {
            log::warn!("No new optimization result.");
            return Err(OptimizationError::NoNewResult);
        }
        cache.new_result = false;
        let stamp = cache.timing.get("optimize").map_or(0.0, |t| t.stamp);

        // Pop all propagations previous to the solved window, i.e. marginalized
        let timer = StageTimer::start("dequeCleanup");
        if let Some(front_idx) = cache.propagations.front().map(|p| p.first_state_idx()) {
            if propagations.iter().any(|p| p.first_state_idx() == front_idx) {
                while propagations
                    .front()
                    .map_or(false, |p| p.first_state_idx() != front_idx)
                {
                    propagations.pop_front();
                }
            } else {
                log::warn!(
                    "Solved window starts at node {} which is not in the trajectory, \
                     keeping all propagations.",
                    front_idx
                );
            }
        }
        timer.stop(&mut cache.timing, stamp);

        // Replace propagations that the solver corrected
        let timer = StageTimer::start("copyCachedPropagations");
        let mut updated = vec![false; propagations.len()];
        for (propagation, updated) in propagations.iter_mut().zip(updated.iter_mut()) {
            let Some(last_idx) = propagation.last_state_idx() else {
                continue;
            };
            let first_idx = propagation.first_state_idx();
            let position = cache.propagations.iter().position(|p| {
                p.first_state_idx() == first_idx && p.last_state_idx() == Some(last_idx)
            });
            if let Some(position) = position {
                *propagation = cache.propagations[position].clone();
                *updated = true;
                if position == 0 {
                    cache.propagations.pop_front();
                }
            }
        }
        timer.stop(&mut cache.timing, stamp);

        // Re-integrate everything added since the solve started
        let timer = StageTimer::start("repropagateNewPropagations");
        for i in 0..propagations.len() {
            if updated[i] {
                continue;
            }
            if i == 0 {
                log::error!("First propagation not updated, skipping repropagation.");
                continue;
            }
            let previous = Arc::clone(propagations[i - 1].latest_state());
            if let Err(e) = propagations[i].repropagate(&previous) {
                log::error!(
                    "Failed to repropagate propagation from node {}: {}",
                    propagations[i].first_state_idx(),
                    e
                );
            }
        }
        timer.stop(&mut cache.timing, stamp);

        Ok(cache.timing.clone())
    }

    fn has_new_result(&self) -> Result<bool, OptimizationError> {
        self.cache
            .lock()
            .map(|cache| cache.new_result)
            .map_err(|_| OptimizationError::LockPoisoned)
    }

    /// Join a finished worker and take back the smoother
    fn join_worker(&mut self) -> Result<(), OptimizationError> {
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(smoother) => self.smoother = Some(smoother),
                Err(_) => {
                    log::error!("Optimization thread panicked, smoother lost.");
                    return Err(OptimizationError::WorkerPanicked);
                }
            }
        }
        Ok(())
    }
}

fn solve_threaded(
    mut smoother: Box<dyn FixedLagSmoother>,
    graph: FactorGraph,
    values: Values,
    timestamps: KeyTimestampMap,
    propagations: VecDeque<Propagation>,
    cache: Arc<Mutex<ResultCache>>,
) -> Box<dyn FixedLagSmoother> {
    let stamp = propagations
        .back()
        .map_or(0.0, |p| p.latest_state().stamp());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        update_and_cache(smoother.as_mut(), graph, values, timestamps, propagations)
    }));
    match outcome {
        Ok(Ok((propagations, stages))) => match cache.lock() {
            Ok(mut cache) => {
                cache.propagations = propagations;
                for (label, elapsed) in stages {
                    timing::record(&mut cache.timing, label, elapsed, stamp);
                }
                cache.new_result = true;
            }
            Err(_) => log::error!("Result cache lock poisoned, dropping result."),
        },
        Ok(Err(e)) => log::error!("{}", e),
        Err(_) => log::error!("Optimization panicked, keeping smoother for the next solve."),
    }
    smoother
}

/// Update the smoother and re-integrate the window, timing both stages
fn update_and_cache(
    smoother: &mut dyn FixedLagSmoother,
    graph: FactorGraph,
    values: Values,
    timestamps: KeyTimestampMap,
    propagations: VecDeque<Propagation>,
) -> Result<(VecDeque<Propagation>, [(&'static str, Duration); 2]), SolveError> {
    let optimize = StageTimer::start("optimize");
    smoother
        .update(graph, values, timestamps)
        .map_err(SolveError::Update)?;
    let optimize_elapsed = optimize.elapsed();

    let caching = StageTimer::start("cachePropagations");
    let propagations = cache_propagations(&*smoother, propagations)?;
    let caching_elapsed = caching.elapsed();

    Ok((
        propagations,
        [
            (optimize.label(), optimize_elapsed),
            (caching.label(), caching_elapsed),
        ],
    ))
}

/// Drop marginalized propagations and re-integrate the rest from the estimate
fn cache_propagations(
    smoother: &dyn FixedLagSmoother,
    mut propagations: VecDeque<Propagation>,
) -> Result<VecDeque<Propagation>, SolveError> {
    if let Some(oldest) = smoother.oldest_timestamp() {
        while propagations
            .front()
            .map_or(false, |p| p.first_state().stamp() < oldest)
        {
            propagations.pop_front();
        }
    }

    for propagation in propagations.iter_mut() {
        let idx = propagation.first_state_idx();
        let estimate = |e| SolveError::Estimate { idx, source: e };
        let pose = smoother.calculate_pose(idx).map_err(estimate)?;
        let velocity = smoother.calculate_velocity(idx).map_err(estimate)?;
        let bias = smoother.calculate_bias(idx).map_err(estimate)?;

        let first = Arc::clone(propagation.first_state());
        let initial_state = State::from_pose(
            &first.odom_frame_id,
            &pose,
            velocity,
            first.imu.clone(),
            first.integrator.clone(),
            first.baro_height_bias,
        )
        .restart_with_bias(bias);

        propagation
            .repropagate(&initial_state)
            .map_err(|source| SolveError::Repropagate { idx, source })?;
    }
    Ok(propagations)
}
