//! Fixed-lag smoother interface
//!
//! The optimization engine hands incremental factors, initial values and node
//! timestamps to a `FixedLagSmoother` and later reads back the estimate of
//! any node still inside the lag window. The nonlinear solver behind the
//! trait is external to this crate.

use crate::error::SmootherError;
use crate::factors::{FactorGraph, ImuBias, Key, KeyTimestampMap, Value, Values};
use crate::types::{Pose3, Stamp};
use nalgebra::Vector3;

pub trait FixedLagSmoother: Send {
    /// Add new factors, initial values and node timestamps, then re-solve
    /// and marginalize nodes that fell out of the lag window
    fn update(
        &mut self,
        graph: FactorGraph,
        values: Values,
        timestamps: KeyTimestampMap,
    ) -> Result<(), SmootherError>;

    /// Current estimate of a live node
    fn calculate_estimate(&self, key: &Key) -> Result<Value, SmootherError>;

    /// Current estimate of every live node
    fn calculate_estimates(&self) -> Values;

    /// Timestamps of the live nodes
    fn timestamps(&self) -> &KeyTimestampMap;

    /// Window length [s]
    fn smoother_lag(&self) -> f64;

    /// Oldest time still retained in the window
    fn oldest_timestamp(&self) -> Option<Stamp> {
        self.timestamps().values().copied().reduce(f64::min)
    }

    fn calculate_pose(&self, idx: u64) -> Result<Pose3, SmootherError> {
        let key = Key::Pose(idx);
        match self.calculate_estimate(&key)? {
            Value::Pose(pose) => Ok(pose),
            _ => Err(SmootherError::WrongValueType(key)),
        }
    }

    fn calculate_velocity(&self, idx: u64) -> Result<Vector3<f64>, SmootherError> {
        let key = Key::Velocity(idx);
        match self.calculate_estimate(&key)? {
            Value::Velocity(velocity) => Ok(velocity),
            _ => Err(SmootherError::WrongValueType(key)),
        }
    }

    fn calculate_bias(&self, idx: u64) -> Result<ImuBias, SmootherError> {
        let key = Key::Bias(idx);
        match self.calculate_estimate(&key)? {
            Value::Bias(bias) => Ok(bias),
            _ => Err(SmootherError::WrongValueType(key)),
        }
    }
}

/// Window bookkeeping smoother
///
/// Keeps the graph and the linearization point of every live node, rejects
/// updates that reference unknown nodes or re-insert existing ones, and drops
/// nodes older than `lag` together with their factors. It does not refine the
/// estimate: the reported values are the linearization points.
#[derive(Clone, Debug)]
pub struct SlidingWindowSmoother {
    lag: f64,
    graph: FactorGraph,
    estimate: Values,
    timestamps: KeyTimestampMap,
}

impl SlidingWindowSmoother {
    pub fn new(lag: f64) -> Self {
        Self {
            lag,
            graph: FactorGraph::new(),
            estimate: Values::new(),
            timestamps: KeyTimestampMap::new(),
        }
    }

    pub fn graph(&self) -> &FactorGraph {
        &self.graph
    }

    fn validate(&self, graph: &FactorGraph, values: &Values) -> Result<(), SmootherError> {
        if let Some(key) = values.keys().find(|k| self.estimate.contains(k)) {
            return Err(SmootherError::KeyAlreadyExists(*key));
        }
        for factor in graph.iter() {
            factor.validate()?;
            if let Some(key) = factor
                .keys()
                .into_iter()
                .find(|k| !self.estimate.contains(k) && !values.contains(k))
            {
                return Err(SmootherError::MissingKey(key));
            }
        }
        Ok(())
    }

    /// Drop every node older than `latest - lag` and the factors touching it
    fn marginalize(&mut self) -> usize {
        let latest = match self.timestamps.values().copied().reduce(f64::max) {
            Some(latest) => latest,
            None => return 0,
        };
        let cutoff = latest - self.lag;
        let stale: Vec<Key> = self
            .timestamps
            .iter()
            .filter(|(_, &stamp)| stamp < cutoff)
            .map(|(key, _)| *key)
            .collect();

        for key in &stale {
            self.timestamps.remove(key);
            self.estimate.remove(key);
        }
        let estimate = &self.estimate;
        self.graph
            .retain(|factor| factor.keys().iter().all(|k| estimate.contains(k)));
        stale.len()
    }
}

impl FixedLagSmoother for SlidingWindowSmoother {
    fn update(
        &mut self,
        graph: FactorGraph,
        values: Values,
        timestamps: KeyTimestampMap,
    ) -> Result<(), SmootherError> {
        self.validate(&graph, &values)?;

        self.estimate.extend(values.iter().map(|(k, v)| (*k, v.clone())));
        for (key, stamp) in timestamps {
            if self.estimate.contains(&key) {
                self.timestamps.insert(key, stamp);
            }
        }
        for factor in graph {
            self.graph.add(factor);
        }

        let marginalized = self.marginalize();
        match self.graph.error(&self.estimate) {
            Ok(cost) => log::debug!(
                "Smoother window: {} nodes, {} factors, {} marginalized, cost {:.4}",
                self.estimate.len(),
                self.graph.len(),
                marginalized,
                cost
            ),
            Err(e) => return Err(SmootherError::Numeric(e.to_string())),
        }
        Ok(())
    }

    fn calculate_estimate(&self, key: &Key) -> Result<Value, SmootherError> {
        self.estimate
            .get(key)
            .cloned()
            .ok_or(SmootherError::MissingKey(*key))
    }

    fn calculate_estimates(&self) -> Values {
        self.estimate.clone()
    }

    fn timestamps(&self) -> &KeyTimestampMap {
        &self.timestamps
    }

    fn smoother_lag(&self) -> f64 {
        self.lag
    }
}
