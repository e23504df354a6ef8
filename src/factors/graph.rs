/// Factor graph containers
///
/// Keys name the time-indexed variables, `Values` holds one estimate per
/// key, and `FactorGraph` is an append-only list of `Factor`s. One enum
/// variant per concrete factor kind replaces type-level dispatch.
use nalgebra::Vector3;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::SmootherError;
use crate::factors::baro::BaroFactor;
use crate::factors::bearing_range::BearingRangeFactor;
use crate::factors::doppler::DopplerFactor;
use crate::factors::imu_preintegration::{ImuBias, ImuFactor, NavState};
use crate::factors::noise::SharedNoiseModel;
use crate::factors::prior::PriorFactor;
use crate::types::{Pose3, Stamp, IMU_RESIDUAL_DIM};

/// Graph node identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Pose(u64),
    Velocity(u64),
    Bias(u64),
    Landmark(u64),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Key::Pose(i) => write!(f, "x{}", i),
            Key::Velocity(i) => write!(f, "v{}", i),
            Key::Bias(i) => write!(f, "b{}", i),
            Key::Landmark(i) => write!(f, "l{}", i),
        }
    }
}

/// Estimate of a single variable
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Pose(Pose3),
    Velocity(Vector3<f64>),
    Bias(ImuBias),
    Point(Vector3<f64>),
}

/// Node timestamps used by the smoother to decide marginalization
pub type KeyTimestampMap = BTreeMap<Key, Stamp>;

/// Map from node key to estimate
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Values {
    values: BTreeMap<Key, Value>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new value; an existing key is an error
    pub fn insert(&mut self, key: Key, value: Value) -> Result<(), SmootherError> {
        if self.values.contains_key(&key) {
            return Err(SmootherError::KeyAlreadyExists(key));
        }
        self.values.insert(key, value);
        Ok(())
    }

    /// Insert or overwrite
    pub fn upsert(&mut self, key: Key, value: Value) {
        self.values.insert(key, value);
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.values.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.values.keys()
    }

    pub fn pose(&self, key: &Key) -> Result<Pose3, SmootherError> {
        match self.get(key) {
            Some(Value::Pose(pose)) => Ok(*pose),
            Some(_) => Err(SmootherError::WrongValueType(*key)),
            None => Err(SmootherError::MissingKey(*key)),
        }
    }

    pub fn velocity(&self, key: &Key) -> Result<Vector3<f64>, SmootherError> {
        match self.get(key) {
            Some(Value::Velocity(v)) => Ok(*v),
            Some(_) => Err(SmootherError::WrongValueType(*key)),
            None => Err(SmootherError::MissingKey(*key)),
        }
    }

    pub fn bias(&self, key: &Key) -> Result<ImuBias, SmootherError> {
        match self.get(key) {
            Some(Value::Bias(b)) => Ok(*b),
            Some(_) => Err(SmootherError::WrongValueType(*key)),
            None => Err(SmootherError::MissingKey(*key)),
        }
    }

    pub fn point(&self, key: &Key) -> Result<Vector3<f64>, SmootherError> {
        match self.get(key) {
            Some(Value::Point(p)) => Ok(*p),
            Some(_) => Err(SmootherError::WrongValueType(*key)),
            None => Err(SmootherError::MissingKey(*key)),
        }
    }

    fn nav_state(&self, pose: &Key, velocity: &Key) -> Result<NavState, SmootherError> {
        Ok(NavState::from_pose(&self.pose(pose)?, self.velocity(velocity)?))
    }
}

impl Extend<(Key, Value)> for Values {
    fn extend<I: IntoIterator<Item = (Key, Value)>>(&mut self, iter: I) {
        self.values.extend(iter);
    }
}

/// Enumeration of factors that can be added to the graph
#[derive(Clone, Debug)]
pub enum Factor {
    /// Prior on a pose, velocity or bias node
    Prior(PriorFactor),

    /// Combined IMU preintegration between two nodes
    Imu(Box<ImuFactor>),

    /// Radial velocity of a single radar detection
    Doppler(DopplerFactor),

    /// Bearing and range from the radar to a persistent landmark
    BearingRange(BearingRangeFactor),

    /// Barometric height of a pose node
    Baro(BaroFactor),
}

impl Factor {
    pub fn keys(&self) -> Vec<Key> {
        match self {
            Factor::Prior(f) => vec![f.key()],
            Factor::Imu(f) => f.keys().to_vec(),
            Factor::Doppler(f) => f.keys().to_vec(),
            Factor::BearingRange(f) => f.keys().to_vec(),
            Factor::Baro(f) => vec![f.pose_key],
        }
    }

    /// Residual dimension
    pub fn dim(&self) -> usize {
        match self {
            Factor::Prior(f) => f.dim(),
            Factor::Imu(_) => IMU_RESIDUAL_DIM,
            Factor::Doppler(_) => 1,
            Factor::BearingRange(_) => 3,
            Factor::Baro(_) => 1,
        }
    }

    /// Check that the noise model matches the residual dimension
    pub fn validate(&self) -> Result<(), SmootherError> {
        match self.noise_model() {
            Some(noise) if noise.dim() != self.dim() => Err(SmootherError::Numeric(format!(
                "factor on {:?} has residual dimension {} but noise model dimension {}",
                self.keys(),
                self.dim(),
                noise.dim()
            ))),
            _ => Ok(()),
        }
    }

    pub fn noise_model(&self) -> Option<&SharedNoiseModel> {
        match self {
            Factor::Prior(f) => Some(f.noise_model()),
            Factor::Imu(_) => None,
            Factor::Doppler(f) => Some(&f.noise),
            Factor::BearingRange(f) => Some(&f.noise),
            Factor::Baro(f) => Some(&f.noise),
        }
    }

    /// Cost of this factor evaluated at `values`
    pub fn error(&self, values: &Values) -> Result<f64, SmootherError> {
        match self {
            Factor::Prior(f) => f.error(values),
            Factor::Imu(f) => {
                let nav_i = values.nav_state(&f.pose_i, &f.vel_i)?;
                let nav_j = values.nav_state(&f.pose_j, &f.vel_j)?;
                Ok(f.compute_weighted_error(
                    &nav_i,
                    &values.bias(&f.bias_i)?,
                    &nav_j,
                    &values.bias(&f.bias_j)?,
                ))
            }
            Factor::Doppler(f) => {
                let nav = values.nav_state(&f.pose_key, &f.vel_key)?;
                let residual = f.compute_residual(&nav, &values.bias(&f.bias_key)?);
                f.noise.cost(&[residual])
            }
            Factor::BearingRange(f) => {
                let residual =
                    f.compute_residual(&values.pose(&f.pose_key)?, &values.point(&f.landmark_key)?);
                f.noise.cost(residual.as_slice())
            }
            Factor::Baro(f) => {
                let residual = f.compute_residual(&values.pose(&f.pose_key)?);
                f.noise.cost(&[residual])
            }
        }
    }
}

/// Append-only list of factors
#[derive(Clone, Debug, Default)]
pub struct FactorGraph {
    factors: Vec<Factor>,
}

impl FactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, factor: Factor) {
        self.factors.push(factor);
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Factor> {
        self.factors.iter()
    }

    /// Keep only the factors for which `keep` returns true
    pub fn retain(&mut self, keep: impl FnMut(&Factor) -> bool) {
        self.factors.retain(keep);
    }

    /// Total cost of the graph at `values`
    pub fn error(&self, values: &Values) -> Result<f64, SmootherError> {
        self.factors.iter().map(|f| f.error(values)).sum()
    }
}

impl IntoIterator for FactorGraph {
    type Item = Factor;
    type IntoIter = std::vec::IntoIter<Factor>;

    fn into_iter(self) -> Self::IntoIter {
        self.factors.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::noise::NoiseModel;

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut values = Values::new();
        values
            .insert(Key::Velocity(0), Value::Velocity(Vector3::zeros()))
            .unwrap();
        assert!(matches!(
            values.insert(Key::Velocity(0), Value::Velocity(Vector3::x())),
            Err(SmootherError::KeyAlreadyExists(Key::Velocity(0)))
        ));
    }

    #[test]
    fn test_typed_access() {
        let mut values = Values::new();
        values.upsert(Key::Landmark(3), Value::Point(Vector3::new(1.0, 2.0, 3.0)));
        assert_eq!(values.point(&Key::Landmark(3)).unwrap().y, 2.0);
        assert!(matches!(
            values.pose(&Key::Landmark(3)),
            Err(SmootherError::WrongValueType(_))
        ));
        assert!(matches!(
            values.pose(&Key::Pose(3)),
            Err(SmootherError::MissingKey(_))
        ));
    }

    #[test]
    fn test_graph_error_sums_factors() {
        let noise = NoiseModel::isotropic(3, 1.0).shared();
        let mut graph = FactorGraph::new();
        graph.add(Factor::Prior(PriorFactor::Velocity {
            key: Key::Velocity(0),
            prior: Vector3::zeros(),
            noise: noise.clone(),
        }));
        graph.add(Factor::Prior(PriorFactor::Velocity {
            key: Key::Velocity(1),
            prior: Vector3::zeros(),
            noise,
        }));

        let mut values = Values::new();
        values.upsert(Key::Velocity(0), Value::Velocity(Vector3::new(1.0, 0.0, 0.0)));
        values.upsert(Key::Velocity(1), Value::Velocity(Vector3::new(0.0, 2.0, 0.0)));
        assert!((graph.error(&values).unwrap() - 2.5).abs() < 1e-12);

        values.remove(&Key::Velocity(1));
        assert!(graph.error(&values).is_err());
        assert_eq!(Key::Velocity(1).to_string(), "v1");
    }

    #[test]
    fn test_validate_noise_dimension() {
        let velocity = Factor::Prior(PriorFactor::Velocity {
            key: Key::Velocity(0),
            prior: Vector3::zeros(),
            noise: NoiseModel::isotropic(3, 0.1).shared(),
        });
        assert_eq!(velocity.dim(), 3);
        assert!(velocity.validate().is_ok());

        let pose = Factor::Prior(PriorFactor::Pose {
            key: Key::Pose(0),
            prior: Pose3::identity(),
            noise: NoiseModel::isotropic(3, 0.1).shared(),
        });
        assert_eq!(pose.dim(), 6);
        assert!(matches!(pose.validate(), Err(SmootherError::Numeric(_))));
    }
}
