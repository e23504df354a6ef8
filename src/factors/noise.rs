/// Noise models for factor residuals
///
/// A diagonal Gaussian model with an optional m-estimator on top. Robust
/// constants are chosen as c times the standard deviation (Zhang 1997,
/// "Parameter Estimation Techniques: A Tutorial with Application to Conic
/// Fitting").
use nalgebra::{DVector, Vector3};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ConfigError, SmootherError};

/// Noise model shared between all factors built from the same configuration
pub type SharedNoiseModel = Arc<NoiseModel>;

/// Robust loss applied to the whitened residual norm
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum RobustLoss {
    Fair(f64),
    Huber(f64),
    Cauchy(f64),
    GemanMcClure(f64),
    Welsch(f64),
    Tukey(f64),
}

impl RobustLoss {
    /// Loss by configuration index; 0 selects a plain Gaussian model
    pub fn from_index(index: u8) -> Result<Option<Self>, ConfigError> {
        match index {
            0 => Ok(None),
            1 => Ok(Some(RobustLoss::Fair(1.3998))),
            2 => Ok(Some(RobustLoss::Huber(1.345))),
            3 => Ok(Some(RobustLoss::Cauchy(2.3849))),
            4 => Ok(Some(RobustLoss::GemanMcClure(1.0))),
            5 => Ok(Some(RobustLoss::Welsch(2.9846))),
            6 => Ok(Some(RobustLoss::Tukey(4.6851))),
            other => Err(ConfigError::UnknownLoss(other)),
        }
    }

    /// Robust cost rho(e) for a whitened residual norm `e`
    pub fn cost(&self, e: f64) -> f64 {
        let e = e.abs();
        match *self {
            RobustLoss::Fair(c) => c * c * (e / c - (1.0 + e / c).ln()),
            RobustLoss::Huber(k) => {
                if e <= k {
                    0.5 * e * e
                } else {
                    k * (e - 0.5 * k)
                }
            }
            RobustLoss::Cauchy(c) => 0.5 * c * c * (1.0 + (e / c).powi(2)).ln(),
            RobustLoss::GemanMcClure(c) => 0.5 * c * c * e * e / (c * c + e * e),
            RobustLoss::Welsch(c) => 0.5 * c * c * (1.0 - (-(e / c).powi(2)).exp()),
            RobustLoss::Tukey(c) => {
                if e <= c {
                    let r = 1.0 - (e / c).powi(2);
                    c * c / 6.0 * (1.0 - r * r * r)
                } else {
                    c * c / 6.0
                }
            }
        }
    }

    /// IRLS weight w(e) = rho'(e) / e
    pub fn weight(&self, e: f64) -> f64 {
        let e = e.abs();
        match *self {
            RobustLoss::Fair(c) => 1.0 / (1.0 + e / c),
            RobustLoss::Huber(k) => {
                if e <= k {
                    1.0
                } else {
                    k / e
                }
            }
            RobustLoss::Cauchy(c) => 1.0 / (1.0 + (e / c).powi(2)),
            RobustLoss::GemanMcClure(c) => {
                let d = c * c + e * e;
                c.powi(4) / (d * d)
            }
            RobustLoss::Welsch(c) => (-(e / c).powi(2)).exp(),
            RobustLoss::Tukey(c) => {
                if e <= c {
                    (1.0 - (e / c).powi(2)).powi(2)
                } else {
                    0.0
                }
            }
        }
    }
}

/// Diagonal Gaussian noise with optional robust loss
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoiseModel {
    sigmas: DVector<f64>,
    loss: Option<RobustLoss>,
}

impl NoiseModel {
    pub fn diagonal(sigmas: &[f64]) -> Self {
        Self {
            sigmas: DVector::from_column_slice(sigmas),
            loss: None,
        }
    }

    pub fn isotropic(dim: usize, sigma: f64) -> Self {
        Self {
            sigmas: DVector::from_element(dim, sigma),
            loss: None,
        }
    }

    /// Pose noise from rotation and translation sigmas (rotation first)
    pub fn pose(rotation: &Vector3<f64>, translation: &Vector3<f64>) -> Self {
        Self::diagonal(&[
            rotation.x,
            rotation.y,
            rotation.z,
            translation.x,
            translation.y,
            translation.z,
        ])
    }

    pub fn with_loss(mut self, loss: Option<RobustLoss>) -> Self {
        self.loss = loss;
        self
    }

    pub fn shared(self) -> SharedNoiseModel {
        Arc::new(self)
    }

    pub fn dim(&self) -> usize {
        self.sigmas.len()
    }

    pub fn sigmas(&self) -> &DVector<f64> {
        &self.sigmas
    }

    pub fn loss(&self) -> Option<RobustLoss> {
        self.loss
    }

    /// Divide each residual entry by its sigma
    pub fn whiten(&self, residual: &[f64]) -> Result<DVector<f64>, SmootherError> {
        if residual.len() != self.dim() {
            return Err(SmootherError::Numeric(format!(
                "residual of dimension {} does not match noise model of dimension {}",
                residual.len(),
                self.dim()
            )));
        }
        Ok(DVector::from_iterator(
            residual.len(),
            residual
                .iter()
                .zip(self.sigmas.iter())
                .map(|(r, s)| r / s),
        ))
    }

    /// Cost of an unwhitened residual: 0.5 * |r|²_Σ, or rho(|r|_Σ) when robust
    pub fn cost(&self, residual: &[f64]) -> Result<f64, SmootherError> {
        let e = self.whiten(residual)?.norm();
        Ok(match self.loss {
            Some(loss) => loss.cost(e),
            None => 0.5 * e * e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_loss_indices() {
        assert_eq!(RobustLoss::from_index(0).unwrap(), None);
        assert_eq!(
            RobustLoss::from_index(2).unwrap(),
            Some(RobustLoss::Huber(1.345))
        );
        assert!(RobustLoss::from_index(7).is_err());
    }

    #[test]
    fn test_gaussian_cost() {
        let noise = NoiseModel::diagonal(&[0.5, 2.0]);
        // whitened = [2, 1]
        assert_relative_eq!(noise.cost(&[1.0, 2.0]).unwrap(), 2.5, epsilon = 1e-12);
    }

    #[test]
    fn test_robust_losses_match_gaussian_near_zero() {
        for index in 1..=6 {
            let loss = RobustLoss::from_index(index).unwrap().unwrap();
            assert_relative_eq!(loss.cost(1e-3), 0.5e-6, epsilon = 1e-9);
            assert_relative_eq!(loss.weight(1e-4), 1.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_robust_losses_downweight_outliers() {
        let noise = NoiseModel::isotropic(1, 1.0);
        let huber = noise.clone().with_loss(RobustLoss::from_index(2).unwrap());
        assert!(huber.cost(&[10.0]).unwrap() < noise.cost(&[10.0]).unwrap());

        let tukey = RobustLoss::Tukey(4.6851);
        assert_eq!(tukey.weight(10.0), 0.0);
        assert_relative_eq!(tukey.cost(10.0), 4.6851 * 4.6851 / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        let noise = NoiseModel::isotropic(3, 0.1);
        assert!(matches!(
            noise.cost(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            Err(SmootherError::Numeric(_))
        ));
        assert!(noise.whiten(&[1.0]).is_err());
        assert_eq!(noise.whiten(&[0.1, 0.2, 0.3]).unwrap().len(), 3);
    }
}
