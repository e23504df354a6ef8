// config.rs — Estimator parameters
//
// Everything tunable about the estimator lives here: frame naming, IMU noise,
// prior and measurement sigmas, robust loss selection and the smoother window.
// Loaded from JSON; missing fields fall back to the defaults below.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ConfigError;
use crate::estimator::smoother::SlidingWindowSmoother;
use crate::factors::{
    ImuBias, ImuParams, NoiseModel, PreintegratedImuMeasurements, RobustLoss, SharedNoiseModel,
};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub odom_frame_id: String,

    // ── IMU ──
    pub gravity: f64,
    pub accelerometer_sigma: f64,
    pub gyroscope_sigma: f64,
    pub integration_sigma: f64,
    pub bias_acc_sigma: f64,
    pub bias_omega_sigma: f64,
    pub bias_acc_int_sigma: f64,
    pub bias_omega_int_sigma: f64,
    pub initial_bias_acc: Vector3<f64>,
    pub initial_bias_gyro: Vector3<f64>,

    // ── Priors ──
    pub prior_rotation_sigma: Vector3<f64>,
    pub prior_position_sigma: Vector3<f64>,
    pub prior_velocity_sigma: f64,
    pub prior_bias_acc_sigma: f64,
    pub prior_bias_gyro_sigma: f64,

    // ── Radar ──
    pub radar_doppler_sigma: f64,
    pub radar_doppler_loss: u8,
    pub radar_track_bearing_sigma: f64,
    pub radar_track_range_sigma: f64,
    pub radar_track_loss: u8,

    // ── Baro ──
    pub baro_height_sigma: f64,
    pub baro_loss: u8,

    // ── Stationary updates ──
    pub zero_velocity_sigma: f64,

    // ── Smoother ──
    pub smoother_lag: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            odom_frame_id: "odom".to_string(),
            gravity: 9.81,
            accelerometer_sigma: 0.02,
            gyroscope_sigma: 0.002,
            integration_sigma: 1e-4,
            bias_acc_sigma: 4e-3,
            bias_omega_sigma: 4e-5,
            bias_acc_int_sigma: 1e-5,
            bias_omega_int_sigma: 1e-5,
            initial_bias_acc: Vector3::zeros(),
            initial_bias_gyro: Vector3::zeros(),
            prior_rotation_sigma: Vector3::new(0.01, 0.01, 1e-6),
            prior_position_sigma: Vector3::new(1e-6, 1e-6, 1e-6),
            prior_velocity_sigma: 0.1,
            prior_bias_acc_sigma: 0.1,
            prior_bias_gyro_sigma: 0.01,
            radar_doppler_sigma: 0.05,
            radar_doppler_loss: 3,
            radar_track_bearing_sigma: 0.05,
            radar_track_range_sigma: 0.1,
            radar_track_loss: 3,
            baro_height_sigma: 0.5,
            baro_loss: 0,
            zero_velocity_sigma: 0.01,
            smoother_lag: 3.0,
        }
    }
}

/// Noise models built once from the configuration and shared by all factors
#[derive(Clone, Debug)]
pub struct NoiseModels {
    pub prior_pose: SharedNoiseModel,
    pub prior_velocity: SharedNoiseModel,
    pub prior_bias: SharedNoiseModel,
    pub radar_doppler: SharedNoiseModel,
    pub radar_track: SharedNoiseModel,
    pub baro_height: SharedNoiseModel,
    pub zero_velocity: SharedNoiseModel,
}

fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::InvalidParameter {
            name,
            reason: format!("must be positive and finite, got {}", value),
        })
    }
}

impl EstimatorConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.odom_frame_id.is_empty() {
            return Err(ConfigError::InvalidParameter {
                name: "odom_frame_id",
                reason: "must not be empty".to_string(),
            });
        }
        positive("gravity", self.gravity)?;
        positive("accelerometer_sigma", self.accelerometer_sigma)?;
        positive("gyroscope_sigma", self.gyroscope_sigma)?;
        positive("integration_sigma", self.integration_sigma)?;
        positive("bias_acc_sigma", self.bias_acc_sigma)?;
        positive("bias_omega_sigma", self.bias_omega_sigma)?;
        positive("bias_acc_int_sigma", self.bias_acc_int_sigma)?;
        positive("bias_omega_int_sigma", self.bias_omega_int_sigma)?;
        for s in self.prior_rotation_sigma.iter() {
            positive("prior_rotation_sigma", *s)?;
        }
        for s in self.prior_position_sigma.iter() {
            positive("prior_position_sigma", *s)?;
        }
        positive("prior_velocity_sigma", self.prior_velocity_sigma)?;
        positive("prior_bias_acc_sigma", self.prior_bias_acc_sigma)?;
        positive("prior_bias_gyro_sigma", self.prior_bias_gyro_sigma)?;
        positive("radar_doppler_sigma", self.radar_doppler_sigma)?;
        positive("radar_track_bearing_sigma", self.radar_track_bearing_sigma)?;
        positive("radar_track_range_sigma", self.radar_track_range_sigma)?;
        positive("baro_height_sigma", self.baro_height_sigma)?;
        positive("zero_velocity_sigma", self.zero_velocity_sigma)?;
        positive("smoother_lag", self.smoother_lag)?;

        RobustLoss::from_index(self.radar_doppler_loss)?;
        RobustLoss::from_index(self.radar_track_loss)?;
        RobustLoss::from_index(self.baro_loss)?;
        Ok(())
    }

    pub fn imu_params(&self) -> ImuParams {
        ImuParams {
            gravity: Vector3::new(0.0, 0.0, -self.gravity),
            accelerometer_sigma: self.accelerometer_sigma,
            gyroscope_sigma: self.gyroscope_sigma,
            integration_sigma: self.integration_sigma,
            bias_acc_sigma: self.bias_acc_sigma,
            bias_omega_sigma: self.bias_omega_sigma,
            bias_acc_int_sigma: self.bias_acc_int_sigma,
            bias_omega_int_sigma: self.bias_omega_int_sigma,
        }
    }

    pub fn initial_bias(&self) -> ImuBias {
        ImuBias::new(self.initial_bias_acc, self.initial_bias_gyro)
    }

    /// Empty preintegration to start the first propagation with
    pub fn initial_integrator(&self) -> PreintegratedImuMeasurements {
        PreintegratedImuMeasurements::new(Arc::new(self.imu_params()), self.initial_bias())
    }

    pub fn noise_models(&self) -> Result<NoiseModels, ConfigError> {
        let bias = [
            self.prior_bias_acc_sigma,
            self.prior_bias_acc_sigma,
            self.prior_bias_acc_sigma,
            self.prior_bias_gyro_sigma,
            self.prior_bias_gyro_sigma,
            self.prior_bias_gyro_sigma,
        ];
        let track = [
            self.radar_track_bearing_sigma,
            self.radar_track_bearing_sigma,
            self.radar_track_range_sigma,
        ];

        Ok(NoiseModels {
            prior_pose: NoiseModel::pose(&self.prior_rotation_sigma, &self.prior_position_sigma)
                .shared(),
            prior_velocity: NoiseModel::isotropic(3, self.prior_velocity_sigma).shared(),
            prior_bias: NoiseModel::diagonal(&bias).shared(),
            radar_doppler: NoiseModel::isotropic(1, self.radar_doppler_sigma)
                .with_loss(RobustLoss::from_index(self.radar_doppler_loss)?)
                .shared(),
            radar_track: NoiseModel::diagonal(&track)
                .with_loss(RobustLoss::from_index(self.radar_track_loss)?)
                .shared(),
            baro_height: NoiseModel::isotropic(1, self.baro_height_sigma)
                .with_loss(RobustLoss::from_index(self.baro_loss)?)
                .shared(),
            zero_velocity: NoiseModel::isotropic(3, self.zero_velocity_sigma).shared(),
        })
    }

    pub fn smoother(&self) -> SlidingWindowSmoother {
        SlidingWindowSmoother::new(self.smoother_lag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::smoother::FixedLagSmoother;

    #[test]
    fn test_default_is_valid() {
        let config = EstimatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.imu_params().gravity, Vector3::new(0.0, 0.0, -9.81));
        assert_eq!(config.smoother().smoother_lag(), 3.0);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EstimatorConfig::from_json(
            r#"{ "odom_frame_id": "world", "smoother_lag": 1.5, "baro_loss": 2 }"#,
        )
        .unwrap();
        assert_eq!(config.odom_frame_id, "world");
        assert_eq!(config.smoother_lag, 1.5);
        assert_eq!(config.radar_doppler_sigma, EstimatorConfig::default().radar_doppler_sigma);

        let noise = config.noise_models().unwrap();
        assert_eq!(noise.baro_height.loss(), Some(RobustLoss::Huber(1.345)));
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = EstimatorConfig::default();
        config.initial_bias_gyro = Vector3::new(0.0, 0.0, 0.003);
        let parsed = EstimatorConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.initial_integrator().bias_hat().gyroscope.z, 0.003);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            EstimatorConfig::from_json(r#"{ "radar_track_loss": 9 }"#),
            Err(ConfigError::UnknownLoss(9))
        ));
        assert!(matches!(
            EstimatorConfig::from_json(r#"{ "smoother_lag": -1.0 }"#),
            Err(ConfigError::InvalidParameter { name: "smoother_lag", .. })
        ));
        assert!(matches!(
            EstimatorConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_noise_model_dimensions() {
        let noise = EstimatorConfig::default().noise_models().unwrap();
        assert_eq!(noise.prior_pose.dim(), 6);
        assert_eq!(noise.prior_velocity.dim(), 3);
        assert_eq!(noise.prior_bias.dim(), 6);
        assert_eq!(noise.radar_doppler.dim(), 1);
        assert_eq!(noise.radar_track.dim(), 3);
        assert_eq!(noise.radar_track.loss(), Some(RobustLoss::Cauchy(2.3849)));
        assert_eq!(noise.baro_height.loss(), None);
        assert_eq!(noise.zero_velocity.dim(), 3);
    }
}
