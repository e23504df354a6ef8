pub mod linalg;

pub use linalg::*;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Timestamp in seconds
pub type Stamp = f64;

/// Single IMU reading: specific force and angular rate in the IMU frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    pub timestamp: Stamp,
    pub frame_id: String,
    pub linear_acceleration: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
}

impl ImuSample {
    pub fn new(
        timestamp: Stamp,
        frame_id: &str,
        linear_acceleration: Vector3<f64>,
        angular_velocity: Vector3<f64>,
    ) -> Self {
        Self {
            timestamp,
            frame_id: frame_id.to_string(),
            linear_acceleration,
            angular_velocity,
        }
    }

    /// Copy of this sample re-stamped at `timestamp` (zero-order hold)
    pub fn hold_at(&self, timestamp: Stamp) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }
}

/// CFAR radar detection in the radar frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RadarDetection {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Measured radial (Doppler) velocity [m/s]
    pub velocity: f64,
    pub snr: i16,
    pub noise: i16,
}

impl RadarDetection {
    pub fn new(x: f64, y: f64, z: f64, velocity: f64) -> Self {
        Self {
            x,
            y,
            z,
            velocity,
            snr: 0,
            noise: 0,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn range(&self) -> f64 {
        self.position().norm()
    }
}

/// Persistent radar landmark produced by the track manager
///
/// Shared between the tracker and the propagations that observe it. The
/// `added` flag records whether the landmark has been seeded in the graph.
#[derive(Debug)]
pub struct RadarTrack {
    id: u64,
    /// Latest landmark position in the radar frame (R_p_RT)
    position: Vector3<f64>,
    added: AtomicBool,
}

impl RadarTrack {
    pub fn new(id: u64, position: Vector3<f64>) -> Self {
        Self {
            id,
            position,
            added: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn position(&self) -> &Vector3<f64> {
        &self.position
    }

    pub fn is_added(&self) -> bool {
        self.added.load(Ordering::Acquire)
    }

    pub fn set_added(&self) {
        self.added.store(true, Ordering::Release);
    }
}
