use thiserror::Error;

use crate::factors::Key;
use crate::types::Stamp;

/// Rejections from integrating, splitting or re-integrating a propagation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PropagationError {
    #[error("Negative dt ({dt:.6} s), skipping IMU integration")]
    NegativeInterval { dt: f64 },

    #[error("Zero dt, skipping IMU integration")]
    ZeroInterval,

    #[error("Split time {t:.6} outside propagation span [{start:.6}, {end:.6}]")]
    OutsideSpan { t: Stamp, start: Stamp, end: Stamp },

    #[error("No IMU measurements bracket split time {t:.6}")]
    NoBracket { t: Stamp },

    #[error("Repropagation failed at sample {index}: {source}")]
    Repropagation {
        index: usize,
        #[source]
        source: Box<PropagationError>,
    },
}

/// Failures reported by the fixed-lag smoother
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SmootherError {
    #[error("Key {0} already exists")]
    KeyAlreadyExists(Key),

    #[error("Key {0} not found in the estimate")]
    MissingKey(Key),

    #[error("Value at key {0} has a different type")]
    WrongValueType(Key),

    #[error("Numeric failure: {0}")]
    Numeric(String),
}

/// Rejections from the asynchronous solve lifecycle
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizationError {
    #[error("Optimization thread still running")]
    SolveRunning,

    #[error("Optimization thread not joined, get result first")]
    ResultNotRetrieved,

    #[error("No optimization outstanding")]
    NoOutstandingSolve,

    #[error("No new result")]
    NoNewResult,

    #[error("No smoother set")]
    NoSmoother,

    #[error("Optimization thread panicked")]
    WorkerPanicked,

    #[error("Result cache lock poisoned")]
    LockPoisoned,
}

/// Failures from the background solve itself
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    #[error("Smoother update failed: {0}")]
    Update(#[source] SmootherError),

    #[error("Failed to read estimate at idx {idx}: {source}")]
    Estimate {
        idx: u64,
        #[source]
        source: SmootherError,
    },

    #[error("Failed to repropagate from idx {idx}: {source}")]
    Repropagate {
        idx: u64,
        #[source]
        source: PropagationError,
    },
}

/// Invalid estimator configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown robust loss index: {0}")]
    UnknownLoss(u8),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
