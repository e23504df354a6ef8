//! Per-stage latency statistics

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::types::Stamp;

/// Timing statistics of one processing stage, in milliseconds
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    /// Data time the latest measurement refers to
    pub stamp: Stamp,
    pub label: String,
    /// Duration of the latest run
    pub iteration: f64,
    pub total: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: u64,
}

impl Timing {
    pub fn record(&mut self, label: &str, elapsed: Duration, stamp: Stamp) {
        let ms = elapsed.as_secs_f64() * 1e3;
        self.count += 1;
        self.stamp = stamp;
        self.label = label.to_string();
        self.iteration = ms;
        self.total += ms;
        if self.count == 1 {
            self.min = ms;
            self.max = ms;
        } else {
            self.min = self.min.min(ms);
            self.max = self.max.max(ms);
        }
        self.mean = self.total / self.count as f64;
    }
}

/// Timings keyed by stage label
pub type TimingMap = BTreeMap<String, Timing>;

/// Measures one stage from `start` until `stop`
pub struct StageTimer {
    label: &'static str,
    start: Instant,
}

impl StageTimer {
    pub fn start(label: &'static str) -> Self {
        Self {
            label,
            start: Instant::now(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record the elapsed time into `timings` and return it
    pub fn stop(self, timings: &mut TimingMap, stamp: Stamp) -> Duration {
        let elapsed = self.elapsed();
        record(timings, self.label, elapsed, stamp);
        elapsed
    }
}

pub fn record(timings: &mut TimingMap, label: &str, elapsed: Duration, stamp: Stamp) {
    timings
        .entry(label.to_string())
        .or_default()
        .record(label, elapsed, stamp);
}
