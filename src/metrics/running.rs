//! Streaming statistics over per-iteration and per-epoch values.

use std::collections::HashMap;

/// Online mean.
///
/// Uses the incremental update `mean += (x - mean) / n` for numerical stability.
#[derive(Debug, Clone, Default)]
pub struct RunningMean {
    mean: f64,
    count: usize,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
    }

    /// Current mean, `0.0` when nothing was added.
    pub fn compute(&self) -> f64 {
        self.mean
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        self.mean = 0.0;
        self.count = 0;
    }
}

/// Per-epoch history of named metrics, tracking the lowest value of each.
#[derive(Debug, Clone, Default)]
pub struct MetricLogger {
    history: HashMap<String, Vec<(usize, f64)>>,
    best: HashMap<String, (f64, usize)>, // (value, epoch)
}

impl MetricLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` of metric `name` for `epoch`.
    pub fn log(&mut self, name: &str, epoch: usize, value: f64) {
        self.history.entry(name.to_string()).or_default().push((epoch, value));
        let is_better = match self.best.get(name) {
            Some((best, _)) => value < *best,
            None => true,
        };
        if is_better {
            self.best.insert(name.to_string(), (value, epoch));
        }
    }

    pub fn get_history(&self, name: &str) -> Option<&[(usize, f64)]> {
        self.history.get(name).map(Vec::as_slice)
    }

    /// Lowest value of `name` and the epoch it was reached in.
    pub fn get_best(&self, name: &str) -> Option<(f64, usize)> {
        self.best.get(name).copied()
    }

    pub fn get_last(&self, name: &str) -> Option<f64> {
        self.history.get(name).and_then(|h| h.last()).map(|&(_, v)| v)
    }
}
