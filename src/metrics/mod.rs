//! Per-generation progress reporting.
//!
//! The driver emits one [`GenerationSnapshot`] per generation; loggers decide
//! how to render it. Console output prints a fixed-width table, CSV output
//! appends machine-readable rows, and [`SharedMetrics`] exposes the latest
//! snapshot to observers on other threads.

mod logger;

pub use logger::{ConsoleLogger, CsvLogger, MetricsLogger, NullLogger};

use parking_lot::RwLock;
use std::sync::Arc;

/// Progress of one generation.
#[derive(Debug, Clone, Default)]
pub struct GenerationSnapshot {
    pub generation: usize,
    pub fitness_evaluations: usize,
    pub best_fitness: f64,
    pub episodes: usize,
    pub experiences: usize,
    pub policy_updates: usize,
    pub average_reward: f64,
    pub best_reward: f64,
    pub off_policy_ratio: f64,
    pub learning_rate: f64,
    pub cutoff: f64,
}

impl GenerationSnapshot {
    /// Create a snapshot for a generation.
    pub fn new(generation: usize) -> Self {
        Self {
            generation,
            ..Default::default()
        }
    }

    /// Attach optimizer-mode progress.
    pub fn with_fitness(mut self, evaluations: usize, best_fitness: f64) -> Self {
        self.fitness_evaluations = evaluations;
        self.best_fitness = best_fitness;
        self
    }

    /// Attach agent-mode progress.
    pub fn with_training(
        mut self,
        episodes: usize,
        experiences: usize,
        policy_updates: usize,
        average_reward: f64,
        best_reward: f64,
    ) -> Self {
        self.episodes = episodes;
        self.experiences = experiences;
        self.policy_updates = policy_updates;
        self.average_reward = average_reward;
        self.best_reward = best_reward;
        self
    }

    /// Attach the off-policy controller's readout.
    pub fn with_off_policy(mut self, ratio: f64, learning_rate: f64, cutoff: f64) -> Self {
        self.off_policy_ratio = ratio;
        self.learning_rate = learning_rate;
        self.cutoff = cutoff;
        self
    }
}

/// Latest snapshot shared with observers on other threads.
#[derive(Debug, Clone, Default)]
pub struct SharedMetrics {
    inner: Arc<RwLock<GenerationSnapshot>>,
}

impl SharedMetrics {
    /// Create empty shared metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a snapshot.
    pub fn publish(&self, snapshot: &GenerationSnapshot) {
        *self.inner.write() = snapshot.clone();
    }

    /// Read the latest published snapshot.
    pub fn latest(&self) -> GenerationSnapshot {
        self.inner.read().clone()
    }
}

impl MetricsLogger for SharedMetrics {
    fn log(&mut self, snapshot: &GenerationSnapshot) {
        self.publish(snapshot);
    }

    fn flush(&mut self) {}
}
