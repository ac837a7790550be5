//! Off-policy ratio controller.
//!
//! Keeps the fraction of off-policy experiences in the replay memory near a
//! configured target by annealing the on-policy cutoff band and penalizing
//! the learning rate through the REFER β coefficient.
//!
//! ## References
//!
//! - Novati & Koumoutsakos, "Remember and Forget for Experience Replay"
//!   (2019)

use crate::config::OffPolicySettings;
use serde::{Deserialize, Serialize};

/// Mutable state of the controller, serialized into checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffPolicyState {
    /// Off-policy experiences at the last tick.
    pub count: usize,
    /// `count / buffer size` at the last tick.
    pub ratio: f64,
    /// Current cutoff: on-policy iff `1/cutoff ≤ w ≤ cutoff`.
    pub current_cutoff: f64,
    pub annealing_rate: f64,
    pub refer_beta: f64,
    pub current_learning_rate: f64,
}

/// Controller annealing the cutoff and learning rate toward the off-policy
/// target.
#[derive(Debug, Clone)]
pub struct OffPolicyController {
    target: f64,
    annealing_rate: f64,
    base_learning_rate: f64,
    beta: f64,
    cutoff: f64,
    current_learning_rate: f64,
    last_count: usize,
    last_ratio: f64,
}

impl OffPolicyController {
    /// Create a controller from the replay settings and the base learning
    /// rate η0.
    pub fn new(settings: &OffPolicySettings, base_learning_rate: f64) -> Self {
        Self {
            target: settings.target,
            annealing_rate: settings.annealing_rate,
            base_learning_rate,
            beta: settings.refer_beta,
            cutoff: settings.cutoff_scale,
            current_learning_rate: base_learning_rate / (1.0 + settings.refer_beta),
            last_count: 0,
            last_ratio: 0.0,
        }
    }

    /// Current on-policy cutoff.
    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    /// Current REFER β.
    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Learning rate after the off-policy penalty, `η0 / (1 + β)`.
    pub fn learning_rate(&self) -> f64 {
        self.current_learning_rate
    }

    /// Fold one observation of the replay's off-policy occupancy into the
    /// controller. Above target the band tightens and learning slows; at or
    /// below target both relax.
    pub fn tick(&mut self, off_policy_count: usize, buffer_size: usize) {
        self.last_count = off_policy_count;
        self.last_ratio = if buffer_size == 0 {
            0.0
        } else {
            off_policy_count as f64 / buffer_size as f64
        };

        if self.last_ratio > self.target {
            self.beta += self.annealing_rate;
            self.cutoff /= 1.0 + self.annealing_rate;
        } else {
            self.beta = (self.beta - self.annealing_rate).max(0.0);
            self.cutoff *= 1.0 + self.annealing_rate;
        }
        self.current_learning_rate = self.base_learning_rate / (1.0 + self.beta);
    }

    /// Export the controller state for checkpointing.
    pub fn export_state(&self) -> OffPolicyState {
        OffPolicyState {
            count: self.last_count,
            ratio: self.last_ratio,
            current_cutoff: self.cutoff,
            annealing_rate: self.annealing_rate,
            refer_beta: self.beta,
            current_learning_rate: self.current_learning_rate,
        }
    }

    /// Restore the controller from a checkpointed state.
    pub fn restore_state(&mut self, state: &OffPolicyState) {
        self.last_count = state.count;
        self.last_ratio = state.ratio;
        self.cutoff = state.current_cutoff;
        self.annealing_rate = state.annealing_rate;
        self.beta = state.refer_beta;
        self.current_learning_rate = state.current_learning_rate;
    }
}
