//! Trait seams for the external collaborators of the engine.
//!
//! The engine owns dispatch, replay and the generation state machine; the
//! mathematics live behind these traits. Optimizer variants implement
//! [`DistributionUpdater`], learning algorithms implement [`PolicyLearner`],
//! and the evaluated systems implement [`Problem`] (scalar fitness) or
//! [`Environment`] (episodic interaction).

use crate::error::Result;
use crate::replay::buffer::ReplayBuffer;
use crate::replay::experience::{ExperienceId, PolicySnapshot, TerminationKind};

/// A fitness-evaluation problem for optimization mode.
pub trait Problem: Send {
    /// Check the problem definition. Errors abort the run before dispatch.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Number of parameters P of a candidate vector.
    fn parameter_count(&self) -> usize;

    /// Evaluate one candidate. A non-finite return value is fatal.
    fn evaluate_fitness(&self, parameters: &[f64]) -> f64;
}

/// Coordinator side of the per-step episode channel.
///
/// An environment drives its episode through this link: it ships the current
/// state together with the reward earned by the previous action and receives
/// the next action in return. The first exchange of an episode carries a
/// reward of zero, which the coordinator ignores.
pub trait EpisodeLink {
    /// Ship `state` and the previous step's `reward`; block until the
    /// coordinator answers with an action.
    fn exchange(&mut self, state: &[f64], reward: f64) -> Result<Vec<f64>>;

    /// Close the episode. `reward` belongs to the final action; truncated
    /// episodes also ship the state they were cut at.
    fn finish(
        &mut self,
        termination: TerminationKind,
        reward: f64,
        truncated_state: Option<&[f64]>,
    ) -> Result<()>;
}

/// An episodic environment for agent mode. One instance exists per rank.
pub trait Environment: Send {
    /// Number of distinct environment variants hosted by this instance.
    fn environment_count(&self) -> usize {
        1
    }

    /// Dimension of the state vectors shipped over the link.
    fn state_dimension(&self) -> usize;

    /// Dimension of the action vectors received over the link.
    fn action_dimension(&self) -> usize;

    /// Run one full episode of the given variant over the link, from reset to
    /// terminal or truncation.
    fn run_episode(&mut self, environment_id: usize, link: &mut dyn EpisodeLink) -> Result<()>;
}

/// Sequential update rule of a population-based optimizer.
pub trait DistributionUpdater: Send {
    /// Prepare internal state before the first generation.
    fn initialize(&mut self) -> Result<()>;

    /// Fill `samples` (λ rows of `parameter_count` entries, flattened) with
    /// the next wave of candidates.
    fn generate_wave(&mut self, samples: &mut [f64]);

    /// Fold the wave's fitness values back into the search distribution.
    fn update_distribution(&mut self, fitness: &[f64]);

    /// Optimizer-specific convergence predicate, checked once per generation.
    fn check_termination(&self) -> bool {
        false
    }

    /// Report final results on clean termination.
    fn print_results(&self) {}
}

/// A learning algorithm driving the agent's policy.
pub trait PolicyLearner: Send {
    /// Produce an action and the policy snapshot that generated it.
    fn action(&mut self, state: &[f64]) -> (Vec<f64>, PolicySnapshot);

    /// Evaluate the current policy on a batch of states.
    fn run_policy(&self, states: &[&[f64]]) -> Result<Vec<PolicySnapshot>>;

    /// Importance weight π_cur(a|s) / π_old(a|s) of a recorded action under a
    /// re-evaluated policy.
    fn importance_weight(
        &self,
        action: &[f64],
        current: &PolicySnapshot,
        behavior: &PolicySnapshot,
    ) -> f64;

    /// Perform one gradient step over the given mini-batch.
    fn step(
        &mut self,
        buffer: &ReplayBuffer,
        mini_batch: &[ExperienceId],
        learning_rate: f64,
    ) -> Result<()>;

    /// Lower and upper action bounds, if the action space is bounded. Used by
    /// the out-of-bound reward penalization.
    fn action_bounds(&self) -> Option<(&[f64], &[f64])> {
        None
    }

    /// Export the policy hyperparameters for checkpointing.
    fn export_hyperparameters(&self) -> serde_json::Value;

    /// Restore the policy hyperparameters from a checkpoint.
    fn import_hyperparameters(&mut self, hyperparameters: serde_json::Value) -> Result<()>;
}
