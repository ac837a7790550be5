//! Engine configuration.
//!
//! The recognized options form a closed, strongly typed record. Free-form
//! settings for pluggable strategies go into the opaque [`EngineConfig::extensions`]
//! subtree, which the engine carries but never interprets.
//!
//! Every section provides builder-style setters; [`EngineConfig::validate`]
//! runs once at startup and aborts the run with
//! [`EngineError::Configuration`](crate::error::EngineError) before any rank
//! is spawned.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Operation mode of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Collect experiences and update the policy / distribution.
    Training,
    /// Run the current policy for a fixed number of episodes, no updates.
    Testing,
}

/// Strategy for drawing mini-batches from the replay buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MiniBatchStrategy {
    /// Draw without replacement, uniformly over the stored experiences.
    Uniform,
    /// Draw proportionally to stored per-experience priorities.
    Prioritized,
}

/// L2 regularization settings, forwarded to the policy learner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct L2Regularization {
    pub enabled: bool,
    pub importance: f64,
}

impl Default for L2Regularization {
    fn default() -> Self {
        Self {
            enabled: false,
            importance: 1e-4,
        }
    }
}

/// Off-policy (REFER) settings for the experience replay.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OffPolicySettings {
    /// Initial cutoff used to classify experiences as on- or off-policy.
    pub cutoff_scale: f64,
    /// Target fraction of off-policy experiences in the replay memory.
    pub target: f64,
    /// Annealing rate for the cutoff and the learning-rate penalty.
    pub annealing_rate: f64,
    /// Initial penalty coefficient for off-policiness.
    pub refer_beta: f64,
}

impl Default for OffPolicySettings {
    fn default() -> Self {
        Self {
            cutoff_scale: 4.0,
            target: 0.1,
            annealing_rate: 5e-7,
            refer_beta: 0.3,
        }
    }
}

/// Experience replay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceReplaySettings {
    /// Minimum number of experiences before policy updates start.
    pub start_size: usize,
    /// Capacity of the replay memory; oldest experiences are evicted beyond it.
    pub maximum_size: usize,
    /// Whether checkpoints include the full replay contents.
    pub serialize: bool,
    pub off_policy: OffPolicySettings,
}

impl Default for ExperienceReplaySettings {
    fn default() -> Self {
        Self {
            start_size: 1024,
            maximum_size: 32768,
            serialize: true,
            off_policy: OffPolicySettings::default(),
        }
    }
}

/// Penalization of rewards earned by out-of-bound actions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RewardOutboundPenalization {
    pub enabled: bool,
    /// Factor applied to the reward of an out-of-bound action.
    pub factor: f64,
}

impl Default for RewardOutboundPenalization {
    fn default() -> Self {
        Self {
            enabled: false,
            factor: 0.5,
        }
    }
}

/// Termination criteria. Any satisfied predicate ends the run after the
/// current generation completes; `None` disables the predicate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TerminationCriteria {
    pub max_generations: Option<usize>,
    /// Optimizer mode only.
    pub max_fitness_evaluations: Option<usize>,
    /// Agent mode only.
    pub max_episodes: Option<usize>,
    /// Agent mode only.
    pub max_experiences: Option<usize>,
    /// Agent mode only.
    pub max_policy_updates: Option<usize>,
    /// Agent mode only: stop once the running training average reaches this.
    pub target_average_reward: Option<f64>,
}

/// Checkpoint output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutput {
    pub enabled: bool,
    /// Generations between checkpoint dumps.
    pub frequency: usize,
    pub path: PathBuf,
}

impl Default for FileOutput {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: 1,
            path: PathBuf::from("./results"),
        }
    }
}

/// Complete engine configuration.
///
/// Defaults are usable for small smoke runs; real runs override the sizing
/// fields through the `with_*` setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub mode: Mode,
    /// Seed for every engine-owned random stream.
    pub seed: u64,
    /// Number of ranks in the fabric, coordinator included.
    pub rank_count: usize,
    /// Whether rank 0 participates in the worker pool.
    pub coordinator_evaluates: bool,
    /// Wave size λ: samples generated and evaluated per generation.
    pub population_size: usize,
    /// Upper bound on simultaneously in-flight episodes.
    pub concurrent_environments: usize,
    /// Episodes to complete per generation in agent mode.
    pub episodes_per_generation: usize,
    /// Episodes to run when `mode == Testing`.
    pub policy_testing_episodes: usize,
    /// Depth of the running training-reward average.
    pub training_average_depth: usize,
    pub mini_batch_size: usize,
    pub mini_batch_strategy: MiniBatchStrategy,
    /// Contiguous experiences per state sequence for recurrent learners.
    pub time_sequence_length: usize,
    /// Base learning rate η0 before the off-policy penalty.
    pub learning_rate: f64,
    pub l2_regularization: L2Regularization,
    /// Discount factor γ.
    pub discount_factor: f64,
    /// Truncation level c_max for importance weights.
    pub importance_weight_truncation_level: f64,
    pub experience_replay: ExperienceReplaySettings,
    /// Experiences gathered per policy update; values below 1.0 trigger more
    /// than one update per experience.
    pub experiences_between_policy_updates: f64,
    pub state_rescaling_enabled: bool,
    pub reward_rescaling_enabled: bool,
    pub reward_outbound_penalization: RewardOutboundPenalization,
    pub termination: TerminationCriteria,
    pub file_output: FileOutput,
    /// Opaque settings subtree for pluggable updaters and learners.
    #[serde(default)]
    pub extensions: serde_json::Value,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Training,
            seed: 0,
            rank_count: 1,
            coordinator_evaluates: true,
            population_size: 8,
            concurrent_environments: 1,
            episodes_per_generation: 1,
            policy_testing_episodes: 10,
            training_average_depth: 100,
            mini_batch_size: 32,
            mini_batch_strategy: MiniBatchStrategy::Uniform,
            time_sequence_length: 1,
            learning_rate: 1e-4,
            l2_regularization: L2Regularization::default(),
            discount_factor: 0.995,
            importance_weight_truncation_level: 1.0,
            experience_replay: ExperienceReplaySettings::default(),
            experiences_between_policy_updates: 1.0,
            state_rescaling_enabled: false,
            reward_rescaling_enabled: false,
            reward_outbound_penalization: RewardOutboundPenalization::default(),
            termination: TerminationCriteria::default(),
            file_output: FileOutput::default(),
            extensions: serde_json::Value::Null,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the operation mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the number of ranks.
    pub fn with_rank_count(mut self, ranks: usize) -> Self {
        self.rank_count = ranks;
        self
    }

    /// Include or exclude rank 0 from the worker pool.
    pub fn with_coordinator_evaluates(mut self, enabled: bool) -> Self {
        self.coordinator_evaluates = enabled;
        self
    }

    /// Set the wave size λ.
    pub fn with_population_size(mut self, lambda: usize) -> Self {
        self.population_size = lambda;
        self
    }

    /// Set the number of concurrently running environments.
    pub fn with_concurrent_environments(mut self, n: usize) -> Self {
        self.concurrent_environments = n;
        self
    }

    /// Set the number of episodes per generation.
    pub fn with_episodes_per_generation(mut self, n: usize) -> Self {
        self.episodes_per_generation = n;
        self
    }

    /// Set the mini-batch size.
    pub fn with_mini_batch_size(mut self, n: usize) -> Self {
        self.mini_batch_size = n;
        self
    }

    /// Set the mini-batch selection strategy.
    pub fn with_mini_batch_strategy(mut self, strategy: MiniBatchStrategy) -> Self {
        self.mini_batch_strategy = strategy;
        self
    }

    /// Set the base learning rate.
    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set the discount factor.
    pub fn with_discount_factor(mut self, gamma: f64) -> Self {
        self.discount_factor = gamma;
        self
    }

    /// Set the replay settings.
    pub fn with_experience_replay(mut self, replay: ExperienceReplaySettings) -> Self {
        self.experience_replay = replay;
        self
    }

    /// Set the termination criteria.
    pub fn with_termination(mut self, termination: TerminationCriteria) -> Self {
        self.termination = termination;
        self
    }

    /// Set the checkpoint output settings.
    pub fn with_file_output(mut self, file_output: FileOutput) -> Self {
        self.file_output = file_output;
        self
    }

    /// Validate the configuration. Called once before any rank is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.rank_count == 0 {
            return Err(EngineError::configuration("rank count must be at least 1"));
        }
        if self.rank_count == 1 && !self.coordinator_evaluates {
            return Err(EngineError::configuration(
                "a single-rank run requires the coordinator to evaluate",
            ));
        }
        if self.population_size == 0 {
            return Err(EngineError::configuration(
                "population size (lambda) must be at least 1",
            ));
        }
        if self.concurrent_environments == 0 {
            return Err(EngineError::configuration(
                "concurrent environments must be at least 1",
            ));
        }
        if self.episodes_per_generation == 0 {
            return Err(EngineError::configuration(
                "episodes per generation must be at least 1",
            ));
        }
        if self.mode == Mode::Testing && self.policy_testing_episodes == 0 {
            return Err(EngineError::configuration(
                "testing mode needs at least one testing episode",
            ));
        }
        if self.training_average_depth == 0 {
            return Err(EngineError::configuration(
                "training average depth must be at least 1",
            ));
        }
        if self.mini_batch_size == 0 {
            return Err(EngineError::configuration("mini-batch size must be at least 1"));
        }
        if self.time_sequence_length == 0 {
            return Err(EngineError::configuration(
                "time sequence length must be at least 1",
            ));
        }
        if self.mini_batch_size > self.experience_replay.maximum_size {
            return Err(EngineError::configuration(
                "mini-batch size exceeds replay capacity",
            ));
        }
        if self.experience_replay.maximum_size == 0 {
            return Err(EngineError::configuration("replay capacity must be at least 1"));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(EngineError::configuration(
                "learning rate must be finite and positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.discount_factor) {
            return Err(EngineError::configuration(
                "discount factor must lie in [0, 1]",
            ));
        }
        if self.importance_weight_truncation_level < 1.0 {
            return Err(EngineError::configuration(
                "importance weight truncation level must be at least 1",
            ));
        }
        let off_policy = &self.experience_replay.off_policy;
        if off_policy.cutoff_scale <= 0.0 {
            return Err(EngineError::configuration(
                "off-policy cutoff scale must be positive",
            ));
        }
        if !(0.0..1.0).contains(&off_policy.target) {
            return Err(EngineError::configuration(
                "off-policy target must lie in [0, 1)",
            ));
        }
        if off_policy.annealing_rate < 0.0 {
            return Err(EngineError::configuration(
                "off-policy annealing rate must be non-negative",
            ));
        }
        if off_policy.refer_beta < 0.0 {
            return Err(EngineError::configuration("REFER beta must be non-negative"));
        }
        if self.experiences_between_policy_updates <= 0.0 {
            return Err(EngineError::configuration(
                "experiences between policy updates must be positive",
            ));
        }
        if self.reward_outbound_penalization.enabled
            && !(0.0..=1.0).contains(&self.reward_outbound_penalization.factor)
        {
            return Err(EngineError::configuration(
                "reward outbound penalization factor must lie in [0, 1]",
            ));
        }
        if self.file_output.enabled && self.file_output.frequency == 0 {
            return Err(EngineError::configuration(
                "file output frequency must be at least 1",
            ));
        }
        Ok(())
    }
}
