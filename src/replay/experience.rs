//! Experience and policy-snapshot types stored in the replay memory.

use serde::{Deserialize, Serialize};

/// Stable identifier of an experience. Ids increase monotonically with
/// insertion order and stay valid until the experience is evicted.
pub type ExperienceId = u64;

/// How an episode's experience terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationKind {
    /// The experience is not the last one of its episode.
    NonTerminal,
    /// Last experience of a normally ended episode.
    Terminal,
    /// Last experience of an episode that was cut short (e.g. step limit).
    /// The state the episode would have continued from is kept for
    /// bootstrapping.
    Truncated,
}

impl TerminationKind {
    /// Whether this experience closes its episode.
    pub fn ends_episode(&self) -> bool {
        !matches!(self, TerminationKind::NonTerminal)
    }
}

/// Policy information captured when an action is produced, stored by value so
/// that aging experiences keep a self-contained record of the policy that
/// generated them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// State value V(s) estimated by the policy.
    pub state_value: f64,
    /// Parameters of the action distribution; layout is learner-defined.
    pub distribution_parameters: Vec<f64>,
    /// Index of the selected action, for discrete policies.
    pub action_index: usize,
    /// Per-action probabilities, for discrete policies.
    pub action_probabilities: Vec<f64>,
    /// Pre-squashing action, for bounded continuous policies.
    pub unbounded_action: Vec<f64>,
}

impl PolicySnapshot {
    /// Snapshot with only a state value, for value-only evaluations.
    pub fn with_state_value(state_value: f64) -> Self {
        Self {
            state_value,
            ..Default::default()
        }
    }
}

/// A single environment step stored for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub state: Vec<f64>,
    pub action: Vec<f64>,
    /// Reward after rescaling and penalization, as consumed by the learner.
    pub reward: f64,
    pub termination: TerminationKind,
    /// Episode this experience belongs to. Episodes are appended atomically,
    /// so experiences of one episode are contiguous in insertion order.
    pub episode_id: u64,
    /// Position of this experience within its episode.
    pub episode_position: usize,
    /// Policy at the moment the action was taken.
    pub behavior_policy: PolicySnapshot,
    /// Most recent re-evaluation of the policy at this state.
    pub current_policy: PolicySnapshot,
    /// Latest importance weight π_cur(a|s) / π_old(a|s).
    pub importance_weight: f64,
    /// Importance weight truncated at c_max.
    pub truncated_importance_weight: f64,
    /// Retrace value estimate for this state.
    pub retrace_value: f64,
    /// Whether the importance weight lies within the current cutoff band.
    pub is_on_policy: bool,
    pub environment_id: usize,
    /// Present iff `termination == Truncated`: the state the episode was cut
    /// at, used to bootstrap the retrace recursion.
    pub truncated_state: Option<Vec<f64>>,
    /// State value of `truncated_state`, evaluated when the episode was
    /// absorbed.
    pub truncated_state_value: f64,
    /// Priority for prioritized mini-batch selection.
    pub priority: f64,
    /// Selection probability assigned by the last prioritized draw.
    pub probability: f64,
}

impl Experience {
    /// Create a freshly collected experience. The behavior policy doubles as
    /// the current policy and the importance weight starts at 1 (on-policy by
    /// construction).
    pub fn new(
        state: Vec<f64>,
        action: Vec<f64>,
        reward: f64,
        termination: TerminationKind,
        episode_id: u64,
        episode_position: usize,
        behavior_policy: PolicySnapshot,
        environment_id: usize,
    ) -> Self {
        let current_policy = behavior_policy.clone();
        Self {
            state,
            action,
            reward,
            termination,
            episode_id,
            episode_position,
            behavior_policy,
            current_policy,
            importance_weight: 1.0,
            truncated_importance_weight: 1.0,
            retrace_value: 0.0,
            is_on_policy: true,
            environment_id,
            truncated_state: None,
            truncated_state_value: 0.0,
            priority: 1.0,
            probability: 0.0,
        }
    }

    /// Attach the truncation bootstrap state and its value.
    pub fn with_truncated_state(mut self, state: Vec<f64>, state_value: f64) -> Self {
        self.truncated_state = Some(state);
        self.truncated_state_value = state_value;
        self
    }
}
