//! Bounded experience replay memory.
//!
//! The buffer is a ring of capacity `C` over stable, monotonically increasing
//! experience ids: `id - start_id()` maps an id to its slot, and an id stays
//! valid until its experience is evicted from the front. Episodes are appended
//! atomically, so the experiences of one episode are contiguous in insertion
//! order.
//!
//! The buffer is owned by the coordinator's cooperative thread. Appends happen
//! only while collecting and sampling only while updating, so ids handed to a
//! sampler are never invalidated mid-batch.

use crate::error::{EngineError, Result};
use crate::interfaces::PolicyLearner;
use crate::replay::experience::{Experience, ExperienceId};
use crate::replay::retrace::{compute_retrace, RetraceBootstrap};
use rand::seq::index::sample as index_sample;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Floor added to refreshed priorities so no stored experience becomes
/// unreachable under prioritized selection.
const PRIORITY_FLOOR: f64 = 1e-6;

/// Parameters of a metadata refresh pass.
pub struct MetadataRefresh<'a> {
    /// Learner computing importance weights for recorded actions.
    pub learner: &'a dyn PolicyLearner,
    /// Discount factor γ for the retrace recursion.
    pub discount: f64,
    /// Truncation level c_max for importance weights.
    pub truncation_level: f64,
    /// Current on-policy cutoff band: on-policy iff `1/cutoff ≤ w ≤ cutoff`.
    pub cutoff: f64,
}

/// Serializable image of the buffer contents, used by checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayState {
    pub start_id: ExperienceId,
    pub experiences: Vec<Experience>,
}

/// Bounded FIFO of experiences with per-slot metadata.
pub struct ReplayBuffer {
    capacity: usize,
    entries: VecDeque<Experience>,
    /// Id of the oldest stored experience.
    start_id: ExperienceId,
    off_policy_count: usize,
    per_environment: Vec<usize>,
    /// Exponent of the prioritized-selection correction, annealed toward 1.
    correction_exponent: f64,
    correction_annealing_rate: f64,
}

impl ReplayBuffer {
    /// Create an empty buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "replay capacity must be positive");
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            start_id: 0,
            off_policy_count: 0,
            per_environment: Vec::new(),
            correction_exponent: 0.5,
            correction_annealing_rate: 1e-5,
        }
    }

    /// Number of stored experiences.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer holds no experiences.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Id of the oldest stored experience.
    pub fn start_id(&self) -> ExperienceId {
        self.start_id
    }

    /// One past the id of the newest stored experience.
    pub fn end_id(&self) -> ExperienceId {
        self.start_id + self.entries.len() as ExperienceId
    }

    /// Number of stored experiences currently classified off-policy.
    pub fn off_policy_count(&self) -> usize {
        self.off_policy_count
    }

    /// Fraction of stored experiences classified off-policy.
    pub fn off_policy_ratio(&self) -> f64 {
        if self.entries.is_empty() {
            0.0
        } else {
            self.off_policy_count as f64 / self.entries.len() as f64
        }
    }

    /// Per-environment experience counts, indexed by environment id.
    pub fn environment_counts(&self) -> &[usize] {
        &self.per_environment
    }

    fn index_of(&self, id: ExperienceId) -> Option<usize> {
        if id >= self.start_id && id < self.end_id() {
            Some((id - self.start_id) as usize)
        } else {
            None
        }
    }

    /// Access an experience by id. `None` once it has been evicted.
    pub fn get(&self, id: ExperienceId) -> Option<&Experience> {
        self.index_of(id).and_then(|i| self.entries.get(i))
    }

    fn get_mut(&mut self, id: ExperienceId) -> Option<&mut Experience> {
        self.index_of(id).and_then(move |i| self.entries.get_mut(i))
    }

    /// Append an experience, evicting the oldest one when full. Returns the
    /// id assigned to the new experience.
    pub fn append(&mut self, experience: Experience) -> ExperienceId {
        if self.entries.len() == self.capacity {
            let evicted = self.entries.pop_front().expect("capacity is positive");
            self.start_id += 1;
            if !evicted.is_on_policy {
                self.off_policy_count -= 1;
            }
            self.per_environment[evicted.environment_id] -= 1;
        }

        if experience.environment_id >= self.per_environment.len() {
            self.per_environment.resize(experience.environment_id + 1, 0);
        }
        self.per_environment[experience.environment_id] += 1;
        if !experience.is_on_policy {
            self.off_policy_count += 1;
        }

        let id = self.end_id();
        self.entries.push_back(experience);
        id
    }

    /// Draw a mini-batch of ids, uniformly without replacement. Returns the
    /// ids in ascending order.
    pub fn sample_uniform<R: Rng>(&self, count: usize, rng: &mut R) -> Vec<ExperienceId> {
        assert!(
            count <= self.entries.len(),
            "mini-batch larger than buffer contents"
        );
        let mut ids: Vec<ExperienceId> = index_sample(rng, self.entries.len(), count)
            .into_iter()
            .map(|i| self.start_id + i as ExperienceId)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Draw a mini-batch of ids proportionally to stored priorities, with
    /// replacement. Updates every experience's selection probability and
    /// anneals the correction exponent toward 1. Returns ids ascending;
    /// duplicates are possible and handled idempotently downstream.
    pub fn sample_prioritized<R: Rng>(&mut self, count: usize, rng: &mut R) -> Vec<ExperienceId> {
        assert!(!self.entries.is_empty(), "cannot sample an empty buffer");

        let total: f64 = self.entries.iter().map(|e| e.priority).sum();
        let len = self.entries.len();
        for entry in self.entries.iter_mut() {
            entry.probability = entry.priority / total;
        }

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let mut remaining = rng.gen_range(0.0..total);
            let mut picked = len - 1;
            for (i, entry) in self.entries.iter().enumerate() {
                if remaining < entry.priority {
                    picked = i;
                    break;
                }
                remaining -= entry.priority;
            }
            ids.push(self.start_id + picked as ExperienceId);
        }
        ids.sort_unstable();

        self.correction_exponent +=
            self.correction_annealing_rate * (1.0 - self.correction_exponent);
        ids
    }

    /// Correction weight `(N · P(i))^{-β}` for a prioritized draw. Callers
    /// normalize by the batch maximum.
    pub fn correction_weight(&self, id: ExperienceId) -> f64 {
        match self.get(id) {
            Some(e) if e.probability > 0.0 => {
                (self.entries.len() as f64 * e.probability).powf(-self.correction_exponent)
            }
            _ => 1.0,
        }
    }

    /// Refresh the metadata of a mini-batch against freshly evaluated
    /// policies, then recompute the retrace values of every touched episode.
    ///
    /// For each pair `(id, policy)`: the importance weight becomes
    /// `π_cur(a|s) / π_old(a|s)`, truncated at c_max; the on-policy flag is
    /// `1/cutoff ≤ w ≤ cutoff`; the stored current policy is replaced.
    /// Applying the same refresh twice yields identical metadata.
    pub fn update_metadata(
        &mut self,
        ids: &[ExperienceId],
        policies: &[crate::replay::experience::PolicySnapshot],
        refresh: &MetadataRefresh<'_>,
    ) -> Result<()> {
        assert_eq!(ids.len(), policies.len(), "one policy per mini-batch entry");

        let mut episodes: Vec<u64> = Vec::with_capacity(ids.len());
        for (&id, policy) in ids.iter().zip(policies.iter()) {
            let cutoff = refresh.cutoff;
            let truncation = refresh.truncation_level;
            let index = self
                .index_of(id)
                .ok_or_else(|| EngineError::evaluation(format!("experience {} evicted", id)))?;
            let entry = &self.entries[index];
            let weight =
                refresh
                    .learner
                    .importance_weight(&entry.action, policy, &entry.behavior_policy);
            if !weight.is_finite() || weight < 0.0 {
                return Err(EngineError::evaluation(format!(
                    "importance weight for experience {} is not finite: {}",
                    id, weight
                )));
            }
            let on_policy = weight >= 1.0 / cutoff && weight <= cutoff;
            if entry.is_on_policy != on_policy {
                if on_policy {
                    self.off_policy_count -= 1;
                } else {
                    self.off_policy_count += 1;
                }
            }

            let entry = &mut self.entries[index];
            entry.importance_weight = weight;
            entry.truncated_importance_weight = weight.min(truncation);
            entry.is_on_policy = on_policy;
            entry.current_policy = policy.clone();
            episodes.push(entry.episode_id);
        }

        episodes.sort_unstable();
        episodes.dedup();
        for episode in episodes {
            self.refresh_episode_retrace(episode, refresh.discount);
        }

        // Refreshed priorities follow the TD residual of the new retrace
        // estimate.
        for &id in ids {
            let entry = self.get_mut(id).expect("presence checked above");
            entry.priority =
                (entry.retrace_value - entry.current_policy.state_value).abs() + PRIORITY_FLOOR;
        }

        Ok(())
    }

    /// Recompute the retrace values of one stored episode by walking backward
    /// from its closing experience. The closing experience bootstraps with
    /// zero at a terminal and with the cut state's value at a truncation.
    pub fn refresh_episode_retrace(&mut self, episode_id: u64, discount: f64) {
        let Some((first, last)) = self.episode_range(episode_id) else {
            return;
        };

        let len = last - first + 1;
        let mut rewards = Vec::with_capacity(len);
        let mut values = Vec::with_capacity(len);
        let mut weights = Vec::with_capacity(len);
        for i in first..=last {
            let e = &self.entries[i];
            rewards.push(e.reward);
            values.push(e.current_policy.state_value);
            weights.push(e.truncated_importance_weight);
        }

        let closing = &self.entries[last];
        debug_assert!(closing.termination.ends_episode());
        let bootstrap = match closing.termination {
            crate::replay::experience::TerminationKind::Truncated => {
                RetraceBootstrap::TruncatedState(closing.truncated_state_value)
            }
            _ => RetraceBootstrap::Terminal,
        };

        let retrace = compute_retrace(&rewards, &values, &weights, bootstrap, discount);
        for (offset, value) in retrace.into_iter().enumerate() {
            self.entries[first + offset].retrace_value = value;
        }
    }

    /// Contiguous slot range `[first, last]` of an episode, if any of it is
    /// still stored. Episode ids are non-decreasing in insertion order, so the
    /// range is found by binary search.
    fn episode_range(&self, episode_id: u64) -> Option<(usize, usize)> {
        let len = self.entries.len();
        if len == 0 {
            return None;
        }
        let first = partition_point(len, |i| self.entries[i].episode_id < episode_id);
        if first == len || self.entries[first].episode_id != episode_id {
            return None;
        }
        let last = partition_point(len, |i| self.entries[i].episode_id <= episode_id) - 1;
        Some((first, last))
    }

    /// Re-evaluate every stored on-policy flag against a new cutoff and
    /// recompute the off-policy count.
    pub fn reclassify(&mut self, cutoff: f64) {
        let mut off_policy = 0;
        for entry in self.entries.iter_mut() {
            let w = entry.importance_weight;
            entry.is_on_policy = w >= 1.0 / cutoff && w <= cutoff;
            if !entry.is_on_policy {
                off_policy += 1;
            }
        }
        self.off_policy_count = off_policy;
    }

    /// States of the contiguous sequence of at most `max_len` experiences of
    /// the same episode ending at `id`, oldest first. Used to build state
    /// time sequences for recurrent learners.
    pub fn state_sequence(&self, id: ExperienceId, max_len: usize) -> Vec<&[f64]> {
        let Some(index) = self.index_of(id) else {
            return Vec::new();
        };
        let episode = self.entries[index].episode_id;
        let mut first = index;
        while first > 0
            && index - (first - 1) < max_len
            && self.entries[first - 1].episode_id == episode
        {
            first -= 1;
        }
        (first..=index).map(|i| self.entries[i].state.as_slice()).collect()
    }

    /// Apply a transformation to every stored state, truncation states
    /// included. Used to fold stored experiences into a freshly frozen
    /// normalization.
    pub fn map_states(&mut self, transform: impl Fn(&mut [f64])) {
        for entry in self.entries.iter_mut() {
            transform(&mut entry.state);
            if let Some(state) = entry.truncated_state.as_mut() {
                transform(state);
            }
        }
    }

    /// Export the full contents for checkpointing.
    pub fn export_state(&self) -> ReplayState {
        ReplayState {
            start_id: self.start_id,
            experiences: self.entries.iter().cloned().collect(),
        }
    }

    /// Rebuild a buffer from checkpointed contents.
    pub fn from_state(capacity: usize, state: ReplayState) -> Result<Self> {
        if state.experiences.len() > capacity {
            return Err(EngineError::checkpoint(format!(
                "replay contents ({}) exceed configured capacity ({})",
                state.experiences.len(),
                capacity
            )));
        }
        let mut buffer = ReplayBuffer::new(capacity);
        buffer.start_id = state.start_id;
        for experience in state.experiences {
            if experience.environment_id >= buffer.per_environment.len() {
                buffer
                    .per_environment
                    .resize(experience.environment_id + 1, 0);
            }
            buffer.per_environment[experience.environment_id] += 1;
            if !experience.is_on_policy {
                buffer.off_policy_count += 1;
            }
            buffer.entries.push_back(experience);
        }
        Ok(buffer)
    }
}

fn partition_point(len: usize, mut pred: impl FnMut(usize) -> bool) -> usize {
    let mut low = 0;
    let mut high = len;
    while low < high {
        let mid = (low + high) / 2;
        if pred(mid) {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    low
}
