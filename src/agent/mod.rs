//! Agent-mode generation logic: episode collection, replay absorption and
//! policy updates.
//!
//! The coordinator alternates between attending in-flight episodes (answering
//! each shipped state with an action from the current policy) and gradient
//! updates gated by the replay start size and the off-policy controller. The
//! same worker-pool discipline as the fitness dispatcher applies: checking a
//! worker out pumps transport progress, completion handling only mutates
//! plain fields.

pub mod rescaling;

pub use rescaling::{RewardRescaling, StateRescaling};

use crate::config::{EngineConfig, MiniBatchStrategy};
use crate::dispatch::worker_pool::WorkerPool;
use crate::driver::Counters;
use crate::error::{EngineError, Result};
use crate::interfaces::{Environment, EpisodeLink, PolicyLearner};
use crate::messages::{Message, RankId, WorkerCommand, WorkerEvent};
use crate::replay::{
    Experience, MetadataRefresh, OffPolicyController, PolicySnapshot, ReplayBuffer,
    TerminationKind,
};
use crate::transport::Transport;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256StarStar;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Per-episode reward bookkeeping kept across the whole run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Undiscounted return of every completed training episode.
    pub reward_history: Vec<f64>,
    /// Environment id of every completed training episode.
    pub environment_history: Vec<usize>,
    /// Experience count of every completed training episode.
    pub experience_history: Vec<usize>,
    /// Running average over the configured depth.
    pub average_reward: f64,
    pub last_reward: f64,
    pub best_reward: f64,
    pub best_episode: u64,
}

impl TrainingHistory {
    fn record(&mut self, episode_id: u64, environment_id: usize, length: usize, ret: f64, depth: usize) {
        self.reward_history.push(ret);
        self.environment_history.push(environment_id);
        self.experience_history.push(length);
        self.last_reward = ret;
        if self.reward_history.len() == 1 || ret > self.best_reward {
            self.best_reward = ret;
            self.best_episode = episode_id;
        }
        let window = self.reward_history.len().min(depth);
        let tail = &self.reward_history[self.reward_history.len() - window..];
        self.average_reward = tail.iter().sum::<f64>() / window as f64;
    }
}

/// An episode being collected, owned by its in-flight slot until completion.
#[derive(Debug)]
struct InFlightEpisode {
    worker: RankId,
    environment_id: usize,
    episode_id: u64,
    states: Vec<Vec<f64>>,
    actions: Vec<Vec<f64>>,
    policies: Vec<PolicySnapshot>,
    rewards: Vec<f64>,
}

/// A fully collected episode, ready to be absorbed into the replay memory.
#[derive(Debug)]
struct CompletedEpisode {
    environment_id: usize,
    episode_id: u64,
    states: Vec<Vec<f64>>,
    actions: Vec<Vec<f64>>,
    policies: Vec<PolicySnapshot>,
    rewards: Vec<f64>,
    termination: TerminationKind,
    truncated_state: Option<Vec<f64>>,
}

/// Serializable agent state carried by checkpoints, next to the replay
/// contents and the learner hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub history: TrainingHistory,
    pub state_rescaling: Option<StateRescaling>,
    pub reward_rescaling: RewardRescaling,
    pub next_episode_id: u64,
    pub outbound_penalization_count: usize,
    pub rng: Xoshiro256StarStar,
}

/// Coordinator-side agent state machine.
pub struct AgentLoop {
    config: EngineConfig,
    learner: Box<dyn PolicyLearner>,
    buffer: ReplayBuffer,
    controller: OffPolicyController,
    pool: WorkerPool,
    rng: Xoshiro256StarStar,
    history: TrainingHistory,
    state_rescaling: Option<StateRescaling>,
    reward_rescaling: RewardRescaling,
    rescaling_done: bool,
    in_flight: Vec<Option<InFlightEpisode>>,
    completed: VecDeque<CompletedEpisode>,
    next_episode_id: u64,
    outbound_penalization_count: usize,
    environment_count: usize,
}

impl AgentLoop {
    /// Create the agent loop. `environment_count` is the number of distinct
    /// environment variants episodes cycle through.
    pub fn new(
        config: EngineConfig,
        learner: Box<dyn PolicyLearner>,
        environment_count: usize,
    ) -> Self {
        let buffer = ReplayBuffer::new(config.experience_replay.maximum_size);
        let controller =
            OffPolicyController::new(&config.experience_replay.off_policy, config.learning_rate);
        let pool = WorkerPool::new(config.rank_count, config.coordinator_evaluates);
        let rng = Xoshiro256StarStar::seed_from_u64(config.seed);
        let slots = config.concurrent_environments;
        Self {
            config,
            learner,
            buffer,
            controller,
            pool,
            rng,
            history: TrainingHistory::default(),
            state_rescaling: None,
            reward_rescaling: RewardRescaling::new(environment_count),
            rescaling_done: false,
            in_flight: (0..slots).map(|_| None).collect(),
            completed: VecDeque::new(),
            next_episode_id: 0,
            outbound_penalization_count: 0,
            environment_count,
        }
    }

    /// The replay memory.
    pub fn buffer(&self) -> &ReplayBuffer {
        &self.buffer
    }

    /// The off-policy controller.
    pub fn controller(&self) -> &OffPolicyController {
        &self.controller
    }

    /// Training reward bookkeeping.
    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// The policy learner.
    pub fn learner(&self) -> &dyn PolicyLearner {
        &*self.learner
    }

    /// Count of penalized out-of-bound actions.
    pub fn outbound_penalization_count(&self) -> usize {
        self.outbound_penalization_count
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.iter().filter(|slot| slot.is_some()).count()
    }

    /// Run one training generation: collect `episodes_per_generation`
    /// episodes, absorb them, and interleave gated policy updates.
    pub fn run_training_generation<T: Transport>(
        &mut self,
        transport: &T,
        environment: &mut dyn Environment,
        counters: &mut Counters,
    ) -> Result<()> {
        let target = self.config.episodes_per_generation;
        let mut launched = 0;
        let mut absorbed = 0;

        while absorbed < target {
            while self.in_flight_count() < self.config.concurrent_environments
                && launched < target
            {
                self.launch_episode(transport, environment)?;
                launched += 1;
            }

            if self.completed.is_empty() {
                if self.in_flight_count() == 0 {
                    return Err(EngineError::transport(
                        "no in-flight episodes and none completed",
                    ));
                }
                self.pump(transport)?;
            }

            while let Some(episode) = self.completed.pop_front() {
                self.absorb(episode, counters)?;
                absorbed += 1;
            }

            self.maybe_freeze_rescaling();

            if self.buffer.len() >= self.config.experience_replay.start_size {
                while self.update_gate_open(counters)
                    && self.buffer.len() >= self.config.mini_batch_size
                {
                    self.update_policy(counters)?;
                }
            }
        }

        Ok(())
    }

    /// Run the configured number of testing episodes and return the average
    /// undiscounted return. Replay and updates are untouched.
    pub fn run_testing<T: Transport>(
        &mut self,
        transport: &T,
        environment: &mut dyn Environment,
    ) -> Result<f64> {
        let target = self.config.policy_testing_episodes;
        let mut launched = 0;
        let mut finished = 0;
        let mut total = 0.0;

        while finished < target {
            while self.in_flight_count() < self.config.concurrent_environments
                && launched < target
            {
                self.launch_episode(transport, environment)?;
                launched += 1;
            }

            if self.completed.is_empty() {
                if self.in_flight_count() == 0 {
                    return Err(EngineError::transport(
                        "no in-flight episodes and none completed",
                    ));
                }
                self.pump(transport)?;
            }

            while let Some(episode) = self.completed.pop_front() {
                total += episode.rewards.iter().sum::<f64>();
                finished += 1;
            }
        }

        Ok(total / target as f64)
    }

    /// Start one episode on the next idle worker; the coordinator runs its
    /// own episodes inline.
    fn launch_episode<T: Transport>(
        &mut self,
        transport: &T,
        environment: &mut dyn Environment,
    ) -> Result<()> {
        let slot = self
            .in_flight
            .iter()
            .position(|entry| entry.is_none())
            .expect("caller checked the in-flight budget");

        let worker = self.check_out(transport)?;
        let environment_id = (self.next_episode_id as usize) % self.environment_count;
        self.in_flight[slot] = Some(InFlightEpisode {
            worker,
            environment_id,
            episode_id: self.next_episode_id,
            states: Vec::new(),
            actions: Vec::new(),
            policies: Vec::new(),
            rewards: Vec::new(),
        });
        self.next_episode_id += 1;

        if worker == transport.rank_id() {
            let mut link = InlineEpisodeLink { agent: self, slot };
            environment.run_episode(environment_id, &mut link)?;
            self.pool.check_in(worker)?;
        } else {
            transport.send(
                worker,
                WorkerCommand::start_episode(slot, environment_id).into(),
            )?;
        }
        Ok(())
    }

    /// Block until an idle worker is available, pumping transport progress.
    fn check_out<T: Transport>(&mut self, transport: &T) -> Result<RankId> {
        loop {
            if let Some(worker) = self.pool.try_check_out() {
                return Ok(worker);
            }
            self.pump(transport)?;
        }
    }

    /// Wait for at least one message and drain whatever else arrived.
    fn pump<T: Transport>(&mut self, transport: &T) -> Result<()> {
        let message = transport.wait()?;
        self.handle(message, transport)?;
        for message in transport.poll()? {
            self.handle(message, transport)?;
        }
        Ok(())
    }

    fn handle<T: Transport>(&mut self, message: Message, transport: &T) -> Result<()> {
        match message {
            Message::Event(WorkerEvent::EpisodeStep {
                worker,
                slot,
                state,
                reward,
            }) => {
                let action = self.attend_step(slot, state, reward)?;
                transport.send(worker, WorkerCommand::Action { slot, action }.into())?;
            }
            Message::Event(WorkerEvent::EpisodeEnd {
                worker,
                slot,
                termination,
                reward,
                truncated_state,
            }) => {
                self.attend_end(slot, termination, reward, truncated_state)?;
                self.pool.check_in(worker)?;
            }
            Message::Event(WorkerEvent::Fault { worker, detail }) => {
                return Err(EngineError::evaluation(format!(
                    "worker {} failed: {}",
                    worker, detail
                )));
            }
            other => {
                return Err(EngineError::transport(format!(
                    "unexpected message while collecting: {:?}",
                    other
                )));
            }
        }
        Ok(())
    }

    /// Record one step of an in-flight episode and produce the answering
    /// action.
    fn attend_step(&mut self, slot: usize, mut state: Vec<f64>, reward: f64) -> Result<Vec<f64>> {
        if self.rescaling_done {
            if let Some(rescaling) = &self.state_rescaling {
                rescaling.normalize(&mut state);
            }
        }

        let episode = self.in_flight[slot]
            .as_mut()
            .ok_or_else(|| EngineError::transport(format!("step for empty slot {}", slot)))?;
        if !episode.states.is_empty() {
            episode.rewards.push(reward);
        }

        let (action, policy) = self.learner.action(&state);
        let episode = self.in_flight[slot].as_mut().expect("checked above");
        episode.states.push(state);
        episode.actions.push(action.clone());
        episode.policies.push(policy);
        Ok(action)
    }

    /// Close an in-flight episode and queue it for absorption.
    fn attend_end(
        &mut self,
        slot: usize,
        termination: TerminationKind,
        reward: f64,
        mut truncated_state: Option<Vec<f64>>,
    ) -> Result<()> {
        let episode = self.in_flight[slot]
            .take()
            .ok_or_else(|| EngineError::transport(format!("end for empty slot {}", slot)))?;
        if !termination.ends_episode() {
            return Err(EngineError::transport(
                "episode closed with a non-terminal kind",
            ));
        }

        let mut rewards = episode.rewards;
        rewards.push(reward);
        if rewards.len() != episode.states.len() {
            return Err(EngineError::transport(format!(
                "episode {} closed with {} rewards for {} states",
                episode.episode_id,
                rewards.len(),
                episode.states.len()
            )));
        }

        if self.rescaling_done {
            if let (Some(rescaling), Some(state)) = (&self.state_rescaling, &mut truncated_state) {
                rescaling.normalize(state);
            }
        }

        self.completed.push_back(CompletedEpisode {
            environment_id: episode.environment_id,
            episode_id: episode.episode_id,
            states: episode.states,
            actions: episode.actions,
            policies: episode.policies,
            rewards,
            termination,
            truncated_state,
        });
        Ok(())
    }

    /// Post-process a completed episode and move it into the replay memory.
    fn absorb(&mut self, episode: CompletedEpisode, counters: &mut Counters) -> Result<()> {
        let length = episode.states.len();
        let raw_return: f64 = episode.rewards.iter().sum();

        // Statistics accumulate until the one-time freeze.
        if !self.rescaling_done {
            if self.config.state_rescaling_enabled {
                let rescaling = self
                    .state_rescaling
                    .get_or_insert_with(|| StateRescaling::new(episode.states[0].len()));
                for state in &episode.states {
                    rescaling.observe(state);
                }
            }
            if self.config.reward_rescaling_enabled {
                for &reward in &episode.rewards {
                    self.reward_rescaling.observe(episode.environment_id, reward);
                }
            }
        }

        // Re-evaluate the episode's states under the current policy for the
        // retrace seed.
        let state_refs: Vec<&[f64]> = episode.states.iter().map(|s| s.as_slice()).collect();
        let fresh_policies = self.learner.run_policy(&state_refs)?;

        let truncated_state_value = match (&episode.truncated_state, episode.termination) {
            (Some(state), TerminationKind::Truncated) => {
                self.learner.run_policy(&[state.as_slice()])?[0].state_value
            }
            (None, TerminationKind::Truncated) => {
                return Err(EngineError::transport(
                    "truncated episode without a truncated state",
                ));
            }
            _ => 0.0,
        };

        let bounds = self
            .learner
            .action_bounds()
            .map(|(lower, upper)| (lower.to_vec(), upper.to_vec()));

        for position in 0..length {
            let mut reward = episode.rewards[position];

            if self.config.reward_outbound_penalization.enabled {
                if let Some((lower, upper)) = &bounds {
                    let out = episode.actions[position]
                        .iter()
                        .zip(lower.iter().zip(upper.iter()))
                        .any(|(a, (lo, hi))| a < lo || a > hi);
                    if out {
                        reward *= self.config.reward_outbound_penalization.factor;
                        self.outbound_penalization_count += 1;
                    }
                }
            }

            if self.rescaling_done && self.config.reward_rescaling_enabled {
                reward = self.reward_rescaling.scale(episode.environment_id, reward);
                if !reward.is_finite() {
                    return Err(EngineError::evaluation(format!(
                        "rescaled reward for environment {} is not finite",
                        episode.environment_id
                    )));
                }
            }

            let termination = if position + 1 == length {
                episode.termination
            } else {
                TerminationKind::NonTerminal
            };

            let mut experience = Experience::new(
                episode.states[position].clone(),
                episode.actions[position].clone(),
                reward,
                termination,
                episode.episode_id,
                position,
                episode.policies[position].clone(),
                episode.environment_id,
            );
            experience.current_policy = fresh_policies[position].clone();
            if position + 1 == length && termination == TerminationKind::Truncated {
                experience = experience.with_truncated_state(
                    episode.truncated_state.clone().expect("checked above"),
                    truncated_state_value,
                );
            }
            self.buffer.append(experience);
        }

        self.buffer
            .refresh_episode_retrace(episode.episode_id, self.config.discount_factor);

        counters.experience_count += length;
        counters.session_experience_count += length;
        counters.episode_count += 1;
        counters.session_episode_count += 1;

        self.history.record(
            episode.episode_id,
            episode.environment_id,
            length,
            raw_return,
            self.config.training_average_depth,
        );
        Ok(())
    }

    /// Freeze the normalization statistics once the replay memory passes the
    /// start size.
    fn maybe_freeze_rescaling(&mut self) {
        if self.rescaling_done
            || self.buffer.len() < self.config.experience_replay.start_size
        {
            return;
        }
        if !self.config.state_rescaling_enabled && !self.config.reward_rescaling_enabled {
            self.rescaling_done = true;
            return;
        }

        if self.config.state_rescaling_enabled {
            if let Some(rescaling) = &mut self.state_rescaling {
                rescaling.freeze();
            }
        }
        if self.config.reward_rescaling_enabled {
            self.reward_rescaling.freeze();
        }

        // Stored experiences join the same normalization as future ones.
        if let Some(rescaling) = &self.state_rescaling {
            if self.config.state_rescaling_enabled {
                self.buffer.map_states(|state| rescaling.normalize(state));
            }
        }

        self.rescaling_done = true;
    }

    /// Gate for the update loop: enough experiences must have accumulated
    /// beyond the start size to pay for the next update.
    fn update_gate_open(&self, counters: &Counters) -> bool {
        let start_size = self.config.experience_replay.start_size;
        if counters.experience_count < start_size {
            return false;
        }
        let surplus = (counters.experience_count - start_size) as f64;
        self.config.experiences_between_policy_updates
            * counters.policy_update_count as f64
            <= surplus
    }

    /// One gated update: draw a mini-batch, refresh its metadata, step the
    /// learner, tick the off-policy controller.
    fn update_policy(&mut self, counters: &mut Counters) -> Result<()> {
        let batch_size = self.config.mini_batch_size;
        let ids = match self.config.mini_batch_strategy {
            MiniBatchStrategy::Uniform => self.buffer.sample_uniform(batch_size, &mut self.rng),
            MiniBatchStrategy::Prioritized => {
                self.buffer.sample_prioritized(batch_size, &mut self.rng)
            }
        };

        let policies = {
            let states: Vec<&[f64]> = ids
                .iter()
                .map(|&id| self.buffer.get(id).expect("sampled id is live").state.as_slice())
                .collect();
            self.learner.run_policy(&states)?
        };

        let refresh = MetadataRefresh {
            learner: &*self.learner,
            discount: self.config.discount_factor,
            truncation_level: self.config.importance_weight_truncation_level,
            cutoff: self.controller.cutoff(),
        };
        self.buffer.update_metadata(&ids, &policies, &refresh)?;

        self.learner
            .step(&self.buffer, &ids, self.controller.learning_rate())?;
        counters.policy_update_count += 1;
        counters.session_policy_update_count += 1;

        self.controller
            .tick(self.buffer.off_policy_count(), self.buffer.len());
        self.buffer.reclassify(self.controller.cutoff());
        Ok(())
    }

    /// Export the agent state for checkpointing.
    pub fn export_state(&self) -> AgentState {
        AgentState {
            history: self.history.clone(),
            state_rescaling: self.state_rescaling.clone(),
            reward_rescaling: self.reward_rescaling.clone(),
            next_episode_id: self.next_episode_id,
            outbound_penalization_count: self.outbound_penalization_count,
            rng: self.rng.clone(),
        }
    }

    /// Export the replay contents, when serialization is enabled.
    pub fn export_replay(&self) -> Option<crate::replay::ReplayState> {
        if self.config.experience_replay.serialize {
            Some(self.buffer.export_state())
        } else {
            None
        }
    }

    /// Export the off-policy controller state.
    pub fn export_off_policy(&self) -> crate::replay::OffPolicyState {
        self.controller.export_state()
    }

    /// Export the learner hyperparameters.
    pub fn export_hyperparameters(&self) -> serde_json::Value {
        self.learner.export_hyperparameters()
    }

    /// Restore agent, replay, controller and learner state from a
    /// checkpoint.
    pub fn restore(
        &mut self,
        state: AgentState,
        replay: Option<crate::replay::ReplayState>,
        off_policy: &crate::replay::OffPolicyState,
        hyperparameters: serde_json::Value,
    ) -> Result<()> {
        self.rescaling_done = state
            .state_rescaling
            .as_ref()
            .map(|r| r.is_frozen())
            .unwrap_or(false)
            || state.reward_rescaling.is_frozen();
        self.history = state.history;
        self.state_rescaling = state.state_rescaling;
        self.reward_rescaling = state.reward_rescaling;
        self.next_episode_id = state.next_episode_id;
        self.outbound_penalization_count = state.outbound_penalization_count;
        self.rng = state.rng;
        if let Some(replay) = replay {
            self.buffer =
                ReplayBuffer::from_state(self.config.experience_replay.maximum_size, replay)?;
        }
        self.controller.restore_state(off_policy);
        self.learner.import_hyperparameters(hyperparameters)?;
        Ok(())
    }
}

/// Episode link used when the coordinator runs an episode itself: exchanges
/// go straight to the attend handlers, no messages involved.
struct InlineEpisodeLink<'a> {
    agent: &'a mut AgentLoop,
    slot: usize,
}

impl EpisodeLink for InlineEpisodeLink<'_> {
    fn exchange(&mut self, state: &[f64], reward: f64) -> Result<Vec<f64>> {
        self.agent.attend_step(self.slot, state.to_vec(), reward)
    }

    fn finish(
        &mut self,
        termination: TerminationKind,
        reward: f64,
        truncated_state: Option<&[f64]>,
    ) -> Result<()> {
        self.agent.attend_end(
            self.slot,
            termination,
            reward,
            truncated_state.map(|s| s.to_vec()),
        )
    }
}
