//! Top-level generation loop and termination predicates.

use crate::agent::AgentLoop;
use crate::checkpoint::{Checkpoint, Checkpointer};
use crate::config::{EngineConfig, Mode};
use crate::error::Result;
use crate::interfaces::{Environment, Problem};
use crate::messages::WorkerCommand;
use crate::metrics::{GenerationSnapshot, MetricsLogger};
use crate::optimizer::OptimizerLoop;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};

/// Progress counters. Lifetime counters persist across checkpoint resumes;
/// the session mirrors restart at zero so a resumed run reports only its own
/// progress.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counters {
    pub generation: usize,
    pub fitness_evaluation_count: usize,
    pub experience_count: usize,
    pub episode_count: usize,
    pub policy_update_count: usize,
    #[serde(skip)]
    pub session_generation: usize,
    #[serde(skip)]
    pub session_experience_count: usize,
    #[serde(skip)]
    pub session_episode_count: usize,
    #[serde(skip)]
    pub session_policy_update_count: usize,
}

/// Why a run ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    MaxGenerations,
    MaxFitnessEvaluations,
    MaxExperiences,
    MaxPolicyUpdates,
    MaxEpisodes,
    /// The distribution updater's own convergence predicate fired.
    UpdaterConverged,
    TargetAverageReward,
    /// A testing run finished its configured episodes.
    TestingComplete,
}

/// Top-level loop: checks termination predicates, advances the generation
/// counter and invokes the per-generation routine of the active mode.
pub struct GenerationDriver {
    config: EngineConfig,
    counters: Counters,
}

impl GenerationDriver {
    /// Create a driver with fresh counters.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            counters: Counters::default(),
        }
    }

    /// Create a driver resuming from checkpointed counters. Session mirrors
    /// start at zero.
    pub fn with_counters(config: EngineConfig, counters: Counters) -> Self {
        Self { config, counters }
    }

    /// Current counters.
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Predicates for optimizer mode, in evaluation order.
    fn optimizer_termination(&self, optimizer: &OptimizerLoop) -> Option<TerminationReason> {
        let termination = &self.config.termination;
        if let Some(max) = termination.max_generations {
            if self.counters.generation >= max {
                return Some(TerminationReason::MaxGenerations);
            }
        }
        if let Some(max) = termination.max_fitness_evaluations {
            if self.counters.fitness_evaluation_count >= max {
                return Some(TerminationReason::MaxFitnessEvaluations);
            }
        }
        if optimizer.check_termination() {
            return Some(TerminationReason::UpdaterConverged);
        }
        None
    }

    /// Predicates for agent mode, in evaluation order.
    fn agent_termination(&self, agent: &AgentLoop) -> Option<TerminationReason> {
        let termination = &self.config.termination;
        if let Some(max) = termination.max_generations {
            if self.counters.generation >= max {
                return Some(TerminationReason::MaxGenerations);
            }
        }
        if let Some(max) = termination.max_experiences {
            if self.counters.experience_count >= max {
                return Some(TerminationReason::MaxExperiences);
            }
        }
        if let Some(max) = termination.max_policy_updates {
            if self.counters.policy_update_count >= max {
                return Some(TerminationReason::MaxPolicyUpdates);
            }
        }
        if let Some(max) = termination.max_episodes {
            if self.counters.episode_count >= max {
                return Some(TerminationReason::MaxEpisodes);
            }
        }
        if let Some(target) = termination.target_average_reward {
            if self.counters.episode_count > 0 && agent.history().average_reward >= target {
                return Some(TerminationReason::TargetAverageReward);
            }
        }
        None
    }

    /// Send finalize to every worker rank and pass the closing barrier.
    fn finalize<T: Transport>(&self, transport: &T) -> Result<()> {
        for rank in 1..transport.rank_count() {
            transport.send(rank, WorkerCommand::Finalize.into())?;
        }
        transport.barrier()
    }

    /// Drive optimizer mode to termination.
    pub fn run_optimizer<T: Transport>(
        &mut self,
        transport: &T,
        problem: &dyn Problem,
        optimizer: &mut OptimizerLoop,
        logger: &mut dyn MetricsLogger,
    ) -> Result<TerminationReason> {
        let reason = loop {
            if let Some(reason) = self.optimizer_termination(optimizer) {
                break reason;
            }
            optimizer.run_generation(transport, problem, &mut self.counters)?;
            self.counters.generation += 1;
            self.counters.session_generation += 1;

            logger.log(
                &GenerationSnapshot::new(self.counters.generation)
                    .with_fitness(
                        self.counters.fitness_evaluation_count,
                        optimizer.best_fitness(),
                    ),
            );
        };
        logger.flush();
        optimizer.print_results();
        self.finalize(transport)?;
        Ok(reason)
    }

    /// Drive agent mode to termination. In testing mode the policy runs its
    /// configured episodes and the average return is reported through the
    /// returned snapshot of the last generation.
    pub fn run_agent<T: Transport>(
        &mut self,
        transport: &T,
        environment: &mut dyn Environment,
        agent: &mut AgentLoop,
        logger: &mut dyn MetricsLogger,
        checkpointer: Option<&mut Checkpointer>,
    ) -> Result<(TerminationReason, Option<f64>)> {
        if self.config.mode == Mode::Testing {
            let average = agent.run_testing(transport, environment)?;
            self.finalize(transport)?;
            return Ok((TerminationReason::TestingComplete, Some(average)));
        }

        let mut checkpointer = checkpointer;
        let reason = loop {
            if let Some(reason) = self.agent_termination(agent) {
                break reason;
            }
            agent.run_training_generation(transport, environment, &mut self.counters)?;
            self.counters.generation += 1;
            self.counters.session_generation += 1;

            logger.log(
                &GenerationSnapshot::new(self.counters.generation)
                    .with_training(
                        self.counters.episode_count,
                        self.counters.experience_count,
                        self.counters.policy_update_count,
                        agent.history().average_reward,
                        agent.history().best_reward,
                    )
                    .with_off_policy(
                        agent.buffer().off_policy_ratio(),
                        agent.controller().learning_rate(),
                        agent.controller().cutoff(),
                    ),
            );

            if let Some(checkpointer) = checkpointer.as_deref_mut() {
                if checkpointer.should_save(self.counters.generation) {
                    let checkpoint = Checkpoint {
                        counters: self.counters.clone(),
                        agent: Some(agent.export_state()),
                        replay: agent.export_replay(),
                        off_policy: Some(agent.export_off_policy()),
                        hyperparameters: agent.export_hyperparameters(),
                    };
                    checkpointer.save(&checkpoint)?;
                }
            }
        };
        logger.flush();
        self.finalize(transport)?;
        Ok((reason, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TerminationCriteria;

    #[test]
    fn test_counters_serde_skips_session_fields() {
        let counters = Counters {
            generation: 5,
            experience_count: 100,
            session_generation: 5,
            session_experience_count: 100,
            ..Default::default()
        };
        let json = serde_json::to_string(&counters).unwrap();
        let restored: Counters = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.generation, 5);
        assert_eq!(restored.experience_count, 100);
        assert_eq!(restored.session_generation, 0);
        assert_eq!(restored.session_experience_count, 0);
    }

    #[test]
    fn test_max_generations_predicate() {
        let config = EngineConfig::new().with_termination(TerminationCriteria {
            max_generations: Some(3),
            ..Default::default()
        });
        let mut driver = GenerationDriver::new(config.clone());
        let optimizer = OptimizerLoop::new(&config, Box::new(NoOpUpdater), 1);
        assert!(driver.optimizer_termination(&optimizer).is_none());
        driver.counters.generation = 3;
        assert_eq!(
            driver.optimizer_termination(&optimizer),
            Some(TerminationReason::MaxGenerations)
        );
    }

    #[test]
    fn test_fitness_evaluation_cap() {
        let config = EngineConfig::new().with_termination(TerminationCriteria {
            max_fitness_evaluations: Some(100),
            ..Default::default()
        });
        let mut driver = GenerationDriver::new(config.clone());
        let optimizer = OptimizerLoop::new(&config, Box::new(NoOpUpdater), 1);
        driver.counters.fitness_evaluation_count = 100;
        assert_eq!(
            driver.optimizer_termination(&optimizer),
            Some(TerminationReason::MaxFitnessEvaluations)
        );
    }

    struct NoOpUpdater;

    impl crate::interfaces::DistributionUpdater for NoOpUpdater {
        fn initialize(&mut self) -> Result<()> {
            Ok(())
        }

        fn generate_wave(&mut self, _samples: &mut [f64]) {}

        fn update_distribution(&mut self, _fitness: &[f64]) {}
    }
}
