//! Top-level run assembly.
//!
//! Builds the rank fabric, spawns the worker loops, runs the generation
//! driver on rank 0 and joins everything back together. All engine-owned
//! threads live exactly as long as one run.

use crate::agent::AgentLoop;
use crate::checkpoint::Checkpointer;
use crate::config::EngineConfig;
use crate::dispatch::{agent_worker_main, optimizer_worker_main};
use crate::driver::{Counters, GenerationDriver, TerminationReason};
use crate::error::{EngineError, Result};
use crate::interfaces::{DistributionUpdater, Environment, PolicyLearner, Problem};
use crate::messages::RankId;
use crate::metrics::MetricsLogger;
use crate::transport::Transport;
use crate::optimizer::OptimizerLoop;
use crate::transport::LocalFabric;
use std::thread::JoinHandle;

/// Result of an optimization run.
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    pub reason: TerminationReason,
    pub generations: usize,
    pub fitness_evaluations: usize,
    pub best_fitness: f64,
    pub best_parameters: Vec<f64>,
}

/// Result of a training or testing run.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub reason: TerminationReason,
    pub generations: usize,
    pub episodes: usize,
    pub experiences: usize,
    pub policy_updates: usize,
    pub average_reward: f64,
    pub best_reward: f64,
    /// Average return of a testing run; `None` in training mode.
    pub testing_average_reward: Option<f64>,
}

/// Print the single-line rank-0 diagnostic for a fatal error and return the
/// process exit code.
pub fn report_fatal(error: &EngineError) -> i32 {
    eprintln!("fatal: {}", error);
    error.exit_code()
}

/// Release workers after a coordinator-side failure: they may be blocked on
/// their inboxes or mid-episode, and only a finalize followed by the closing
/// barrier lets every rank leave its loop.
fn emergency_shutdown<T: crate::transport::Transport>(transport: &T) {
    for rank in 1..transport.rank_count() {
        let _ = transport.send(rank, crate::messages::WorkerCommand::Finalize.into());
    }
    let _ = transport.barrier();
}

fn join_workers(
    handles: Vec<JoinHandle<Result<()>>>,
    driver_result: Result<TerminationReason>,
) -> Result<TerminationReason> {
    let mut worker_error = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(error)) => worker_error = Some(error),
            Err(_) => worker_error = Some(EngineError::transport("worker thread panicked")),
        }
    }
    // The coordinator's verdict wins; worker errors surface only when rank 0
    // terminated cleanly.
    let reason = driver_result?;
    match worker_error {
        Some(error) => Err(error),
        None => Ok(reason),
    }
}

/// Run a full optimization: fan waves of candidates out over the fabric until
/// a termination predicate fires.
///
/// `problem_factory` is invoked once per rank; each instance stays on its
/// rank's thread for the whole run.
pub fn run_optimization<P, F>(
    config: EngineConfig,
    updater: Box<dyn DistributionUpdater>,
    mut problem_factory: F,
    logger: &mut dyn MetricsLogger,
) -> Result<OptimizationOutcome>
where
    P: Problem + 'static,
    F: FnMut(RankId) -> P,
{
    config.validate()?;

    let coordinator_problem = problem_factory(0);
    coordinator_problem.validate()?;
    let dimension = coordinator_problem.parameter_count();

    let mut endpoints = LocalFabric::create(config.rank_count);
    let coordinator = endpoints.remove(0);

    let mut handles = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let problem = problem_factory(endpoint.rank_id());
        let handle = std::thread::Builder::new()
            .name(format!("worker-{}", endpoint.rank_id()))
            .spawn(move || optimizer_worker_main(&endpoint, &problem))
            .map_err(|e| EngineError::transport(format!("failed to spawn worker: {}", e)))?;
        handles.push(handle);
    }

    let mut optimizer = OptimizerLoop::new(&config, updater, dimension);
    let mut driver = GenerationDriver::new(config);

    let driver_result = optimizer
        .initialize()
        .and_then(|()| driver.run_optimizer(&coordinator, &coordinator_problem, &mut optimizer, logger));

    if driver_result.is_err() {
        emergency_shutdown(&coordinator);
    }
    drop(coordinator);
    let reason = join_workers(handles, driver_result)?;

    let counters = driver.counters();
    Ok(OptimizationOutcome {
        reason,
        generations: counters.generation,
        fitness_evaluations: counters.fitness_evaluation_count,
        best_fitness: optimizer.best_fitness(),
        best_parameters: optimizer.best_sample().to_vec(),
    })
}

/// Run a full training (or testing) session of the reinforcement-learning
/// agent.
///
/// `environment_factory` is invoked once per rank. When file output is
/// enabled and a checkpoint exists under its path, the run resumes from it:
/// lifetime counters, replay contents, controller state and the learner
/// hyperparameters are restored, and session counters restart at zero.
pub fn run_training<E, F>(
    config: EngineConfig,
    learner: Box<dyn PolicyLearner>,
    mut environment_factory: F,
    logger: &mut dyn MetricsLogger,
) -> Result<TrainingOutcome>
where
    E: Environment + 'static,
    F: FnMut(RankId) -> E,
{
    config.validate()?;

    let mut coordinator_environment = environment_factory(0);
    let environment_count = coordinator_environment.environment_count();

    let mut agent = AgentLoop::new(config.clone(), learner, environment_count);
    let mut counters = Counters::default();
    let mut checkpointer = None;

    if config.file_output.enabled {
        if let Some(checkpoint) = Checkpointer::load_latest(&config.file_output.path)? {
            let agent_state = checkpoint.agent.ok_or_else(|| {
                EngineError::checkpoint("checkpoint carries no agent state")
            })?;
            let off_policy = checkpoint.off_policy.ok_or_else(|| {
                EngineError::checkpoint("checkpoint carries no off-policy state")
            })?;
            agent.restore(
                agent_state,
                checkpoint.replay,
                &off_policy,
                checkpoint.hyperparameters,
            )?;
            counters = checkpoint.counters;
        }
        checkpointer = Some(Checkpointer::new(config.file_output.clone())?);
    }

    let mut endpoints = LocalFabric::create(config.rank_count);
    let coordinator = endpoints.remove(0);

    let mut handles = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let mut environment = environment_factory(endpoint.rank_id());
        let handle = std::thread::Builder::new()
            .name(format!("worker-{}", endpoint.rank_id()))
            .spawn(move || agent_worker_main(&endpoint, &mut environment))
            .map_err(|e| EngineError::transport(format!("failed to spawn worker: {}", e)))?;
        handles.push(handle);
    }

    let mut driver = GenerationDriver::with_counters(config, counters);
    let driver_result = driver.run_agent(
        &coordinator,
        &mut coordinator_environment,
        &mut agent,
        logger,
        checkpointer.as_mut(),
    );

    let (driver_result, testing_average) = match driver_result {
        Ok((reason, testing_average)) => (Ok(reason), testing_average),
        Err(error) => {
            emergency_shutdown(&coordinator);
            (Err(error), None)
        }
    };
    drop(coordinator);
    let reason = join_workers(handles, driver_result)?;

    let counters = driver.counters();
    Ok(TrainingOutcome {
        reason,
        generations: counters.generation,
        episodes: counters.episode_count,
        experiences: counters.experience_count,
        policy_updates: counters.policy_update_count,
        average_reward: agent.history().average_reward,
        best_reward: agent.history().best_reward,
        testing_average_reward: testing_average,
    })
}
