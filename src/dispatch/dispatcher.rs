//! Per-generation fan-out of a sample wave over the worker pool.

use crate::dispatch::worker_pool::WorkerPool;
use crate::dispatch::SampleMatrix;
use crate::error::{EngineError, Result};
use crate::interfaces::Problem;
use crate::messages::{Message, RankId, WorkerCommand, WorkerEvent};
use crate::transport::Transport;

/// Coordinator-side dispatcher for fitness waves.
///
/// One wave runs at a time: every sample is dispatched exactly once, every
/// dispatched sample's fitness is received before the wave closes, and each
/// worker holds at most one sample concurrently. Results map to their slot by
/// the sample index carried in the completion event.
pub struct SampleDispatcher {
    pool: WorkerPool,
    lambda: usize,
    fitness: Vec<f64>,
    received: Vec<bool>,
    received_count: usize,
    /// Entry `i` true blocks sample `i` from dispatch. Reserved for
    /// constraint-aware waves; no in-tree updater sets it, and all-false
    /// reproduces the unconstrained schedule.
    dependency: Vec<bool>,
    executed: Vec<bool>,
    executed_count: usize,
    completed_per_worker: Vec<usize>,
}

impl SampleDispatcher {
    /// Create a dispatcher for waves of `lambda` samples.
    pub fn new(lambda: usize, rank_count: usize, coordinator_evaluates: bool) -> Self {
        Self {
            pool: WorkerPool::new(rank_count, coordinator_evaluates),
            lambda,
            fitness: vec![f64::NAN; lambda],
            received: vec![false; lambda],
            received_count: 0,
            dependency: vec![false; lambda],
            executed: vec![false; lambda],
            executed_count: 0,
            completed_per_worker: vec![0; rank_count],
        }
    }

    /// The worker pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Wave size λ.
    pub fn lambda(&self) -> usize {
        self.lambda
    }

    /// Number of samples handed to workers in the current wave.
    pub fn executed_count(&self) -> usize {
        self.executed_count
    }

    /// Lifetime count of completed evaluations per worker rank.
    pub fn completed_per_worker(&self) -> &[usize] {
        &self.completed_per_worker
    }

    /// Mark a sample as blocked or unblocked for the current wave. Reserved
    /// hook for constraint-aware updaters.
    pub fn set_dependency(&mut self, sample: usize, blocked: bool) {
        self.dependency[sample] = blocked;
    }

    /// Run one wave: broadcast `samples` to all ranks, fan the λ evaluations
    /// out over the pool and collect the fitness vector back.
    pub fn run_wave<T: Transport>(
        &mut self,
        transport: &T,
        problem: &dyn Problem,
        samples: &SampleMatrix,
    ) -> Result<&[f64]> {
        assert_eq!(samples.lambda(), self.lambda, "wave size mismatch");

        self.fitness.fill(f64::NAN);
        self.received.fill(false);
        self.received_count = 0;
        self.dependency.fill(false);
        self.executed.fill(false);
        self.executed_count = 0;

        // Workers post their receive side before the collective starts.
        for rank in 1..transport.rank_count() {
            transport.send(rank, WorkerCommand::PrepareBroadcast.into())?;
        }
        transport.broadcast(0, samples.data())?;

        while self.executed_count < self.lambda {
            let mut dispatched_any = false;
            for sample in 0..self.lambda {
                if self.dependency[sample] || self.executed[sample] {
                    continue;
                }
                let worker = self.check_out(transport, problem, samples)?;
                transport.send(worker, WorkerCommand::evaluate(sample).into())?;
                self.executed[sample] = true;
                self.executed_count += 1;
                dispatched_any = true;
            }
            if !dispatched_any && self.executed_count < self.lambda {
                // Every remaining sample is dependency-blocked. Completions
                // are the only thing that can unblock them.
                if self.received_count == self.executed_count {
                    return Err(EngineError::evaluation(
                        "dependency vector blocks all remaining samples",
                    ));
                }
                let message = transport.wait()?;
                self.handle(message, transport, problem, samples)?;
            }
        }

        while self.received_count < self.lambda {
            let message = transport.wait()?;
            self.handle(message, transport, problem, samples)?;
        }

        Ok(&self.fitness)
    }

    /// Block until an idle worker is available, pumping transport progress.
    fn check_out<T: Transport>(
        &mut self,
        transport: &T,
        problem: &dyn Problem,
        samples: &SampleMatrix,
    ) -> Result<RankId> {
        loop {
            if let Some(worker) = self.pool.try_check_out() {
                return Ok(worker);
            }
            let message = transport.wait()?;
            self.handle(message, transport, problem, samples)?;
            for message in transport.poll()? {
                self.handle(message, transport, problem, samples)?;
            }
        }
    }

    /// Apply one incoming message. Completion handling only mutates plain
    /// fields and returns; it never re-enters the dispatch loop.
    fn handle<T: Transport>(
        &mut self,
        message: Message,
        transport: &T,
        problem: &dyn Problem,
        samples: &SampleMatrix,
    ) -> Result<()> {
        match message {
            Message::Event(WorkerEvent::FitnessReady {
                worker,
                sample,
                fitness,
            }) => {
                if !fitness.is_finite() {
                    return Err(EngineError::evaluation(format!(
                        "fitness for sample {} is not finite: {}",
                        sample, fitness
                    )));
                }
                if self.received[sample] {
                    return Err(EngineError::transport(format!(
                        "duplicate fitness for sample {}",
                        sample
                    )));
                }
                self.fitness[sample] = fitness;
                self.received[sample] = true;
                self.received_count += 1;
                self.completed_per_worker[worker] += 1;
                self.pool.check_in(worker)?;
            }
            // The coordinator checked itself out: evaluate locally and loop
            // the completion through the own inbox.
            Message::Command(WorkerCommand::Evaluate { sample }) => {
                let fitness = problem.evaluate_fitness(samples.row(sample));
                transport.send(
                    transport.rank_id(),
                    WorkerEvent::FitnessReady {
                        worker: transport.rank_id(),
                        sample,
                        fitness,
                    }
                    .into(),
                )?;
            }
            Message::Event(WorkerEvent::Fault { worker, detail }) => {
                return Err(EngineError::evaluation(format!(
                    "worker {} failed: {}",
                    worker, detail
                )));
            }
            other => {
                return Err(EngineError::transport(format!(
                    "unexpected message during wave: {:?}",
                    other
                )));
            }
        }
        Ok(())
    }
}

/// Worker main loop for optimization mode.
///
/// Pumps the inbox, posts the broadcast receive when told to, evaluates
/// samples on demand and reports fitness values back by index. A finalize
/// command clears the evaluation flag, and the loop closes with the final
/// collective barrier.
pub fn optimizer_worker_main<T: Transport>(transport: &T, problem: &dyn Problem) -> Result<()> {
    let dimension = problem.parameter_count();
    let mut samples: Vec<f64> = Vec::new();
    let mut continue_evaluations = true;

    while continue_evaluations {
        match transport.wait()? {
            Message::Command(WorkerCommand::PrepareBroadcast) => {
                samples = transport.broadcast(0, &[])?;
            }
            Message::Command(WorkerCommand::Evaluate { sample }) => {
                let start = sample * dimension;
                // A missing or short broadcast poisons the wave with NaN,
                // which the coordinator turns into an evaluation failure.
                let fitness = samples
                    .get(start..start + dimension)
                    .map(|x| problem.evaluate_fitness(x))
                    .unwrap_or(f64::NAN);
                transport.send(
                    0,
                    WorkerEvent::FitnessReady {
                        worker: transport.rank_id(),
                        sample,
                        fitness,
                    }
                    .into(),
                )?;
            }
            Message::Command(WorkerCommand::Finalize) => continue_evaluations = false,
            _ => {}
        }
    }

    transport.barrier()
}
