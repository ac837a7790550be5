//! Instructions sent from the coordinator to workers.

/// Coordinator-to-worker instruction.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// A collective broadcast of the sample matrix is about to start; the
    /// worker must post its receive side.
    PrepareBroadcast,

    /// Evaluate the fitness of sample `sample` of the current wave.
    Evaluate { sample: usize },

    /// Run one episode of environment `environment_id`, reporting steps under
    /// the in-flight slot `slot`.
    StartEpisode { slot: usize, environment_id: usize },

    /// The action answering the last state the worker shipped for `slot`.
    Action { slot: usize, action: Vec<f64> },

    /// Clean shutdown: clear the evaluation flag and leave the main loop.
    Finalize,
}

impl WorkerCommand {
    /// Whether this command terminates the worker loop.
    pub fn is_finalize(&self) -> bool {
        matches!(self, WorkerCommand::Finalize)
    }

    /// Convenience constructor for an evaluation order.
    pub fn evaluate(sample: usize) -> Self {
        WorkerCommand::Evaluate { sample }
    }

    /// Convenience constructor for an episode start.
    pub fn start_episode(slot: usize, environment_id: usize) -> Self {
        WorkerCommand::StartEpisode {
            slot,
            environment_id,
        }
    }
}
